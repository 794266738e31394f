use sha1::Digest;
use sha1::Sha1;

/// Computes the SHA-1 info-hash over the literal wire bytes of the `info`
/// value, as they appeared in the original metainfo file.
///
/// The hash must never be computed by re-encoding the parsed dictionary:
/// some producers emit `info` dictionary keys in non-canonical order, and a
/// re-encode through our own (correctly sorted) encoder would silently
/// produce a different, wrong hash for those files. `raw_info_bytes` is the
/// exact substring located by [`crate::bencode::decoder::decode_root_with_span`].
pub fn calculate_info_hash(raw_info_bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(raw_info_bytes);
    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);
    info_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_raw_bytes_directly() {
        let raw = b"d6:lengthi10e4:name4:teste";
        let hash = calculate_info_hash(raw);
        assert_eq!(hash.len(), 20);

        // Same bytes, same hash - the function must not depend on any
        // intermediate parsed representation.
        assert_eq!(hash, calculate_info_hash(raw));
    }

    #[test]
    fn reencoding_with_different_key_order_changes_the_hash() {
        // Two byte-for-byte-different encodings of "the same" dictionary
        // (one non-canonical key order) must hash differently, proving this
        // function is a pure byte hash and performs no canonicalization.
        let canonical = b"d4:name4:test6:lengthi10ee";
        let noncanonical = b"d6:lengthi10e4:name4:teste";
        assert_ne!(
            calculate_info_hash(canonical),
            calculate_info_hash(noncanonical)
        );
    }
}
