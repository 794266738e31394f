//! Torrent file structure and parsing logic.
//!
//! This module defines the TorrentFile struct and related helpers for parsing, validating, and working with .torrent file metadata.
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;

use super::TorrentError;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

type Result<T> = std::result::Result<T, TorrentError>;

#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub length: Option<i64>,
    pub files: Vec<FileDict>,
    pub is_directory: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileDict {
    pub length: i64,
    pub path: Vec<String>,
}

/// Parses the concatenated SHA-1 hashes from the `pieces` string.
///
/// The `pieces` key within the `info` dictionary is a single string that is
/// a concatenation of 20-byte SHA-1 hashes, one per piece, in piece-index
/// order.
#[tracing::instrument(level = "trace")]
fn parse_pieces(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let num_pieces = pieces_bytes.len() / 20;
    let mut hashes = Vec::with_capacity(num_pieces);
    for i in 0..num_pieces {
        let start = i * 20;
        let end = start + 20;

        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(&pieces_bytes[start..end]);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

/// Parses the announce list from the torrent file.
///
/// Takes a `BencodeValue` expected to be a list of tiers, each a list of
/// tracker URL strings, and flattens it into `Vec<Vec<String>>` preserving
/// tier order.
fn parse_announce_list(value: BencodeValue) -> Result<Vec<Vec<String>>> {
    match value {
        BencodeValue::List(tiers) => {
            let mut result = Vec::new();
            for tier in tiers {
                match tier {
                    BencodeValue::List(trackers) => {
                        let mut tier_vec = Vec::new();
                        for tracker in trackers {
                            match tracker {
                                BencodeValue::String(s) => {
                                    tier_vec.push(String::from_utf8(s).map_err(|e| {
                                        TorrentError::InvalidFormat(format!(
                                            "Invalid tracker URL (not UTF-8): {}",
                                            e
                                        ))
                                    })?);
                                }
                                _ => {
                                    return Err(TorrentError::InvalidFormat(
                                        "Tracker URL not a string".to_string(),
                                    ));
                                }
                            }
                        }
                        result.push(tier_vec);
                    }
                    _ => {
                        return Err(TorrentError::InvalidFormat(
                            "Announce tier not a list".to_string(),
                        ));
                    }
                }
            }
            Ok(result)
        }
        _ => Err(TorrentError::InvalidFormat("Announce-list not a list".to_string())),
    }
}

/// Parses the info dictionary from the torrent file.
fn parse_info_dict(value: BencodeValue) -> Result<InfoDict> {
    let dict = match value {
        BencodeValue::Dict(d) => d,
        _ => {
            return Err(TorrentError::InvalidFormat("Info is not a dictionary".to_string()));
        }
    };

    let piece_length = match dict.get(&b"piece length".to_vec()) {
        Some(BencodeValue::Integer(i)) => *i,
        _ => return Err(TorrentError::MissingField("piece length".to_string())),
    };
    if piece_length <= 0 {
        return Err(TorrentError::InvalidFormat(
            "piece length must be positive".to_string(),
        ));
    }

    let pieces_bytes = match dict.get(&b"pieces".to_vec()) {
        Some(BencodeValue::String(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces".to_string())),
    };

    let private = match dict.get(&b"private".to_vec()) {
        Some(BencodeValue::Integer(1)) => true,
        _ => false,
    };

    let name = match dict.get(&b"name".to_vec()) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("Invalid name (not UTF-8): {}", e)))?,
        _ => return Err(TorrentError::MissingField("name".to_string())),
    };

    let length = match dict.get(&b"length".to_vec()) {
        Some(BencodeValue::Integer(i)) => Some(*i),
        _ => None,
    };

    let files = match dict.get(&b"files".to_vec()) {
        Some(BencodeValue::List(list)) => {
            let mut files_vec = Vec::new();
            for file_val in list {
                if let BencodeValue::Dict(file_dict) = file_val {
                    let length = match file_dict.get(&b"length".to_vec()) {
                        Some(BencodeValue::Integer(i)) => *i,
                        _ => {
                            return Err(TorrentError::MissingField("file length".to_string()));
                        }
                    };

                    let path = match file_dict.get(&b"path".to_vec()) {
                        Some(BencodeValue::List(path_list)) => {
                            let mut path_vec = Vec::new();
                            for p in path_list {
                                if let BencodeValue::String(s) = p {
                                    path_vec.push(String::from_utf8(s.clone()).map_err(|e| {
                                        TorrentError::InvalidFormat(format!(
                                            "Invalid file path (not UTF-8): {}",
                                            e
                                        ))
                                    })?);
                                } else {
                                    return Err(TorrentError::InvalidFormat(
                                        "File path component not a string".to_string(),
                                    ));
                                }
                            }
                            path_vec
                        }
                        _ => return Err(TorrentError::MissingField("file path".to_string())),
                    };

                    files_vec.push(FileDict { length, path });
                } else {
                    return Err(TorrentError::InvalidFormat("File entry not a dict".to_string()));
                }
            }
            files_vec
        }
        _ => Vec::new(),
    };

    if length.is_none() && files.is_empty() {
        return Err(TorrentError::MissingField(
            "either length or files must be present".to_string(),
        ));
    }

    let is_directory = !files.is_empty();

    Ok(InfoDict {
        piece_length,
        pieces: pieces_bytes,
        private,
        name,
        length,
        files,
        is_directory,
    })
}

impl TorrentFile {
    /// Returns the total length of all files in the torrent.
    pub fn total_length(&self) -> i64 {
        if !self.info.is_directory {
            self.info.length.unwrap_or(0)
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    /// Returns the total number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    /// Returns the size of a specific piece in the torrent.
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            let total_length = self.total_length();
            let full_pieces_length = (self.num_pieces() - 1) as i64 * self.info.piece_length;
            let last_piece_size = total_length - full_pieces_length;

            if last_piece_size == 0 && self.num_pieces() > 0 {
                self.info.piece_length
            } else {
                last_piece_size
            }
        }
    }

    /// Returns the file paths (relative to the download root) that contain
    /// data for a specific piece in the torrent.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = (index as i64) * self.info.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut current_data_position: i64 = 0;
        let mut result_paths = Vec::new();
        if !self.info.is_directory {
            result_paths.push(PathBuf::from(&self.info.name));
        } else {
            for file_info in &self.info.files {
                let file_start = current_data_position;
                let file_end = file_start + file_info.length;
                if file_end > piece_start && file_start < piece_end {
                    let mut full_path = PathBuf::from(&self.info.name);
                    for component in &file_info.path {
                        full_path = full_path.join(component)
                    }
                    result_paths.push(full_path);
                }
                current_data_position = file_end;
            }
        }
        result_paths
    }

    /// Returns the `FileSegment`s describing which bytes of which output
    /// files hold the data for piece `index`, in ascending file-offset order.
    pub fn file_segments_for_piece(&self, index: usize) -> Vec<crate::piece::FileSegment> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = (index as i64) * self.info.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut segments = Vec::new();

        if !self.info.is_directory {
            let length = self.total_length().min(piece_end) - piece_start;
            segments.push(crate::piece::FileSegment {
                path: PathBuf::from(&self.info.name),
                file_offset: piece_start as u64,
                piece_offset: 0,
                length: length as u32,
            });
            return segments;
        }

        let mut current_data_position: i64 = 0;
        for file_info in &self.info.files {
            let file_start = current_data_position;
            let file_end = file_start + file_info.length;
            if file_end > piece_start && file_start < piece_end {
                let overlap_start = piece_start.max(file_start);
                let overlap_end = piece_end.min(file_end);
                let mut full_path = PathBuf::from(&self.info.name);
                for component in &file_info.path {
                    full_path = full_path.join(component);
                }
                segments.push(crate::piece::FileSegment {
                    path: full_path,
                    file_offset: (overlap_start - file_start) as u64,
                    piece_offset: (overlap_start - piece_start) as u32,
                    length: (overlap_end - overlap_start) as u32,
                });
            }
            current_data_position = file_end;
        }
        segments
    }

    /// Reads a `.torrent` file from disk and parses it.
    #[tracing::instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<TorrentFile> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// Parses the torrent file data into a `TorrentFile` struct.
    ///
    /// The info-hash is computed over the verbatim wire bytes of the `info`
    /// value (located via [`bencode::decoder::decode_root_with_span`]), not
    /// a re-encoding, so it is bit-exact even against producers that emit
    /// non-canonical key order.
    #[tracing::instrument(skip(data), level = "debug")]
    pub fn parse(data: &[u8]) -> Result<TorrentFile> {
        let (mut dict, info_span) = bencode::decoder::decode_root_with_span(data, b"info")?;
        let (info_start, info_end) =
            info_span.ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_hash = info_hash::calculate_info_hash(&data[info_start..info_end]);
        tracing::debug!(info_hash = %hex::encode(info_hash), "computed info hash");

        let announce_bytes = dict
            .remove(&b"announce".to_vec())
            .ok_or_else(|| TorrentError::MissingField("announce".to_string()))?;

        let announce = match announce_bytes {
            BencodeValue::String(s) => String::from_utf8(s).map_err(|e| {
                TorrentError::InvalidFormat(format!("Invalid announce Url (not UTF-8): {}", e))
            })?,
            _ => return Err(TorrentError::MissingField("announce(not string)".to_string())),
        };

        let info_dict_value = dict
            .remove(&b"info".to_vec())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;

        let info = parse_info_dict(info_dict_value)?;

        let announce_list = if let Some(announce_list_value) = dict.remove(&b"announce-list".to_vec()) {
            parse_announce_list(announce_list_value)?
        } else {
            Vec::new()
        };

        let creation_date = if let Some(data_value) = dict.remove(&b"creation date".to_vec()) {
            match data_value {
                BencodeValue::Integer(timestamp) => {
                    let secs = timestamp
                        .try_into()
                        .map_err(|_| TorrentError::DateParseError)?;
                    let duration = std::time::Duration::from_secs(secs);
                    Some(UNIX_EPOCH + duration)
                }
                _ => {
                    return Err(TorrentError::InvalidFormat(
                        "Creation date not an integer".to_string(),
                    ));
                }
            }
        } else {
            None
        };

        let comment = match dict.remove(&b"comment".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let created_by = match dict.remove(&b"created by".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let encoding = match dict.remove(&b"encoding".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };

        let pieces_hash = parse_pieces(&info.pieces)?;

        let torrent = TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        };

        let computed = torrent.num_pieces_from_length();
        if computed != torrent.num_pieces() {
            return Err(TorrentError::PieceCountMismatch {
                declared: torrent.num_pieces(),
                computed,
            });
        }

        Ok(torrent)
    }

    /// `ceil(total_length / piece_length)`, used to cross-check the piece
    /// count declared by the `pieces` hash table.
    fn num_pieces_from_length(&self) -> usize {
        let total = self.total_length();
        let piece_len = self.info.piece_length;
        if piece_len <= 0 {
            return 0;
        }
        ((total + piece_len - 1) / piece_len) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent(piece_hashes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce18:http://tracker/ann");
        out.extend_from_slice(b"4:infod6:lengthi10e4:name4:test12:piece lengthi10e6:pieces");
        out.extend_from_slice(format!("{}:", piece_hashes.len()).as_bytes());
        out.extend_from_slice(piece_hashes);
        out.extend_from_slice(b"ee");
        out
    }

    #[test]
    fn parses_single_file_torrent_and_derives_info_hash() {
        let hash = [7u8; 20];
        let data = single_file_torrent(&hash);
        let torrent = TorrentFile::parse(&data).unwrap();
        assert_eq!(torrent.announce, "http://tracker/ann");
        assert_eq!(torrent.total_length(), 10);
        assert_eq!(torrent.num_pieces(), 1);
        assert_eq!(torrent.pieces_hash[0], hash);

        let (_, span) = bencode::decoder::decode_root_with_span(&data, b"info").unwrap();
        let (s, e) = span.unwrap();
        assert_eq!(torrent.info_hash, info_hash::calculate_info_hash(&data[s..e]));
    }

    #[test]
    fn rejects_misaligned_pieces_table() {
        let data = single_file_torrent(&[1u8; 19]);
        let err = TorrentFile::parse(&data).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidPiecesHashLength));
    }

    #[test]
    fn multi_file_piece_boundaries() {
        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce3:foo4:infod5:filesld6:lengthi10000e4:pathl1:aeed6:lengthi30000e4:pathl1:beee4:name4:root12:piece lengthi16384e6:pieces");
        let num_pieces = (40000f64 / 16384f64).ceil() as usize;
        let hashes = vec![9u8; num_pieces * 20];
        out.extend_from_slice(format!("{}:", hashes.len()).as_bytes());
        out.extend_from_slice(&hashes);
        out.extend_from_slice(b"ee");

        let torrent = TorrentFile::parse(&out).unwrap();
        assert_eq!(torrent.total_length(), 40000);
        assert_eq!(torrent.num_pieces(), 3);

        let piece0_files = torrent.file_paths_for_piece(0);
        assert_eq!(piece0_files, vec![PathBuf::from("root/a"), PathBuf::from("root/b")]);

        let piece2_files = torrent.file_paths_for_piece(2);
        assert_eq!(piece2_files, vec![PathBuf::from("root/b")]);
    }
}
