//! Availability index used to pick the rarest piece to download next.
use std::collections::HashMap;

/// Maps incomplete piece index to the number of `Active` sessions known
/// to have it. Complete pieces are absent from the map entirely.
#[derive(Debug, Default)]
pub struct RarestIndex {
    availability: HashMap<usize, u32>,
}

impl RarestIndex {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            availability: (0..num_pieces).map(|i| (i, 0)).collect(),
        }
    }

    pub fn on_have(&mut self, piece_index: usize) {
        if let Some(count) = self.availability.get_mut(&piece_index) {
            *count += 1;
        }
    }

    pub fn on_bitfield(&mut self, bits: &[bool]) {
        for (i, &has) in bits.iter().enumerate() {
            if has {
                self.on_have(i);
            }
        }
    }

    /// Called when a session with `bitfield` disconnects, releasing its
    /// contribution to every piece it had.
    pub fn on_session_closed(&mut self, bitfield: &[bool]) {
        for (i, &has) in bitfield.iter().enumerate() {
            if has {
                if let Some(count) = self.availability.get_mut(&i) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Removes a piece from consideration once it's verified complete.
    pub fn on_piece_complete(&mut self, piece_index: usize) {
        self.availability.remove(&piece_index);
    }

    /// An incomplete piece with the minimum positive availability, or
    /// `None` if no tracked piece currently has any known holder.
    pub fn rarest(&self) -> Option<usize> {
        self.rarest_excluding(&std::collections::HashSet::new())
    }

    /// Like `rarest`, but skips any piece index present in `excluded`. Lets
    /// a caller fall through to the next-rarest piece when the rarest one
    /// has no peer currently willing to serve it.
    pub fn rarest_excluding(&self, excluded: &std::collections::HashSet<usize>) -> Option<usize> {
        self.availability
            .iter()
            .filter(|(index, &count)| count > 0 && !excluded.contains(index))
            .min_by_key(|(&index, &count)| (count, index))
            .map(|(&index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rarest_picks_minimum_positive_availability() {
        let mut idx = RarestIndex::new(3);
        idx.on_have(0);
        idx.on_have(0);
        idx.on_have(1);
        assert_eq!(idx.rarest(), Some(1));
    }

    #[test]
    fn pieces_with_zero_availability_are_ignored() {
        let idx = RarestIndex::new(3);
        assert_eq!(idx.rarest(), None);
    }

    #[test]
    fn completed_pieces_are_removed_from_consideration() {
        let mut idx = RarestIndex::new(2);
        idx.on_have(0);
        idx.on_have(1);
        idx.on_piece_complete(0);
        assert_eq!(idx.rarest(), Some(1));
    }

    #[test]
    fn session_close_releases_its_contribution() {
        let mut idx = RarestIndex::new(2);
        idx.on_bitfield(&[true, true]);
        idx.on_session_closed(&[true, false]);
        assert_eq!(idx.availability.get(&0), Some(&0));
        assert_eq!(idx.availability.get(&1), Some(&1));
    }
}
