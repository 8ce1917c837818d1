//! Zone lookup for chunk placement constraints
//!
//! A zone is a labeled set of key ranges that restricts which shards may own
//! the chunks inside it. The engine never moves a chunk across a zone
//! boundary, so each phase takes a read-only snapshot of the zone table at
//! construction time and consults it through [`ZoneIndex`].

use crate::types::ChunkRange;

/// Read-only snapshot of the zone ranges of one collection.
#[derive(Debug, Clone, Default)]
pub struct ZoneIndex {
    /// Non-overlapping zone ranges, sorted by min bound
    entries: Vec<(ChunkRange, String)>,
}

impl ZoneIndex {
    /// Build an index from the catalog's range-to-tag listing. Ranges are
    /// assumed non-overlapping (the catalog enforces this on write).
    pub fn new(mut ranges: Vec<(ChunkRange, String)>) -> Self {
        ranges.sort_by(|(a, _), (b, _)| a.min.cmp(&b.min));
        Self { entries: ranges }
    }

    /// The zone tag owning `range`, or `None` when the range is unzoned.
    ///
    /// Chunks never straddle zone boundaries, so a chunk either lies fully
    /// inside one zone range or fully outside all of them.
    pub fn zone_for_range(&self, range: &ChunkRange) -> Option<&str> {
        let idx = self.entries.partition_point(|(zone, _)| zone.min <= range.min);
        if idx == 0 {
            return None;
        }
        let (zone, tag) = &self.entries[idx - 1];
        if range.max <= zone.max {
            Some(tag)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyBound;

    fn range(min: &[u8], max: &[u8]) -> ChunkRange {
        ChunkRange::new(KeyBound::key(min.to_vec()), KeyBound::key(max.to_vec()))
    }

    #[test]
    fn test_empty_index_is_unzoned() {
        let index = ZoneIndex::new(Vec::new());
        assert!(index.is_empty());
        assert_eq!(index.zone_for_range(&range(b"a", b"b")), None);
    }

    #[test]
    fn test_lookup_inside_zone() {
        let index = ZoneIndex::new(vec![
            (range(b"a", b"m"), "eu".to_string()),
            (range(b"m", b"z"), "us".to_string()),
        ]);

        assert_eq!(index.zone_for_range(&range(b"a", b"c")), Some("eu"));
        assert_eq!(index.zone_for_range(&range(b"c", b"m")), Some("eu"));
        assert_eq!(index.zone_for_range(&range(b"m", b"p")), Some("us"));
    }

    #[test]
    fn test_lookup_outside_zones() {
        let index = ZoneIndex::new(vec![(range(b"c", b"f"), "eu".to_string())]);

        // Before the first zone
        assert_eq!(index.zone_for_range(&range(b"a", b"b")), None);
        // After the last zone
        assert_eq!(index.zone_for_range(&range(b"g", b"h")), None);
        // Full key space
        let full = ChunkRange::new(KeyBound::MinKey, KeyBound::MaxKey);
        assert_eq!(index.zone_for_range(&full), None);
    }

    #[test]
    fn test_unsorted_input_is_sorted_on_build() {
        let index = ZoneIndex::new(vec![
            (range(b"m", b"z"), "us".to_string()),
            (range(b"a", b"m"), "eu".to_string()),
        ]);
        assert_eq!(index.zone_for_range(&range(b"b", b"c")), Some("eu"));
        assert_eq!(index.zone_for_range(&range(b"n", b"o")), Some("us"));
    }
}
