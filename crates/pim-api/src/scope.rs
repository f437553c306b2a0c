//! Selection scopes (spec §4.1, §9 "Scope as a tagged variant").
//!
//! A `Scope` is how every command argument names the set of collections,
//! items or tags it operates on, without committing to a particular query
//! backend. `pim-core` turns a `Scope` plus a `ScopeContext` into relational
//! filter conditions.

use serde::{Deserialize, Serialize};

/// A canonicalized set of integer ids, stored as non-overlapping, sorted
/// half-open intervals. Single ids are intervals of length one.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdSet {
    /// `(start, end_inclusive)` pairs, sorted by `start`, non-overlapping,
    /// non-adjacent (adjacent runs are merged).
    ranges: Vec<(i64, i64)>,
}

impl IdSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn from_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        let mut set = Self::new();
        for id in ids {
            set.insert(id);
        }
        set
    }

    pub fn insert(&mut self, id: i64) {
        let pos = self.ranges.partition_point(|&(start, _)| start <= id);
        if pos > 0 {
            let (start, end) = self.ranges[pos - 1];
            if id <= end {
                return;
            }
            if id == end + 1 {
                self.ranges[pos - 1] = (start, end);
                self.extend_right(pos - 1, id);
                return;
            }
        }
        if pos < self.ranges.len() {
            let (start, end) = self.ranges[pos];
            if id + 1 == start {
                self.ranges[pos] = (id, end);
                self.merge_left(pos);
                return;
            }
        }
        self.ranges.insert(pos, (id, id));
    }

    fn extend_right(&mut self, idx: usize, new_id: i64) {
        self.ranges[idx].1 = new_id;
        self.merge_left(idx + 1);
    }

    fn merge_left(&mut self, idx: usize) {
        if idx == 0 || idx >= self.ranges.len() {
            return;
        }
        let (prev_start, prev_end) = self.ranges[idx - 1];
        let (cur_start, cur_end) = self.ranges[idx];
        if cur_start <= prev_end + 1 {
            self.ranges[idx - 1] = (prev_start, prev_end.max(cur_end));
            self.ranges.remove(idx);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        let pos = self.ranges.partition_point(|&(start, _)| start <= id);
        pos > 0 && self.ranges[pos - 1].1 >= id
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..=end)
    }

    pub fn ranges(&self) -> &[(i64, i64)] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(start, end)| (end - start + 1) as usize)
            .sum()
    }

    /// Emit the compact `"1,3-7,42"` form.
    pub fn to_compact_string(&self) -> String {
        self.ranges
            .iter()
            .map(|&(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{}-{}", start, end)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the compact form produced by [`to_compact_string`]. Left-inverse
    /// of `to_compact_string` for any `IdSet` built purely by insertion.
    pub fn from_compact_string(s: &str) -> Option<Self> {
        if s.is_empty() {
            return Some(Self::new());
        }
        let mut set = Self::new();
        for part in s.split(',') {
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: i64 = lo.parse().ok()?;
                let hi: i64 = hi.parse().ok()?;
                for id in lo..=hi {
                    set.insert(id);
                }
            } else {
                set.insert(part.parse().ok()?);
            }
        }
        Some(set)
    }
}

/// One link in a hierarchical remote-id chain, ordered leaf to root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HridStep(pub String);

/// Selects an entity set. Resolved against a [`ScopeContext`] by
/// `pim-core::scope::scope_to_query`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Scope {
    Uid(IdSet),
    Rid(Vec<String>),
    Hrid(Vec<HridStep>),
    Gid(Vec<String>),
}

/// Resource/collection/tag context a Rid/Hrid/Gid scope resolves against.
/// Required for Rid and Hrid scopes (spec §4.1: `ContextRequired` otherwise).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeContext {
    pub resource_id: Option<crate::ids::ResourceId>,
    pub collection_id: Option<crate::ids::CollectionId>,
    pub tag_id: Option<crate::ids::TagId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_set_merges_adjacent_runs() {
        let set = IdSet::from_ids([1, 2, 3, 7, 5, 6, 42]);
        assert_eq!(set.to_compact_string(), "1-3,5-7,42");
        assert_eq!(set.len(), 7);
    }

    #[test]
    fn id_set_compact_round_trip() {
        let set = IdSet::from_ids([10, 11, 12, 1, 99, 100]);
        let compact = set.to_compact_string();
        let parsed = IdSet::from_compact_string(&compact).unwrap();
        assert_eq!(set, parsed);
    }

    #[test]
    fn id_set_contains() {
        let set = IdSet::from_ids([1, 2, 3, 10]);
        assert!(set.contains(2));
        assert!(!set.contains(4));
        assert!(set.contains(10));
    }

    #[test]
    fn empty_compact_round_trips() {
        let set = IdSet::new();
        assert_eq!(set.to_compact_string(), "");
        assert_eq!(IdSet::from_compact_string("").unwrap(), set);
    }
}
