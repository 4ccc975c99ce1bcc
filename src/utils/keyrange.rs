//! Owned key ranges on the ring and a whole-ring ownership view.

use std::fmt;
use std::ops::RangeInclusive;

use rangemap::RangeInclusiveMap;
use serde::{Deserialize, Serialize};

use crate::node::{Key, LogicalId};
use crate::utils::DhtError;

/// Half-open key range `(low, high]` owned by a ring node.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Exclusive lower bound, the predecessor's storage ID.
    pub low: LogicalId,

    /// Inclusive upper bound, the owner's own storage ID.
    pub high: LogicalId,
}

impl KeyRange {
    #[inline]
    pub fn new(low: LogicalId, high: LogicalId) -> Self {
        KeyRange { low, high }
    }

    /// Does this range contain the given key?
    #[inline]
    pub fn contains(&self, key: Key) -> bool {
        self.low < key && key <= self.high
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.low >= self.high
    }

    /// Converts to an inclusive range over keys, `None` if empty.
    pub fn to_inclusive(&self) -> Option<RangeInclusive<Key>> {
        if self.is_empty() {
            None
        } else {
            Some((self.low + 1)..=self.high)
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}]", self.low, self.high)
    }
}

/// Map from every key of the ring's key space to the storage ID of the node
/// owning it, assembled from the owned ranges of all active nodes.
#[derive(Debug, Clone)]
pub struct RingView {
    /// Upper bound of the key space (storage ID of the tail).
    max_id: LogicalId,

    /// Key -> owner storage ID.
    owners: RangeInclusiveMap<Key, LogicalId>,
}

impl RingView {
    /// Builds a view from `(owner_id, owned_range)` pairs. Fails if any two
    /// ranges overlap or a range sticks out of `[1, max_id]`.
    pub fn build(
        max_id: LogicalId,
        ranges: impl IntoIterator<Item = (LogicalId, KeyRange)>,
    ) -> Result<Self, DhtError> {
        let mut owners = RangeInclusiveMap::new();
        for (owner, range) in ranges {
            let keys = match range.to_inclusive() {
                Some(keys) => keys,
                None => continue,
            };
            if *keys.end() > max_id {
                return Err(DhtError::msg(format!(
                    "range {} of owner {} exceeds max id {}",
                    range, owner, max_id
                )));
            }
            if owners.overlaps(&keys) {
                return Err(DhtError::msg(format!(
                    "range {} of owner {} overlaps existing ranges",
                    range, owner
                )));
            }
            owners.insert(keys, owner);
        }
        Ok(RingView { max_id, owners })
    }

    /// Storage ID of the node owning given key, if any.
    #[inline]
    pub fn owner_of(&self, key: Key) -> Option<LogicalId> {
        self.owners.get(&key).copied()
    }

    /// Checks that the owned ranges cover `[1, max_id]` without gaps.
    pub fn check_partition(&self) -> Result<(), DhtError> {
        if let Some(gap) = self.owners.gaps(&(1..=self.max_id)).next() {
            return Err(DhtError::msg(format!(
                "keys [{}, {}] have no owner",
                gap.start(),
                gap.end()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod keyrange_tests {
    use super::*;

    #[test]
    fn range_contains() {
        let range = KeyRange::new(0, 500);
        assert!(!range.contains(0));
        assert!(range.contains(1));
        assert!(range.contains(9));
        assert!(range.contains(500));
        assert!(!range.contains(501));
        assert!(KeyRange::new(7, 7).is_empty());
        assert_eq!(KeyRange::new(7, 7).to_inclusive(), None);
        assert_eq!(KeyRange::new(3, 5).to_inclusive(), Some(4..=5));
    }

    #[test]
    fn view_full_partition() -> Result<(), DhtError> {
        let view = RingView::build(
            1000,
            [
                (500, KeyRange::new(0, 500)),
                (1000, KeyRange::new(500, 1000)),
            ],
        )?;
        view.check_partition()?;
        assert_eq!(view.owner_of(9), Some(500));
        assert_eq!(view.owner_of(500), Some(500));
        assert_eq!(view.owner_of(501), Some(1000));
        assert_eq!(view.owner_of(0), None);
        Ok(())
    }

    #[test]
    fn view_with_gap() -> Result<(), DhtError> {
        let view = RingView::build(
            1000,
            [
                (200, KeyRange::new(0, 200)),
                (1000, KeyRange::new(500, 1000)),
            ],
        )?;
        assert!(view.check_partition().is_err());
        Ok(())
    }

    #[test]
    fn view_with_overlap() {
        assert!(RingView::build(
            1000,
            [
                (600, KeyRange::new(0, 600)),
                (1000, KeyRange::new(500, 1000)),
            ],
        )
        .is_err());
    }

    #[test]
    fn view_out_of_space() {
        assert!(RingView::build(100, [(200, KeyRange::new(0, 200))]).is_err());
    }
}
