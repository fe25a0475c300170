//! Per-partition read and commit position tracking.
//!
//! [`PartitionCursor`] is pure in-memory state with invariant checks and no
//! I/O. A cursor is created when a partition is assigned, seeded from the
//! durably committed offset, and destroyed when the partition is revoked.

use std::collections::HashMap;

use crate::error::EngineError;

/// Tracks the next-to-read and last-committed offsets for one partition.
///
/// Invariants, enforced on every mutation:
/// - `committed_offset <= next_offset`
/// - `next_offset` only advances; it never regresses within one assignment
/// - `committed_offset` only advances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    partition: i32,
    next_offset: i64,
    committed_offset: i64,
}

impl PartitionCursor {
    /// Creates a cursor seeded at the given offset, with both the
    /// next-to-read and committed positions set to it.
    #[must_use]
    pub fn seeded(partition: i32, offset: i64) -> Self {
        Self {
            partition,
            next_offset: offset,
            committed_offset: offset,
        }
    }

    /// Returns the partition this cursor tracks.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Returns the next offset to read.
    #[must_use]
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Returns the last durably committed offset.
    #[must_use]
    pub fn committed_offset(&self) -> i64 {
        self.committed_offset
    }

    /// Returns how many offsets have been processed but not yet committed.
    #[must_use]
    pub fn uncommitted(&self) -> i64 {
        self.next_offset - self.committed_offset
    }

    /// Advances the next-to-read offset by `n`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidAdvance`] if `n` is negative. A zero
    /// advance is a no-op.
    pub fn advance(&mut self, n: i64) -> Result<(), EngineError> {
        if n < 0 {
            return Err(EngineError::InvalidAdvance {
                partition: self.partition,
                delta: n,
            });
        }
        self.next_offset += n;
        Ok(())
    }

    /// Records that `offset` has been durably committed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OffsetOutOfRange`] if `offset` exceeds the
    /// next-to-read position or regresses below the current committed
    /// position.
    pub fn mark_committed(&mut self, offset: i64) -> Result<(), EngineError> {
        if offset > self.next_offset || offset < self.committed_offset {
            return Err(EngineError::OffsetOutOfRange {
                partition: self.partition,
                offset,
                committed: self.committed_offset,
                next: self.next_offset,
            });
        }
        self.committed_offset = offset;
        Ok(())
    }
}

/// The set of cursors for the partitions currently assigned to this
/// runtime instance.
#[derive(Debug, Clone, Default)]
pub struct CursorSet {
    cursors: HashMap<i32, PartitionCursor>,
}

impl CursorSet {
    /// Creates an empty cursor set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a cursor, replacing any existing cursor for the partition.
    pub fn insert(&mut self, cursor: PartitionCursor) {
        self.cursors.insert(cursor.partition(), cursor);
    }

    /// Removes and returns the cursor for a partition.
    pub fn remove(&mut self, partition: i32) -> Option<PartitionCursor> {
        self.cursors.remove(&partition)
    }

    /// Returns the cursor for a partition.
    #[must_use]
    pub fn get(&self, partition: i32) -> Option<&PartitionCursor> {
        self.cursors.get(&partition)
    }

    /// Returns a mutable cursor for a partition.
    pub fn get_mut(&mut self, partition: i32) -> Option<&mut PartitionCursor> {
        self.cursors.get_mut(&partition)
    }

    /// Returns `true` if a cursor exists for the partition.
    #[must_use]
    pub fn contains(&self, partition: i32) -> bool {
        self.cursors.contains_key(&partition)
    }

    /// Returns the tracked partitions.
    #[must_use]
    pub fn partitions(&self) -> Vec<i32> {
        self.cursors.keys().copied().collect()
    }

    /// Returns the number of tracked partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    /// Returns `true` if no partitions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Iterates over the cursors.
    pub fn iter(&self) -> impl Iterator<Item = &PartitionCursor> {
        self.cursors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_cursor() {
        let c = PartitionCursor::seeded(1, 42);
        assert_eq!(c.partition(), 1);
        assert_eq!(c.next_offset(), 42);
        assert_eq!(c.committed_offset(), 42);
        assert_eq!(c.uncommitted(), 0);
    }

    #[test]
    fn test_advance_and_commit() {
        let mut c = PartitionCursor::seeded(0, 10);
        c.advance(5).unwrap();
        assert_eq!(c.next_offset(), 15);
        assert_eq!(c.uncommitted(), 5);

        c.mark_committed(15).unwrap();
        assert_eq!(c.committed_offset(), 15);
        assert_eq!(c.uncommitted(), 0);
    }

    #[test]
    fn test_negative_advance_rejected() {
        let mut c = PartitionCursor::seeded(0, 10);
        let err = c.advance(-1).unwrap_err();
        assert!(matches!(err, EngineError::InvalidAdvance { delta: -1, .. }));
        assert_eq!(c.next_offset(), 10);
    }

    #[test]
    fn test_zero_advance_is_noop() {
        let mut c = PartitionCursor::seeded(0, 10);
        c.advance(0).unwrap();
        assert_eq!(c.next_offset(), 10);
    }

    #[test]
    fn test_commit_beyond_next_rejected() {
        let mut c = PartitionCursor::seeded(0, 10);
        c.advance(2).unwrap();
        let err = c.mark_committed(13).unwrap_err();
        assert!(matches!(err, EngineError::OffsetOutOfRange { offset: 13, .. }));
        assert_eq!(c.committed_offset(), 10);
    }

    #[test]
    fn test_commit_regression_rejected() {
        let mut c = PartitionCursor::seeded(0, 10);
        c.advance(10).unwrap();
        c.mark_committed(18).unwrap();
        let err = c.mark_committed(15).unwrap_err();
        assert!(matches!(err, EngineError::OffsetOutOfRange { offset: 15, .. }));
        assert_eq!(c.committed_offset(), 18);
    }

    // Invariant check over pseudo-random call sequences: committed never
    // exceeds next, regardless of the mix of valid and invalid calls.
    // Deterministic LCG keeps the test reproducible.
    #[test]
    fn test_invariant_under_random_sequences() {
        let mut seed: u64 = 0x5DEECE66D;
        let mut next_rand = move || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            seed >> 33
        };

        for _ in 0..64 {
            let mut c = PartitionCursor::seeded(0, (next_rand() % 100) as i64);
            for _ in 0..256 {
                match next_rand() % 4 {
                    0 => {
                        let _ = c.advance((next_rand() % 10) as i64);
                    }
                    1 => {
                        // Invalid by construction.
                        assert!(c.advance(-((next_rand() % 5 + 1) as i64)).is_err());
                    }
                    2 => {
                        let target = c.committed_offset() + (next_rand() % 8) as i64;
                        if target <= c.next_offset() {
                            c.mark_committed(target).unwrap();
                        } else {
                            assert!(c.mark_committed(target).is_err());
                        }
                    }
                    _ => {
                        // Past the next offset or behind the committed
                        // offset, both must be rejected.
                        assert!(c.mark_committed(c.next_offset() + 1).is_err());
                        if c.committed_offset() > 0 {
                            let behind = c.committed_offset() - 1;
                            if behind < c.committed_offset() {
                                assert!(c.mark_committed(behind).is_err());
                            }
                        }
                    }
                }
                assert!(c.committed_offset() <= c.next_offset());
            }
        }
    }

    #[test]
    fn test_cursor_set_lifecycle() {
        let mut set = CursorSet::new();
        assert!(set.is_empty());

        set.insert(PartitionCursor::seeded(0, 5));
        set.insert(PartitionCursor::seeded(1, 10));
        assert_eq!(set.len(), 2);
        assert!(set.contains(0));
        assert_eq!(set.get(1).unwrap().next_offset(), 10);

        set.get_mut(0).unwrap().advance(3).unwrap();
        assert_eq!(set.get(0).unwrap().next_offset(), 8);

        let removed = set.remove(1).unwrap();
        assert_eq!(removed.partition(), 1);
        assert!(!set.contains(1));

        let mut parts = set.partitions();
        parts.sort_unstable();
        assert_eq!(parts, vec![0]);
    }
}
