//! Sequenced reorder buffer.
//!
//! Calls are numbered when they are admitted for dispatch and their results
//! are released strictly in that order, however the executor happens to
//! complete them. Early completions wait in `pending` until every lower
//! sequence number has been released.
//!
//! ```text
//! admit:     0 1 2 3
//! complete:      2 1     3 0
//! release:               0 1 2 3   (one drain when 0 arrives)
//! ```
//!
//! The window is unbounded and nothing is ever discarded: a sequence number
//! that never completes holds back everything admitted after it.

use crate::error::{MuxError, Result};
use std::collections::HashMap;

/// Snapshot of a buffer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Next sequence number `admit()` will hand out.
    pub next_admit: u64,
    /// Lowest sequence number not yet released.
    pub next_release: u64,
    /// Completed results waiting for an earlier sequence number.
    pub pending: usize,
}

impl ReorderStats {
    /// Calls admitted but not yet completed.
    pub fn outstanding(&self) -> u64 {
        self.next_admit - self.next_release - self.pending as u64
    }
}

/// Restores admission order over out-of-order completions.
#[derive(Debug)]
pub struct SequencedReorderBuffer<T> {
    next_admit: u64,
    next_release: u64,
    pending: HashMap<u64, T>,
}

impl<T> Default for SequencedReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SequencedReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next_admit: 0,
            next_release: 0,
            pending: HashMap::new(),
        }
    }

    /// Assign the next sequence number.
    ///
    /// Call exactly once per call, when it is accepted for dispatch.
    pub fn admit(&mut self) -> u64 {
        let seq = self.next_admit;
        self.next_admit += 1;
        seq
    }

    /// Record the result of `seq`, handing every releasable result to `release`.
    ///
    /// If `seq` is the next one due, it is released immediately followed by
    /// any run of consecutive results that completed early. Otherwise the
    /// result is parked and nothing is released.
    ///
    /// Returns the number of results released. Completing a sequence number
    /// that was never admitted, was already released, or is already pending
    /// is rejected without touching the buffer.
    pub fn complete_with<F>(&mut self, seq: u64, result: T, mut release: F) -> Result<usize>
    where
        F: FnMut(T),
    {
        if seq >= self.next_admit {
            return Err(MuxError::UnadmittedCompletion {
                seq,
                next_admit: self.next_admit,
            });
        }
        if seq < self.next_release {
            return Err(MuxError::StaleCompletion {
                seq,
                next_release: self.next_release,
            });
        }
        if self.pending.contains_key(&seq) {
            return Err(MuxError::DuplicateCompletion { seq });
        }

        if seq != self.next_release {
            self.pending.insert(seq, result);
            return Ok(0);
        }

        release(result);
        self.next_release += 1;
        let mut released = 1;

        while let Some(next) = self.pending.remove(&self.next_release) {
            release(next);
            self.next_release += 1;
            released += 1;
        }

        Ok(released)
    }

    /// Like [`complete_with`](Self::complete_with), collecting the released results.
    pub fn complete(&mut self, seq: u64, result: T) -> Result<Vec<T>> {
        let mut out = Vec::new();
        self.complete_with(seq, result, |value| out.push(value))?;
        Ok(out)
    }

    pub fn next_admit_id(&self) -> u64 {
        self.next_admit
    }

    pub fn next_release_id(&self) -> u64 {
        self.next_release
    }

    /// Number of completed results held back by an earlier sequence number.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    pub fn stats(&self) -> ReorderStats {
        ReorderStats {
            next_admit: self.next_admit,
            next_release: self.next_release,
            pending: self.pending.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn admit_n<T>(buffer: &mut SequencedReorderBuffer<T>, n: u64) {
        for expected in 0..n {
            assert_eq!(buffer.admit(), expected);
        }
    }

    #[test]
    fn test_admit_is_monotonic_from_zero() {
        let mut buffer = SequencedReorderBuffer::<()>::new();
        assert_eq!(buffer.admit(), 0);
        assert_eq!(buffer.admit(), 1);
        assert_eq!(buffer.admit(), 2);
        assert_eq!(buffer.next_admit_id(), 3);
        assert_eq!(buffer.next_release_id(), 0);
    }

    #[test]
    fn test_in_order_completion_releases_immediately() {
        let mut buffer = SequencedReorderBuffer::new();
        admit_n(&mut buffer, 3);

        assert_eq!(buffer.complete(0, "a").unwrap(), vec!["a"]);
        assert_eq!(buffer.complete(1, "b").unwrap(), vec!["b"]);
        assert_eq!(buffer.complete(2, "c").unwrap(), vec!["c"]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_no_premature_release() {
        let mut buffer = SequencedReorderBuffer::new();
        admit_n(&mut buffer, 3);

        assert!(buffer.complete(2, 2).unwrap().is_empty());
        assert!(buffer.complete(1, 1).unwrap().is_empty());
        assert_eq!(buffer.pending_len(), 2);
        assert_eq!(buffer.next_release_id(), 0);

        // One synchronous drain releases the whole run.
        assert_eq!(buffer.complete(0, 0).unwrap(), vec![0, 1, 2]);
        assert_eq!(buffer.next_release_id(), 3);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_shuffled_completion_releases_in_admission_order() {
        let mut order: Vec<u64> = (0..10).collect();
        order.shuffle(&mut rand::rng());

        let mut buffer = SequencedReorderBuffer::new();
        admit_n(&mut buffer, 10);

        let mut sink = Vec::new();
        for seq in order {
            buffer
                .complete_with(seq, seq * 10, |value| sink.push(value))
                .unwrap();
        }

        assert_eq!(sink, (0..10).map(|seq| seq * 10).collect::<Vec<_>>());
        assert_eq!(buffer.stats().outstanding(), 0);
    }

    #[test]
    fn test_gap_holds_back_later_results() {
        let mut buffer = SequencedReorderBuffer::new();
        admit_n(&mut buffer, 4);

        assert_eq!(buffer.complete(0, 'a').unwrap(), vec!['a']);
        assert!(buffer.complete(2, 'c').unwrap().is_empty());
        assert!(buffer.complete(3, 'd').unwrap().is_empty());

        let stats = buffer.stats();
        assert_eq!(stats.next_release, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.outstanding(), 1);
        assert!(buffer.is_pending(2));
        assert!(!buffer.is_pending(1));
    }

    #[test]
    fn test_stale_completion_rejected() {
        let mut buffer = SequencedReorderBuffer::new();
        admit_n(&mut buffer, 2);
        buffer.complete(0, 0).unwrap();

        let err = buffer.complete(0, 99).unwrap_err();
        assert!(matches!(
            err,
            MuxError::StaleCompletion {
                seq: 0,
                next_release: 1
            }
        ));
        assert_eq!(buffer.next_release_id(), 1);
    }

    #[test]
    fn test_duplicate_pending_completion_rejected() {
        let mut buffer = SequencedReorderBuffer::new();
        admit_n(&mut buffer, 3);
        buffer.complete(2, "first").unwrap();

        let err = buffer.complete(2, "second").unwrap_err();
        assert!(matches!(err, MuxError::DuplicateCompletion { seq: 2 }));

        buffer.complete(1, "b").unwrap();
        assert_eq!(buffer.complete(0, "a").unwrap(), vec!["a", "b", "first"]);
    }

    #[test]
    fn test_unadmitted_completion_rejected() {
        let mut buffer = SequencedReorderBuffer::new();
        admit_n(&mut buffer, 1);

        let err = buffer.complete(5, ()).unwrap_err();
        assert!(matches!(
            err,
            MuxError::UnadmittedCompletion {
                seq: 5,
                next_admit: 1
            }
        ));
        assert_eq!(buffer.pending_len(), 0);
    }
}
