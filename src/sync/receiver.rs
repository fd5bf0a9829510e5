//! Receiver-side sequence validation
//!
//! Tracks the last sequence accepted from the peer and classifies each
//! incoming data frame.

/// Classification of an inbound sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Already accepted (`s <= receive_sequence`)
    Duplicate {
        /// The replayed sequence
        received: u32,
        /// Current receive sequence
        current: u32,
    },
    /// Frames are missing (`s > receive_sequence + 1`)
    Gap {
        /// The sequence we wanted
        expected: u32,
        /// The sequence we got
        received: u32,
    },
    /// Next in order (`s == receive_sequence + 1`)
    Fresh,
}

/// Last sequence accepted from a peer
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    receive_sequence: u32,
}

impl SequenceTracker {
    /// Start from a stored baseline (0 after a forced resync)
    pub fn new(baseline: u32) -> Self {
        Self {
            receive_sequence: baseline,
        }
    }

    /// Last accepted sequence
    pub fn current(&self) -> u32 {
        self.receive_sequence
    }

    /// Classify `sequence` without changing state
    pub fn check(&self, sequence: u32) -> SequenceCheck {
        // Wrap-around is not handled: u32 exhaustion is out of reach.
        let expected = self.receive_sequence.saturating_add(1);
        if sequence <= self.receive_sequence {
            SequenceCheck::Duplicate {
                received: sequence,
                current: self.receive_sequence,
            }
        } else if sequence > expected {
            SequenceCheck::Gap {
                expected,
                received: sequence,
            }
        } else {
            SequenceCheck::Fresh
        }
    }

    /// Classify and, when fresh, advance
    pub fn accept(&mut self, sequence: u32) -> SequenceCheck {
        let check = self.check(sequence);
        if check == SequenceCheck::Fresh {
            self.receive_sequence = sequence;
        }
        check
    }

    /// Reset to a new baseline
    pub fn reset(&mut self, baseline: u32) {
        self.receive_sequence = baseline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fresh_advances() {
        let mut tracker = SequenceTracker::new(0);

        assert_eq!(tracker.accept(1), SequenceCheck::Fresh);
        assert_eq!(tracker.accept(2), SequenceCheck::Fresh);
        assert_eq!(tracker.current(), 2);
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut tracker = SequenceTracker::new(5);

        for replay in [0, 3, 5] {
            assert_eq!(
                tracker.accept(replay),
                SequenceCheck::Duplicate {
                    received: replay,
                    current: 5
                }
            );
        }
        assert_eq!(tracker.current(), 5);
    }

    #[test]
    fn test_gap_does_not_advance() {
        let mut tracker = SequenceTracker::new(5);

        assert_eq!(
            tracker.accept(8),
            SequenceCheck::Gap {
                expected: 6,
                received: 8
            }
        );
        assert_eq!(tracker.current(), 5);
        assert_eq!(tracker.accept(6), SequenceCheck::Fresh);
    }

    #[test]
    fn test_reset() {
        let mut tracker = SequenceTracker::new(40);
        tracker.reset(0);
        assert_eq!(tracker.check(1), SequenceCheck::Fresh);
    }

    #[test]
    fn test_saturated_counter_only_sees_duplicates() {
        let tracker = SequenceTracker::new(u32::MAX);
        assert!(matches!(
            tracker.check(u32::MAX),
            SequenceCheck::Duplicate { .. }
        ));
    }

    proptest! {
        #[test]
        fn prop_only_next_sequence_advances(baseline in 0u32..1_000_000, sequence in any::<u32>()) {
            let mut tracker = SequenceTracker::new(baseline);
            let check = tracker.accept(sequence);

            if sequence == baseline + 1 {
                prop_assert_eq!(check, SequenceCheck::Fresh);
                prop_assert_eq!(tracker.current(), sequence);
            } else {
                prop_assert_ne!(check, SequenceCheck::Fresh);
                prop_assert_eq!(tracker.current(), baseline);
            }
        }
    }
}
