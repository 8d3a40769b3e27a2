// Vote counting for one replicated Put

use crate::error::{DhtError, Result};

/// Positive and negative acks of an in-flight Put
#[derive(Debug, Clone)]
pub struct PutState {
    degree: usize,
    majority: usize,
    positive: usize,
    negative: usize,
    decided: bool,
}

impl PutState {
    pub fn new(degree: usize) -> Self {
        Self {
            degree,
            majority: crate::ring::majority(degree),
            positive: 0,
            negative: 0,
            decided: false,
        }
    }

    /// Count one replica ack. Returns the outcome the first time it is known.
    pub fn record(&mut self, success: bool) -> Option<Result<()>> {
        if self.decided {
            return None;
        }
        if success {
            self.positive += 1;
        } else {
            self.negative += 1;
        }

        if self.positive == self.majority {
            self.decided = true;
            return Some(Ok(()));
        }
        // a single replica decides alone; otherwise majority - 1 refusals
        // leave too few replicas to ever reach majority
        let failed = if self.degree == 1 {
            self.negative > 0
        } else {
            self.negative == self.majority - 1
        };
        if failed {
            self.decided = true;
            return Some(Err(DhtError::PutFailed {
                total: self.degree,
                positive: self.positive,
                negative: self.negative,
            }));
        }
        None
    }

    pub fn is_decided(&self) -> bool {
        self.decided
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.positive, self.negative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn replay(degree: usize, acks: &[bool]) -> Option<(usize, Result<()>)> {
        let mut state = PutState::new(degree);
        acks.iter()
            .enumerate()
            .find_map(|(i, ack)| state.record(*ack).map(|outcome| (i, outcome)))
    }

    #[test]
    fn succeeds_on_third_ack_of_four() {
        let (at, outcome) = replay(4, &[true, true, false, true]).unwrap();
        assert_eq!(at, 3);
        assert_eq!(outcome, Ok(()));
    }

    #[test]
    fn fails_once_majority_is_unreachable() {
        let (at, outcome) = replay(4, &[false, true, false, true]).unwrap();
        assert_eq!(at, 2);
        assert_eq!(
            outcome,
            Err(DhtError::PutFailed {
                total: 4,
                positive: 1,
                negative: 2
            })
        );
    }

    #[test]
    fn single_replica_decides_alone() {
        assert_eq!(replay(1, &[true]).unwrap().1, Ok(()));
        assert!(matches!(
            replay(1, &[false]).unwrap().1,
            Err(DhtError::PutFailed { total: 1, positive: 0, negative: 1 })
        ));
    }

    #[test]
    fn later_acks_are_ignored() {
        let mut state = PutState::new(2);
        assert!(state.record(false).unwrap().is_err());
        assert!(state.record(true).is_none());
        assert!(state.is_decided());
    }

    proptest! {
        #[test]
        fn prop_outcome_matches_quorum_math(exp in 0u32..4, acks in proptest::collection::vec(any::<bool>(), 16)) {
            let degree = crate::ring::degree_for_exponent(exp);
            let acks = &acks[..degree];
            let majority = crate::ring::majority(degree);

            let mut state = PutState::new(degree);
            let mut outcome = None;
            for ack in acks {
                if let Some(decided) = state.record(*ack) {
                    outcome = Some(decided);
                    break;
                }
            }

            // every full round of acks reaches a decision
            let outcome = outcome.expect("undecided after all replicas answered");
            let (positive, negative) = state.counts();
            let refusal_limit = (majority - 1).max(1);
            match outcome {
                Ok(()) => {
                    prop_assert_eq!(positive, majority);
                    prop_assert!(negative < refusal_limit);
                }
                Err(_) => {
                    prop_assert!(positive < majority);
                    prop_assert_eq!(negative, refusal_limit);
                }
            }
            if acks.iter().filter(|ack| **ack).count() < majority {
                prop_assert!(outcome.is_err());
            }
        }
    }
}
