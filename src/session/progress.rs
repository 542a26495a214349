//! Session State Machine
//! Mission: Encode the legal lifecycle transitions in one place
//!
//! INITIALIZING -> QUEUED        (dispatch job enqueued)
//! INITIALIZING -> RESEARCHING   (worker grabbed the job before the QUEUED write landed)
//! QUEUED       -> RESEARCHING   (worker picked the job up)
//! RESEARCHING  -> GENERATING    (market context ready, model calls begin)
//! GENERATING   -> FINISHED      (every selected model attempted)
//! any non-terminal -> ERROR     (unrecoverable failure)

use crate::models::SessionStatus;

/// Result of attempting a transition against the stored status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Stored status is FINISHED or ERROR; the write was rejected.
    AlreadyTerminal(SessionStatus),
    /// The pair is not in the legal transition table.
    Illegal {
        from: SessionStatus,
        to: SessionStatus,
    },
}

pub fn is_legal_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    match (from, to) {
        (Initializing, Queued) => true,
        (Initializing, Researching) => true,
        (Queued, Researching) => true,
        (Researching, Generating) => true,
        (Generating, Finished) => true,
        (from, Error) => !from.is_terminal(),
        _ => false,
    }
}

/// Decide a transition attempt. Terminal absorption is checked before
/// table legality so a stored FINISHED/ERROR always rejects the write.
pub fn evaluate_transition(from: SessionStatus, to: SessionStatus) -> TransitionOutcome {
    if from.is_terminal() {
        return TransitionOutcome::AlreadyTerminal(from);
    }
    if !is_legal_transition(from, to) {
        return TransitionOutcome::Illegal { from, to };
    }
    TransitionOutcome::Applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    #[test]
    fn happy_path_is_legal() {
        assert!(is_legal_transition(Initializing, Queued));
        assert!(is_legal_transition(Queued, Researching));
        assert!(is_legal_transition(Researching, Generating));
        assert!(is_legal_transition(Generating, Finished));
    }

    #[test]
    fn synchronous_dispatch_skips_queued() {
        assert!(is_legal_transition(Initializing, Researching));
    }

    #[test]
    fn any_non_terminal_state_can_error() {
        for from in [Initializing, Queued, Researching, Generating] {
            assert!(is_legal_transition(from, Error), "{:?} -> ERROR", from);
        }
    }

    #[test]
    fn no_skipping_or_rewinding() {
        assert!(!is_legal_transition(Queued, Generating));
        assert!(!is_legal_transition(Initializing, Finished));
        assert!(!is_legal_transition(Generating, Researching));
        assert!(!is_legal_transition(Researching, Queued));
    }

    #[test]
    fn terminal_states_absorb_everything() {
        for from in [Finished, Error] {
            for to in [Initializing, Queued, Researching, Generating, Finished, Error] {
                assert_eq!(
                    evaluate_transition(from, to),
                    TransitionOutcome::AlreadyTerminal(from)
                );
            }
        }
    }

    #[test]
    fn illegal_pair_is_reported_with_both_states() {
        assert_eq!(
            evaluate_transition(Queued, Finished),
            TransitionOutcome::Illegal {
                from: Queued,
                to: Finished
            }
        );
    }
}
