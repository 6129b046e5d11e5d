//! Pure transition decisions.
//!
//! `decide` maps (current state, artifact presence) to the next action
//! without touching any I/O, so every policy edge (retry bounds, loop
//! stalls) is testable with plain values.

use serde::{Deserialize, Serialize};

use super::state::{Persona, Phase, TransitionRecord, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryDirective {
    /// Fresh persona: start its retry budget over.
    Reset,
    /// Same persona re-invoked because its artifact is still missing.
    Increment,
}

/// A dispatchable next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub persona: Persona,
    pub next_phase: Phase,
    pub retry: RetryDirective,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallReason {
    /// The same persona failed to produce its artifact too many times.
    RetriesExhausted {
        persona: Persona,
        retries: u32,
        bound: u32,
    },
    /// The same (from, to) handover kept repeating with nothing else in
    /// between, independent of the retry counter.
    TransitionLoop {
        from: Persona,
        to: Persona,
        occurrences: u32,
        bound: u32,
    },
}

impl std::fmt::Display for StallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StallReason::RetriesExhausted {
                persona,
                retries,
                bound,
            } => write!(
                f,
                "persona {persona} exhausted {retries} retries (bound {bound})"
            ),
            StallReason::TransitionLoop {
                from,
                to,
                occurrences,
                bound,
            } => write!(
                f,
                "transition {from} → {to} repeated {occurrences} times (bound {bound})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Dispatch(Action),
    Complete,
    Stall(StallReason),
}

/// Bounds the decision function enforces.
#[derive(Debug, Clone, Copy)]
pub struct TransitionPolicy {
    /// Times one persona may be re-invoked for a missing artifact.
    pub max_retries: u32,
    /// Times one (from, to) pair may repeat back-to-back.
    pub loop_threshold: u32,
}

/// Count how many times the `(from, to)` pair occurs at the tail of the
/// history with no different pair in between.
fn trailing_pair_count(history: &[TransitionRecord], from: Persona, to: Persona) -> u32 {
    history
        .iter()
        .rev()
        .take_while(|r| r.from == from && r.to == to)
        .count() as u32
}

/// Decide the next step for `state` given whether the current persona's
/// expected artifact exists.
pub fn decide(state: &WorkflowState, artifact_present: bool, policy: &TransitionPolicy) -> Decision {
    let candidate = match state.persona.profile() {
        // Nothing dispatched yet: hand control to the first persona.
        None => Action {
            persona: Persona::first(),
            next_phase: Persona::first()
                .profile()
                .map(|p| p.phase)
                .unwrap_or(Phase::Unknown),
            retry: RetryDirective::Reset,
        },
        Some(profile) => {
            if !artifact_present {
                if state.retry_count >= policy.max_retries {
                    return Decision::Stall(StallReason::RetriesExhausted {
                        persona: state.persona,
                        retries: state.retry_count,
                        bound: policy.max_retries,
                    });
                }
                Action {
                    persona: state.persona,
                    next_phase: profile.phase,
                    retry: RetryDirective::Increment,
                }
            } else {
                match profile.successor {
                    Some(next) => Action {
                        persona: next,
                        next_phase: next.profile().map(|p| p.phase).unwrap_or(Phase::Unknown),
                        retry: RetryDirective::Reset,
                    },
                    None => return Decision::Complete,
                }
            }
        }
    };

    let occurrences =
        trailing_pair_count(&state.transition_history, state.persona, candidate.persona);
    if occurrences >= policy.loop_threshold {
        return Decision::Stall(StallReason::TransitionLoop {
            from: state.persona,
            to: candidate.persona,
            occurrences,
            bound: policy.loop_threshold,
        });
    }

    Decision::Dispatch(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn policy() -> TransitionPolicy {
        TransitionPolicy {
            max_retries: 3,
            loop_threshold: 3,
        }
    }

    fn record(from: Persona, to: Persona) -> TransitionRecord {
        TransitionRecord {
            from,
            to,
            timestamp: Utc::now(),
            success: true,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn fresh_workflow_dispatches_first_persona() {
        let state = WorkflowState::new("wf");
        let decision = decide(&state, false, &policy());
        assert_eq!(
            decision,
            Decision::Dispatch(Action {
                persona: Persona::Analyst,
                next_phase: Phase::Drafting,
                retry: RetryDirective::Reset,
            })
        );
    }

    #[test]
    fn missing_artifact_reinvokes_with_increment() {
        let mut state = WorkflowState::new("wf");
        state.persona = Persona::Analyst;
        state.phase = Phase::Drafting;

        let decision = decide(&state, false, &policy());
        assert_eq!(
            decision,
            Decision::Dispatch(Action {
                persona: Persona::Analyst,
                next_phase: Phase::Drafting,
                retry: RetryDirective::Increment,
            })
        );
    }

    #[test]
    fn present_artifact_advances_with_reset() {
        let mut state = WorkflowState::new("wf");
        state.persona = Persona::Analyst;
        state.phase = Phase::Drafting;

        let decision = decide(&state, true, &policy());
        assert_eq!(
            decision,
            Decision::Dispatch(Action {
                persona: Persona::Planner,
                next_phase: Phase::Planning,
                retry: RetryDirective::Reset,
            })
        );
    }

    #[test]
    fn final_persona_with_artifact_completes() {
        let mut state = WorkflowState::new("wf");
        state.persona = Persona::Validator;
        state.phase = Phase::Validating;

        assert_eq!(decide(&state, true, &policy()), Decision::Complete);
    }

    #[test]
    fn retry_bound_stalls() {
        let mut state = WorkflowState::new("wf");
        state.persona = Persona::Builder;
        state.phase = Phase::Building;
        state.retry_count = 3;

        match decide(&state, false, &policy()) {
            Decision::Stall(StallReason::RetriesExhausted {
                persona, retries, ..
            }) => {
                assert_eq!(persona, Persona::Builder);
                assert_eq!(retries, 3);
            }
            other => panic!("expected retry stall, got {other:?}"),
        }
    }

    #[test]
    fn repeated_pair_stalls_independent_of_retry_count() {
        let mut state = WorkflowState::new("wf");
        state.persona = Persona::Planner;
        state.phase = Phase::Planning;
        state.retry_count = 0;
        for _ in 0..3 {
            state.record_transition(record(Persona::Planner, Persona::Planner));
        }

        match decide(&state, false, &policy()) {
            Decision::Stall(StallReason::TransitionLoop {
                from,
                to,
                occurrences,
                ..
            }) => {
                assert_eq!((from, to), (Persona::Planner, Persona::Planner));
                assert_eq!(occurrences, 3);
            }
            other => panic!("expected loop stall, got {other:?}"),
        }
    }

    #[test]
    fn intervening_different_pair_resets_loop_window() {
        let mut state = WorkflowState::new("wf");
        state.persona = Persona::Planner;
        state.phase = Phase::Planning;
        state.record_transition(record(Persona::Planner, Persona::Planner));
        state.record_transition(record(Persona::Planner, Persona::Planner));
        state.record_transition(record(Persona::Analyst, Persona::Planner));

        // Tail run of the repeated pair is zero, so dispatch proceeds.
        assert!(matches!(
            decide(&state, false, &policy()),
            Decision::Dispatch(_)
        ));
    }
}
