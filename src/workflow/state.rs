//! Workflow state records and the persona registry.
//!
//! `WorkflowState` is the single canonical, schema-versioned record of a
//! workflow. Anything human-facing (the markdown status) is derived from it
//! and regenerable; nothing is ever parsed back out of markdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bump when the persisted layout changes shape.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// The closed set of roles control can be handed to.
///
/// Personas are a closed enumeration mapped through a static registry
/// ([`Persona::profile`]); there is no lookup-by-name dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persona {
    /// No persona has been dispatched yet.
    Unknown,
    /// Drafts the product specification.
    Analyst,
    /// Breaks the specification into tracked issues.
    Planner,
    /// Produces code stubs for the planned issues.
    Builder,
    /// Runs the validation suite over the built artifacts.
    Validator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Unknown,
    Drafting,
    Planning,
    Building,
    Validating,
    Completed,
}

/// Static description of one persona's slot in the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PersonaProfile {
    pub phase: Phase,
    /// Artifact the persona must leave behind, relative to the artifacts
    /// directory. The orchestrator only ever checks presence.
    pub expected_artifact: &'static str,
    pub successor: Option<Persona>,
    /// Heavy personas are dispatched through the admission controller.
    pub heavy: bool,
}

impl Persona {
    pub fn first() -> Persona {
        Persona::Analyst
    }

    pub fn profile(self) -> Option<PersonaProfile> {
        match self {
            Persona::Unknown => None,
            Persona::Analyst => Some(PersonaProfile {
                phase: Phase::Drafting,
                expected_artifact: "prd.md",
                successor: Some(Persona::Planner),
                heavy: false,
            }),
            Persona::Planner => Some(PersonaProfile {
                phase: Phase::Planning,
                expected_artifact: "issues.json",
                successor: Some(Persona::Builder),
                heavy: false,
            }),
            Persona::Builder => Some(PersonaProfile {
                phase: Phase::Building,
                expected_artifact: "stubs.manifest",
                successor: Some(Persona::Validator),
                heavy: false,
            }),
            Persona::Validator => Some(PersonaProfile {
                phase: Phase::Validating,
                expected_artifact: "validation-report.json",
                successor: None,
                heavy: true,
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Persona::Unknown => "unknown",
            Persona::Analyst => "analyst",
            Persona::Planner => "planner",
            Persona::Builder => "builder",
            Persona::Validator => "validator",
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One transition attempt. Appended, never mutated; the history is cleared
/// only when the workflow completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Persona,
    pub to: Persona,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub reason: String,
}

/// Canonical workflow record. Mutated only by the orchestrator, only under
/// the lock scoped to `workflow_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub schema_version: u32,
    pub workflow_id: String,
    pub persona: Persona,
    pub phase: Phase,
    pub retry_count: u32,
    pub transition_history: Vec<TransitionRecord>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            workflow_id: workflow_id.into(),
            persona: Persona::Unknown,
            phase: Phase::Unknown,
            retry_count: 0,
            transition_history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn record_transition(&mut self, record: TransitionRecord) {
        self.transition_history.push(record);
        self.updated_at = Utc::now();
    }

    /// Reset to the initial state, keeping the history as evidence of what
    /// led to the reset.
    pub fn reset(&mut self) {
        self.persona = Persona::Unknown;
        self.phase = Phase::Unknown;
        self.retry_count = 0;
        self.updated_at = Utc::now();
    }

    /// Terminal bookkeeping: completed workflows drop their history so
    /// storage does not grow without bound.
    pub fn complete(&mut self) {
        self.persona = Persona::Unknown;
        self.phase = Phase::Completed;
        self.retry_count = 0;
        self.transition_history.clear();
        self.updated_at = Utc::now();
    }

    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }

    /// Human-facing status rendering. Derived output only; never the
    /// system of record.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Workflow {}\n\n", self.workflow_id));
        out.push_str(&format!("- **Persona**: {}\n", self.persona));
        out.push_str(&format!("- **Phase**: {:?}\n", self.phase));
        out.push_str(&format!("- **Retries**: {}\n", self.retry_count));
        out.push_str(&format!(
            "- **Updated**: {}\n",
            self.updated_at.to_rfc3339()
        ));
        if !self.transition_history.is_empty() {
            out.push_str("\n## Transitions\n\n");
            for record in &self.transition_history {
                out.push_str(&format!(
                    "- {} → {} at {} ({}): {}\n",
                    record.from,
                    record.to,
                    record.timestamp.to_rfc3339(),
                    if record.success { "ok" } else { "failed" },
                    record.reason
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_forms_a_terminating_chain() {
        let mut persona = Persona::first();
        let mut seen = vec![persona];
        while let Some(profile) = persona.profile() {
            match profile.successor {
                Some(next) => {
                    assert!(!seen.contains(&next), "registry must not cycle");
                    seen.push(next);
                    persona = next;
                }
                None => break,
            }
        }
        assert_eq!(persona, Persona::Validator);
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn unknown_persona_has_no_profile() {
        assert!(Persona::Unknown.profile().is_none());
    }

    #[test]
    fn completion_clears_history() {
        let mut state = WorkflowState::new("wf-1");
        state.record_transition(TransitionRecord {
            from: Persona::Unknown,
            to: Persona::Analyst,
            timestamp: Utc::now(),
            success: true,
            reason: "start".to_string(),
        });
        assert_eq!(state.transition_history.len(), 1);

        state.complete();
        assert!(state.is_completed());
        assert!(state.transition_history.is_empty());
    }

    #[test]
    fn state_serde_round_trip_preserves_schema_version() {
        let state = WorkflowState::new("wf-2");
        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schema_version, STATE_SCHEMA_VERSION);
        assert_eq!(back.workflow_id, "wf-2");
    }

    #[test]
    fn markdown_rendering_reflects_state() {
        let mut state = WorkflowState::new("wf-3");
        state.persona = Persona::Builder;
        state.phase = Phase::Building;
        let md = state.render_markdown();
        assert!(md.contains("# Workflow wf-3"));
        assert!(md.contains("builder"));
    }
}
