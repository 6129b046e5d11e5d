//! Workflow state machine and orchestration.

mod machine;
mod orchestrator;
mod state;

pub use machine::{decide, Action, Decision, RetryDirective, StallReason, TransitionPolicy};
pub use orchestrator::{
    ExecutorError, Orchestrator, PersonaExecutor, WorkflowContext, WorkflowError, WorkflowOutcome,
};
pub use state::{
    Persona, PersonaProfile, Phase, TransitionRecord, WorkflowState, STATE_SCHEMA_VERSION,
};
