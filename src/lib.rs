// Baton - persona-handover workflow coordination
// State coordination and admission control for multi-step delivery
// pipelines driven from independent, short-lived processes.

pub mod admission;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod retry;
pub mod telemetry;
pub mod vstore;
pub mod workflow;

// Re-export key types for easy access
pub use admission::{
    AdmissionController, AdmissionError, ExecutionBatch, ExecutionReport, ResourceProbe,
    ResourceSample, SystemResourceProbe,
};
pub use breaker::{BreakerError, CircuitBreaker, CircuitState};
pub use config::{BatonConfig, EscalationMode};
pub use coordination::{ContextStore, CoordinationError, LockHandle, LockManager};
pub use retry::{retry, BackoffPolicy, RetryExhaustedError};
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use vstore::{VersionedStore, VersionedStoreError};
pub use workflow::{
    decide, Action, Decision, Orchestrator, Persona, PersonaExecutor, Phase, TransitionRecord,
    WorkflowContext, WorkflowError, WorkflowOutcome, WorkflowState,
};
