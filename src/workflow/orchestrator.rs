//! Lock-scoped workflow driving.
//!
//! The orchestrator owns all mutation of a workflow's state. Everything for
//! one `workflow_id` happens under that workflow's lock, so transitions are
//! strictly sequential per workflow and fully independent across workflows.
//! Persona execution is an injected seam: the orchestrator dispatches an
//! [`Action`] and afterwards only cares whether the expected artifact
//! exists.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};

use super::machine::{decide, Action, Decision, RetryDirective, TransitionPolicy};
use super::state::{TransitionRecord, WorkflowState};
use crate::admission::{AdmissionController, AdmissionError, ExecutionBatch, ResourceProbe};
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::config::{BatonConfig, EscalationMode};
use crate::coordination::{ContextStore, CoordinationError, LockManager};
use crate::retry::retry;
use crate::telemetry::{create_workflow_span, generate_correlation_id};
use crate::vstore::{VersionedStore, VersionedStoreError};

const BREAKER_STATE_PATH: &str = "breakers.json";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("circuit for '{key}' is open; persona dispatch refused")]
    CircuitOpen { key: String },

    #[error("durable history update failed after {attempts} attempts: {message}")]
    DurableHistory { attempts: u32, message: String },

    #[error(transparent)]
    Versioned(#[from] VersionedStoreError),

    #[error("persisted state for '{workflow_id}' is unreadable: {reason}")]
    CorruptState { workflow_id: String, reason: String },
}

/// Why a persona invocation failed; produced by executor implementations.
#[derive(Debug, Error)]
#[error("persona '{persona}' failed: {message}")]
pub struct ExecutorError {
    pub persona: String,
    pub message: String,
}

/// Read-only context handed to persona executors.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub artifacts_dir: PathBuf,
    pub correlation_id: String,
}

/// The persona seam. Implementations generate content (specs, issues,
/// stubs, validation runs); the core never looks inside, only at the
/// artifacts left behind.
#[async_trait]
pub trait PersonaExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &Action,
        ctx: &WorkflowContext,
    ) -> Result<Vec<PathBuf>, ExecutorError>;
}

/// Terminal result of one orchestrator run.
#[derive(Debug)]
pub enum WorkflowOutcome {
    Completed(WorkflowState),
    Escalated {
        state: WorkflowState,
        reason: String,
    },
}

impl WorkflowOutcome {
    pub fn state(&self) -> &WorkflowState {
        match self {
            WorkflowOutcome::Completed(state) => state,
            WorkflowOutcome::Escalated { state, .. } => state,
        }
    }
}

pub struct Orchestrator<E: PersonaExecutor> {
    config: BatonConfig,
    locks: LockManager,
    store: ContextStore,
    breaker: CircuitBreaker,
    admission: AdmissionController,
    history: Option<VersionedStore>,
    probe: Arc<dyn ResourceProbe>,
    executor: E,
}

impl<E: PersonaExecutor> Orchestrator<E> {
    pub fn new(
        config: BatonConfig,
        executor: E,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self, WorkflowError> {
        let store = ContextStore::new(&config.paths.state_dir);
        let locks = LockManager::new(&config.paths.lock_dir, config.locking.clone());
        let breaker = CircuitBreaker::load(
            config.breaker.failure_threshold,
            config.breaker.cooldown(),
            &store,
            BREAKER_STATE_PATH,
        )?;
        let admission = AdmissionController::new(
            config.paths.state_dir.join("execution.slot"),
            config.admission.clone(),
        );
        let history = match (&config.paths.repo_path, config.workflow.durable_history) {
            (Some(repo), true) => Some(VersionedStore::open(repo, "state")?),
            _ => None,
        };
        Ok(Self {
            config,
            locks,
            store,
            breaker,
            admission,
            history,
            probe,
            executor,
        })
    }

    fn state_path(workflow_id: &str) -> String {
        format!("workflows/{workflow_id}.json")
    }

    fn markdown_path(workflow_id: &str) -> String {
        format!("workflows/{workflow_id}.md")
    }

    /// Load the current state record without taking the workflow lock.
    /// Read-only surface for status display.
    pub fn peek(&self, workflow_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        match self.store.read_optional(&Self::state_path(workflow_id))? {
            Some((body, _)) => {
                let state = serde_json::from_str(&body).map_err(|e| {
                    WorkflowError::CorruptState {
                        workflow_id: workflow_id.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Reset a workflow to its initial state under its lock. Used by the
    /// recovery path after a halt.
    pub async fn reset(&self, workflow_id: &str) -> Result<WorkflowState, WorkflowError> {
        let resource = format!("workflow/{workflow_id}");
        self.locks
            .with_lock(&resource, || async {
                let (mut state, hash) = self.load_state(workflow_id)?;
                state.reset();
                self.persist(&state, hash.as_deref()).await?;
                Ok::<_, WorkflowError>(state)
            })
            .await?
    }

    /// Drive `workflow_id` until it completes, stalls, or fails.
    pub async fn run(&self, workflow_id: &str) -> Result<WorkflowOutcome, WorkflowError> {
        let resource = format!("workflow/{workflow_id}");
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span(workflow_id, &correlation_id);
        self.locks
            .with_lock(&resource, || {
                self.run_locked(workflow_id, correlation_id).instrument(span)
            })
            .await?
    }

    async fn run_locked(
        &self,
        workflow_id: &str,
        correlation_id: String,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let ctx = WorkflowContext {
            workflow_id: workflow_id.to_string(),
            artifacts_dir: self.config.paths.artifacts_dir.join(workflow_id),
            correlation_id,
        };
        let (mut state, mut hash) = self.load_state(workflow_id)?;
        if state.is_completed() {
            info!(workflow_id, "workflow already completed; nothing to do");
            return Ok(WorkflowOutcome::Completed(state));
        }
        info!(
            workflow_id,
            persona = %state.persona,
            phase = ?state.phase,
            "workflow run starting"
        );

        let policy = TransitionPolicy {
            max_retries: self.config.workflow.max_retries,
            loop_threshold: self.config.workflow.loop_threshold,
        };

        loop {
            let artifact_present = self.artifact_present(&state, &ctx);
            match decide(&state, artifact_present, &policy) {
                Decision::Complete => {
                    state.complete();
                    self.persist(&state, hash.as_deref()).await?;
                    info!(workflow_id, "workflow completed");
                    return Ok(WorkflowOutcome::Completed(state));
                }
                Decision::Stall(reason) => {
                    error!(
                        workflow_id,
                        persona = %state.persona,
                        retry_count = state.retry_count,
                        %reason,
                        "workflow stalled; escalating"
                    );
                    state.record_transition(TransitionRecord {
                        from: state.persona,
                        to: state.persona,
                        timestamp: Utc::now(),
                        success: false,
                        reason: reason.to_string(),
                    });
                    match self.config.workflow.escalation {
                        EscalationMode::Reset => {
                            warn!(workflow_id, "escalation policy: reset to initial state");
                            state.reset();
                        }
                        EscalationMode::Halt => {
                            warn!(workflow_id, "escalation policy: halt");
                        }
                    }
                    self.persist(&state, hash.as_deref()).await?;
                    return Ok(WorkflowOutcome::Escalated {
                        reason: reason.to_string(),
                        state,
                    });
                }
                Decision::Dispatch(action) => {
                    let from = state.persona;
                    match action.retry {
                        RetryDirective::Reset => state.retry_count = 0,
                        RetryDirective::Increment => state.retry_count += 1,
                    }
                    state.persona = action.persona;
                    state.phase = action.next_phase;

                    debug!(
                        workflow_id,
                        from = %from,
                        to = %action.persona,
                        retry_count = state.retry_count,
                        heavy = action.persona.profile().map(|p| p.heavy).unwrap_or(false),
                        "dispatching persona"
                    );
                    let exec_result = self.dispatch(&action, &ctx).await;

                    let (success, reason) = match &exec_result {
                        Ok(artifacts) => (true, format!("produced {} artifact(s)", artifacts.len())),
                        Err(e) => (false, e.to_string()),
                    };
                    state.record_transition(TransitionRecord {
                        from,
                        to: action.persona,
                        timestamp: Utc::now(),
                        success,
                        reason,
                    });
                    hash = Some(self.persist(&state, hash.as_deref()).await?);
                    if let Err(e) = self.breaker.persist(&self.store, BREAKER_STATE_PATH) {
                        warn!(workflow_id, error = %e, "failed to persist breaker state");
                    }

                    match exec_result {
                        Ok(_) => {}
                        // An open circuit means the persona's collaborator is
                        // untrusted right now; hammering it from the workflow
                        // loop would defeat the breaker.
                        Err(DispatchError::CircuitOpen { key }) => {
                            return Err(WorkflowError::CircuitOpen { key });
                        }
                        Err(DispatchError::Admission(e)) => {
                            return Err(WorkflowError::Admission(e));
                        }
                        Err(DispatchError::Execution(e)) => {
                            warn!(
                                workflow_id,
                                persona = %action.persona,
                                error = %e,
                                "persona execution failed; retry policy decides next step"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        action: &Action,
        ctx: &WorkflowContext,
    ) -> Result<Vec<PathBuf>, DispatchError> {
        let heavy = action
            .persona
            .profile()
            .map(|p| p.heavy)
            .unwrap_or(false);
        let key = format!("persona/{}", action.persona);

        if heavy {
            let batch = ExecutionBatch::new(vec![*action], self.config.admission.batch_size);
            let report = self
                .admission
                .submit(batch, self.probe.as_ref(), |action| {
                    let key = key.clone();
                    async move {
                        self.breaker
                            .call(&key, || self.executor.execute(&action, ctx))
                            .await
                    }
                })
                .await
                .map_err(DispatchError::Admission)?;
            // An open circuit must come back out typed, not flattened into
            // an execution failure: the run loop fails fast on it exactly
            // like the light-persona path.
            match report.aborted {
                None => Ok(report.completed.into_iter().flatten().collect()),
                Some(BreakerError::CircuitOpen { key, .. }) => {
                    Err(DispatchError::CircuitOpen { key })
                }
                Some(BreakerError::Inner(e)) => Err(DispatchError::Execution(e.to_string())),
            }
        } else {
            match self
                .breaker
                .call(&key, || self.executor.execute(action, ctx))
                .await
            {
                Ok(artifacts) => Ok(artifacts),
                Err(BreakerError::CircuitOpen { key, .. }) => {
                    Err(DispatchError::CircuitOpen { key })
                }
                Err(BreakerError::Inner(e)) => Err(DispatchError::Execution(e.to_string())),
            }
        }
    }

    fn artifact_present(&self, state: &WorkflowState, ctx: &WorkflowContext) -> bool {
        state
            .persona
            .profile()
            .map(|profile| ctx.artifacts_dir.join(profile.expected_artifact).exists())
            .unwrap_or(false)
    }

    fn load_state(
        &self,
        workflow_id: &str,
    ) -> Result<(WorkflowState, Option<String>), WorkflowError> {
        match self.store.read_optional(&Self::state_path(workflow_id))? {
            Some((body, hash)) => {
                let state: WorkflowState =
                    serde_json::from_str(&body).map_err(|e| WorkflowError::CorruptState {
                        workflow_id: workflow_id.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok((state, Some(hash)))
            }
            None => Ok((WorkflowState::new(workflow_id), None)),
        }
    }

    /// Persist the canonical record (hash-preconditioned), regenerate the
    /// derived markdown, and mirror into durable history when configured.
    async fn persist(
        &self,
        state: &WorkflowState,
        expected_hash: Option<&str>,
    ) -> Result<String, WorkflowError> {
        let body = serde_json::to_string_pretty(state)
            .map_err(CoordinationError::Serialization)?;
        let new_hash =
            self.store
                .write_atomic(&Self::state_path(&state.workflow_id), &body, expected_hash)?;

        // Markdown is derived output; no precondition, losing a render is
        // harmless.
        if let Err(e) = self.store.write_atomic(
            &Self::markdown_path(&state.workflow_id),
            &state.render_markdown(),
            None,
        ) {
            warn!(workflow_id = %state.workflow_id, error = %e, "markdown render failed");
        }

        if let Some(history) = &self.history {
            let path = Self::state_path(&state.workflow_id);
            let policy = self.config.retry.to_policy();
            retry(&policy, "durable-history-write", || async {
                history.write(&path, &body)
            })
            .await
            .map_err(|e| WorkflowError::DurableHistory {
                attempts: e.attempts,
                message: e.source.to_string(),
            })?;
        }

        Ok(new_hash)
    }
}

#[derive(Debug)]
enum DispatchError {
    CircuitOpen { key: String },
    Admission(AdmissionError),
    Execution(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::CircuitOpen { key } => write!(f, "circuit '{key}' open"),
            DispatchError::Admission(e) => write!(f, "{e}"),
            DispatchError::Execution(message) => f.write_str(message),
        }
    }
}
