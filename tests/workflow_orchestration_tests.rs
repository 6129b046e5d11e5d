//! End-to-end orchestration runs against scripted persona executors.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use baton::config::{BatonConfig, EscalationMode};
use baton::workflow::{
    Action, ExecutorError, Orchestrator, Persona, PersonaExecutor, Phase, WorkflowContext,
    WorkflowError, WorkflowOutcome,
};
use baton::{AdmissionError, ResourceProbe, ResourceSample};

struct CalmProbe;

impl ResourceProbe for CalmProbe {
    fn sample(&self) -> Result<ResourceSample> {
        Ok(ResourceSample {
            memory_used_percent: 30.0,
            load_average: 0.4,
        })
    }
}

struct HotProbe;

impl ResourceProbe for HotProbe {
    fn sample(&self) -> Result<ResourceSample> {
        Ok(ResourceSample {
            memory_used_percent: 97.0,
            load_average: 12.0,
        })
    }
}

/// Writes each persona's expected artifact, unless told not to.
struct ScriptedExecutor {
    skip_artifact_for: Option<Persona>,
    fail_persona: Option<Persona>,
    invocations: Arc<AtomicU32>,
}

impl ScriptedExecutor {
    fn well_behaved() -> Self {
        Self {
            skip_artifact_for: None,
            fail_persona: None,
            invocations: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl PersonaExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        action: &Action,
        ctx: &WorkflowContext,
    ) -> Result<Vec<PathBuf>, ExecutorError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if self.fail_persona == Some(action.persona) {
            return Err(ExecutorError {
                persona: action.persona.name().to_string(),
                message: "scripted failure".to_string(),
            });
        }
        if self.skip_artifact_for == Some(action.persona) {
            return Ok(vec![]);
        }

        let profile = action.persona.profile().expect("dispatched persona");
        std::fs::create_dir_all(&ctx.artifacts_dir).unwrap();
        let artifact = ctx.artifacts_dir.join(profile.expected_artifact);
        std::fs::write(&artifact, format!("artifact from {}", action.persona)).unwrap();
        Ok(vec![artifact])
    }
}

fn config_in(dir: &TempDir) -> BatonConfig {
    let mut config = BatonConfig::rooted_at(dir.path());
    config.admission.recovery_delay_ms = 1;
    config.admission.slot_timeout_ms = 500;
    config.admission.slot_poll_delay_ms = 5;
    config.locking.poll_base_delay_ms = 5;
    config
}

#[tokio::test]
async fn full_pipeline_completes_and_clears_history() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(
        config_in(&dir),
        ScriptedExecutor::well_behaved(),
        Arc::new(CalmProbe),
    )
    .unwrap();

    let outcome = orchestrator.run("wf-complete").await.unwrap();
    let state = match outcome {
        WorkflowOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    };

    assert_eq!(state.phase, Phase::Completed);
    assert!(state.transition_history.is_empty());

    // Terminal state and derived markdown are persisted.
    let persisted = orchestrator.peek("wf-complete").unwrap().unwrap();
    assert!(persisted.is_completed());
    assert!(dir
        .path()
        .join("state/workflows/wf-complete.md")
        .exists());
}

#[tokio::test]
async fn missing_artifact_escalates_and_resets() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor {
        skip_artifact_for: Some(Persona::Analyst),
        fail_persona: None,
        invocations: Arc::new(AtomicU32::new(0)),
    };
    let orchestrator =
        Orchestrator::new(config_in(&dir), executor, Arc::new(CalmProbe)).unwrap();

    let outcome = orchestrator.run("wf-stuck").await.unwrap();
    match outcome {
        WorkflowOutcome::Escalated { state, reason } => {
            // Escalation policy is reset: back to the initial state.
            assert_eq!(state.persona, Persona::Unknown);
            assert_eq!(state.phase, Phase::Unknown);
            assert_eq!(state.retry_count, 0);
            assert!(!reason.is_empty());
        }
        other => panic!("expected escalation, got {other:?}"),
    }
}

#[tokio::test]
async fn halt_escalation_preserves_state() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.workflow.escalation = EscalationMode::Halt;
    let executor = ScriptedExecutor {
        skip_artifact_for: Some(Persona::Planner),
        fail_persona: None,
        invocations: Arc::new(AtomicU32::new(0)),
    };
    let orchestrator = Orchestrator::new(config, executor, Arc::new(CalmProbe)).unwrap();

    let outcome = orchestrator.run("wf-halt").await.unwrap();
    match outcome {
        WorkflowOutcome::Escalated { state, .. } => {
            assert_eq!(state.persona, Persona::Planner);
            assert!(!state.transition_history.is_empty());
        }
        other => panic!("expected escalation, got {other:?}"),
    }

    // A reset afterwards clears the stall.
    let state = orchestrator.reset("wf-halt").await.unwrap();
    assert_eq!(state.persona, Persona::Unknown);
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn repeated_persona_failures_open_the_circuit() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.breaker.failure_threshold = 3;
    config.workflow.max_retries = 10;
    config.workflow.loop_threshold = 10;
    let invocations = Arc::new(AtomicU32::new(0));
    let executor = ScriptedExecutor {
        skip_artifact_for: None,
        fail_persona: Some(Persona::Analyst),
        invocations: invocations.clone(),
    };
    let orchestrator = Orchestrator::new(config, executor, Arc::new(CalmProbe)).unwrap();

    let err = orchestrator.run("wf-breaker").await.unwrap_err();
    match err {
        WorkflowError::CircuitOpen { key } => assert_eq!(key, "persona/analyst"),
        other => panic!("expected open circuit, got {other:?}"),
    }

    // Three real attempts opened the circuit; the fourth was refused
    // without reaching the executor.
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let state = orchestrator.peek("wf-breaker").unwrap().unwrap();
    let failures = state
        .transition_history
        .iter()
        .filter(|r| !r.success)
        .count();
    assert!(failures >= 3);
}

#[tokio::test]
async fn heavy_persona_circuit_open_fails_fast() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.breaker.failure_threshold = 1;
    config.workflow.max_retries = 5;
    let invocations = Arc::new(AtomicU32::new(0));
    let executor = ScriptedExecutor {
        skip_artifact_for: None,
        fail_persona: Some(Persona::Validator),
        invocations: invocations.clone(),
    };
    let orchestrator = Orchestrator::new(config, executor, Arc::new(CalmProbe)).unwrap();

    let err = orchestrator.run("wf-heavy-breaker").await.unwrap_err();
    match err {
        WorkflowError::CircuitOpen { key } => assert_eq!(key, "persona/validator"),
        other => panic!("expected open circuit, got {other:?}"),
    }

    // Three light personas plus one validator attempt; the open circuit
    // fails fast instead of burning the retry budget through admission.
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn repeated_handover_pair_is_detected_as_loop() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.workflow.max_retries = 10;
    config.workflow.loop_threshold = 3;
    let executor = ScriptedExecutor {
        skip_artifact_for: Some(Persona::Analyst),
        fail_persona: None,
        invocations: Arc::new(AtomicU32::new(0)),
    };
    let orchestrator = Orchestrator::new(config, executor, Arc::new(CalmProbe)).unwrap();

    let outcome = orchestrator.run("wf-loop").await.unwrap();
    match outcome {
        WorkflowOutcome::Escalated { reason, .. } => {
            assert!(reason.contains("repeated"), "reason was: {reason}");
        }
        other => panic!("expected loop escalation, got {other:?}"),
    }
}

#[tokio::test]
async fn heavy_persona_is_denied_under_resource_pressure() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(
        config_in(&dir),
        ScriptedExecutor::well_behaved(),
        Arc::new(HotProbe),
    )
    .unwrap();

    // Light personas run fine; the heavy validator hits admission control.
    let err = orchestrator.run("wf-denied").await.unwrap_err();
    match err {
        WorkflowError::Admission(AdmissionError::AdmissionDenied { reason }) => {
            assert!(reason.contains("exceeds ceiling"));
        }
        other => panic!("expected admission denial, got {other:?}"),
    }

    // Light-phase progress was persisted before the denial.
    let state = orchestrator.peek("wf-denied").unwrap().unwrap();
    assert_eq!(state.persona, Persona::Validator);
    assert!(!state.is_completed());
}

#[tokio::test]
async fn completed_workflow_stays_terminal_on_rerun() {
    let dir = TempDir::new().unwrap();
    let invocations = Arc::new(AtomicU32::new(0));
    let executor = ScriptedExecutor {
        skip_artifact_for: None,
        fail_persona: None,
        invocations: invocations.clone(),
    };
    let orchestrator =
        Orchestrator::new(config_in(&dir), executor, Arc::new(CalmProbe)).unwrap();

    let first = orchestrator.run("wf-rerun").await.unwrap();
    assert!(matches!(first, WorkflowOutcome::Completed(_)));
    let after_first = invocations.load(Ordering::SeqCst);
    assert_eq!(after_first, 4);

    // A second run observes the terminal state and dispatches nothing.
    let second = orchestrator.run("wf-rerun").await.unwrap();
    assert!(matches!(second, WorkflowOutcome::Completed(_)));
    assert_eq!(invocations.load(Ordering::SeqCst), after_first);
}

#[tokio::test]
async fn durable_history_mirrors_state_into_git() {
    let dir = TempDir::new().unwrap();
    let repo_dir = TempDir::new().unwrap();
    git2::Repository::init(repo_dir.path()).unwrap();

    let mut config = config_in(&dir);
    config.paths.repo_path = Some(repo_dir.path().to_path_buf());
    config.workflow.durable_history = true;
    let orchestrator = Orchestrator::new(
        config,
        ScriptedExecutor::well_behaved(),
        Arc::new(CalmProbe),
    )
    .unwrap();

    let outcome = orchestrator.run("wf-durable").await.unwrap();
    assert!(matches!(outcome, WorkflowOutcome::Completed(_)));

    let store = baton::VersionedStore::open(repo_dir.path(), "state").unwrap();
    let body = store.read("workflows/wf-durable.json").unwrap();
    assert!(body.contains("wf-durable"));
    assert!(store.history().unwrap().len() > 1);
}
