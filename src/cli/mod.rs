//! Thin command-line surface over the orchestration core.
//!
//! Exit codes: 0 on workflow completion, 2 on escalation/halt, 1 on
//! operational error. The terminal `WorkflowState` is printed as JSON.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::BatonConfig;
use crate::workflow::{
    Action, ExecutorError, Orchestrator, PersonaExecutor, WorkflowContext, WorkflowOutcome,
};
use crate::SystemResourceProbe;

#[derive(Parser)]
#[command(name = "baton")]
#[command(about = "Persona-handover workflow coordination")]
#[command(
    long_about = "Baton drives a multi-step delivery workflow by handing control \
                  between personas, coordinating state across independent processes \
                  through locks, atomic files, and a git-backed store."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a workflow until it completes, stalls, or fails
    Run {
        /// Workflow identifier
        workflow_id: String,
    },
    /// Print the current state of a workflow as JSON
    Status {
        /// Workflow identifier
        workflow_id: String,
    },
    /// Reset a stalled workflow to its initial state
    Reset {
        /// Workflow identifier
        workflow_id: String,
    },
}

/// Persona executor that shells out to a configured command.
///
/// The dispatched action is described through environment variables; the
/// command is expected to leave the named artifact behind on success.
pub struct CommandExecutor {
    command: Option<String>,
}

impl CommandExecutor {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl PersonaExecutor for CommandExecutor {
    async fn execute(
        &self,
        action: &Action,
        ctx: &WorkflowContext,
    ) -> Result<Vec<PathBuf>, ExecutorError> {
        let persona = action.persona.name().to_string();
        let command = self.command.as_ref().ok_or_else(|| ExecutorError {
            persona: persona.clone(),
            message: "no executor.command configured".to_string(),
        })?;
        let expected = action
            .persona
            .profile()
            .map(|p| p.expected_artifact)
            .unwrap_or_default();

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("BATON_WORKFLOW_ID", &ctx.workflow_id)
            .env("BATON_PERSONA", &persona)
            .env("BATON_PHASE", format!("{:?}", action.next_phase))
            .env("BATON_ARTIFACTS_DIR", &ctx.artifacts_dir)
            .env("BATON_EXPECTED_ARTIFACT", expected)
            .env("BATON_CORRELATION_ID", &ctx.correlation_id)
            .output()
            .await
            .map_err(|e| ExecutorError {
                persona: persona.clone(),
                message: format!("failed to spawn persona command: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError {
                persona,
                message: format!(
                    "persona command exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(vec![ctx.artifacts_dir.join(expected)])
    }
}

/// Run the parsed command. Returns the process exit code.
pub async fn execute(cli: Cli, config: BatonConfig) -> Result<i32> {
    let executor = CommandExecutor::new(config.executor.command.clone());
    let orchestrator = Orchestrator::new(config, executor, Arc::new(SystemResourceProbe))
        .context("failed to construct orchestrator")?;

    match cli.command {
        Commands::Run { workflow_id } => match orchestrator.run(&workflow_id).await {
            Ok(WorkflowOutcome::Completed(state)) => {
                info!(%workflow_id, "workflow completed");
                println!("{}", serde_json::to_string_pretty(&state)?);
                Ok(0)
            }
            Ok(WorkflowOutcome::Escalated { state, reason }) => {
                error!(%workflow_id, %reason, "workflow escalated");
                println!("{}", serde_json::to_string_pretty(&state)?);
                eprintln!("escalated: {reason}");
                Ok(2)
            }
            Err(e) => {
                error!(%workflow_id, error = %e, "workflow run failed");
                if let Some(state) = orchestrator.peek(&workflow_id)? {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                }
                eprintln!("error: {e}");
                Ok(1)
            }
        },
        Commands::Status { workflow_id } => match orchestrator.peek(&workflow_id)? {
            Some(state) => {
                println!("{}", serde_json::to_string_pretty(&state)?);
                Ok(0)
            }
            None => {
                eprintln!("no state recorded for workflow '{workflow_id}'");
                Ok(1)
            }
        },
        Commands::Reset { workflow_id } => {
            let state = orchestrator.reset(&workflow_id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(0)
        }
    }
}
