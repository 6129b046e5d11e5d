//! Explicit configuration for every component.
//!
//! One `BatonConfig` value is built at startup and handed to each component
//! at construction. Nothing reads ambient process state (working directory,
//! env vars) after load time; that keeps independent invocations honest
//! about which paths and thresholds they coordinate through.

use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::BackoffPolicy;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BatonConfig {
    pub paths: PathsConfig,
    pub locking: LockingConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub admission: AdmissionConfig,
    pub workflow: WorkflowConfig,
    pub executor: ExecutorConfig,
    pub observability: ObservabilityConfig,
}

/// How the CLI invokes persona executors. Content generation is external;
/// the core only dispatches and checks artifacts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Shell command run once per dispatched action, with the action
    /// described through `BATON_*` environment variables.
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Root for workflow state files, breaker snapshots, the execution slot.
    pub state_dir: PathBuf,
    /// Directory holding lock marker files.
    pub lock_dir: PathBuf,
    /// Where persona executors leave their artifacts (one subdirectory per
    /// workflow).
    pub artifacts_dir: PathBuf,
    /// Git repository backing the durable versioned store, when enabled.
    pub repo_path: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".baton/state"),
            lock_dir: PathBuf::from(".baton/locks"),
            artifacts_dir: PathBuf::from(".baton/artifacts"),
            repo_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockingConfig {
    /// Budget for one lock acquisition, polling included.
    pub acquire_timeout_ms: u64,
    /// Lifetime written into each lock marker as its expiry; markers past
    /// their declared expiry are treated as abandoned and reclaimed.
    pub staleness_secs: u64,
    pub poll_base_delay_ms: u64,
    pub poll_max_delay_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
            staleness_secs: 600,
            poll_base_delay_ms: 25,
            poll_max_delay_ms: 2_000,
        }
    }
}

impl LockingConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn poll_base_delay(&self) -> Duration {
        Duration::from_millis(self.poll_base_delay_ms)
    }

    pub fn poll_max_delay(&self) -> Duration {
        Duration::from_millis(self.poll_max_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures before a circuit opens.
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 300,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    /// Deny admission when used memory is above this percentage.
    pub memory_ceiling_percent: f64,
    /// Deny admission when the 1-minute load average is above this.
    pub load_ceiling: f64,
    /// Items per sub-batch.
    pub batch_size: usize,
    /// Pause between sub-batches.
    pub recovery_delay_ms: u64,
    /// Budget for acquiring the global execution slot.
    pub slot_timeout_ms: u64,
    pub slot_poll_delay_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_percent: 85.0,
            load_ceiling: 8.0,
            batch_size: 5,
            recovery_delay_ms: 2_000,
            slot_timeout_ms: 60_000,
            slot_poll_delay_ms: 250,
        }
    }
}

impl AdmissionConfig {
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn slot_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_timeout_ms)
    }

    pub fn slot_poll_delay(&self) -> Duration {
        Duration::from_millis(self.slot_poll_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationMode {
    /// On a stall, reset the workflow to its initial state.
    Reset,
    /// On a stall, leave the state as-is and stop.
    Halt,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Times one persona may be re-invoked for a missing artifact.
    pub max_retries: u32,
    /// Back-to-back repetitions of one handover pair before a stall.
    pub loop_threshold: u32,
    pub escalation: EscalationMode,
    /// Mirror every state write into the git-backed versioned store.
    pub durable_history: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            loop_threshold: 3,
            escalation: EscalationMode::Reset,
            durable_history: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl BatonConfig {
    /// Load configuration with precedence: defaults, then `baton.toml`,
    /// then `BATON_*` environment variables (`__` separates nesting, e.g.
    /// `BATON_WORKFLOW__MAX_RETRIES=5`).
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&BatonConfig::default())?);

        if Path::new("baton.toml").exists() {
            builder = builder.add_source(File::with_name("baton"));
        }

        builder = builder.add_source(
            Environment::with_prefix("BATON")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load a `.env` file if present, before configuration parsing.
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("loaded environment variables from .env");
        }
        Ok(())
    }

    /// A configuration rooted entirely under `root`; used by tests and
    /// sandboxed runs.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            paths: PathsConfig {
                state_dir: root.join("state"),
                lock_dir: root.join("locks"),
                artifacts_dir: root.join("artifacts"),
                repo_path: None,
            },
            ..Self::default()
        }
    }
}
