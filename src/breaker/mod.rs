//! Per-target circuit breaker.
//!
//! Bounds retry storms against a repeatedly-failing collaborator (an
//! unreachable tracker API, a wedged git remote). Each key carries its own
//! closed / open / half-open state; an open circuit fails calls fast until
//! the cooldown elapses, after which exactly one probe is let through.
//!
//! Breaker memory is process-local by default. Workflows that span separate
//! invocations persist it through the context store with
//! [`CircuitBreaker::persist`] / [`CircuitBreaker::load`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::coordination::{ContextStore, CoordinationError};

#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error + Send + Sync + 'static> {
    /// The target is currently untrusted; the operation was not invoked.
    /// Fail fast, do not retry until the cooldown passes.
    #[error("circuit for '{key}' is open; retry in {retry_in_ms}ms")]
    CircuitOpen { key: String, retry_in_ms: u64 },

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyState {
    failure_count: u32,
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    /// True while the single half-open probe is executing. Not persisted:
    /// a crashed probe must not block the next invocation forever.
    #[serde(skip)]
    probe_in_flight: bool,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            failure_count: 0,
            state: CircuitState::Closed,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Serializable view of every key's breaker state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    keys: HashMap<String, KeyState>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Execute `f` under the breaker for `key`.
    ///
    /// While open, returns [`BreakerError::CircuitOpen`] without invoking
    /// `f`. The decision and the outcome recording take the state lock; the
    /// operation itself runs without it.
    pub async fn call<T, E, F, Fut>(&self, key: &str, f: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit(key)?;

        match f().await {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(key);
                Err(BreakerError::Inner(err))
            }
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.keys
            .lock()
            .expect("breaker mutex poisoned")
            .get(key)
            .map(|k| k.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.keys
            .lock()
            .expect("breaker mutex poisoned")
            .get(key)
            .map(|k| k.failure_count)
            .unwrap_or(0)
    }

    fn admit<E: std::error::Error + Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> Result<(), BreakerError<E>> {
        let mut keys = self.keys.lock().expect("breaker mutex poisoned");
        let entry = keys.entry(key.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = entry.opened_at.unwrap_or_else(Utc::now);
                let elapsed = Utc::now()
                    .signed_duration_since(opened_at)
                    .to_std()
                    .unwrap_or_default();
                if elapsed >= self.cooldown {
                    info!(key, "cooldown elapsed; admitting half-open probe");
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    Ok(())
                } else {
                    let retry_in = self.cooldown - elapsed;
                    Err(BreakerError::CircuitOpen {
                        key: key.to_string(),
                        retry_in_ms: retry_in.as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    Err(BreakerError::CircuitOpen {
                        key: key.to_string(),
                        retry_in_ms: 0,
                    })
                } else {
                    entry.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self, key: &str) {
        let mut keys = self.keys.lock().expect("breaker mutex poisoned");
        let entry = keys.entry(key.to_string()).or_default();
        if entry.state != CircuitState::Closed {
            info!(key, "probe succeeded; closing circuit");
        }
        *entry = KeyState::default();
    }

    fn record_failure(&self, key: &str) {
        let mut keys = self.keys.lock().expect("breaker mutex poisoned");
        let entry = keys.entry(key.to_string()).or_default();

        match entry.state {
            CircuitState::HalfOpen => {
                warn!(key, "half-open probe failed; reopening circuit");
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Utc::now());
                entry.probe_in_flight = false;
            }
            CircuitState::Closed => {
                entry.failure_count += 1;
                debug!(key, failures = entry.failure_count, "failure recorded");
                if entry.failure_count >= self.threshold {
                    warn!(
                        key,
                        failures = entry.failure_count,
                        threshold = self.threshold,
                        "failure threshold reached; opening circuit"
                    );
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Utc::now());
                }
            }
            CircuitState::Open => {
                // Failure recorded by a call admitted before the flip;
                // the circuit is already open.
                entry.failure_count += 1;
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            keys: self.keys.lock().expect("breaker mutex poisoned").clone(),
        }
    }

    pub fn restore(&self, snapshot: BreakerSnapshot) {
        *self.keys.lock().expect("breaker mutex poisoned") = snapshot.keys;
    }

    /// Persist breaker state through the context store so circuits stay
    /// open across short-lived invocations.
    pub fn persist(&self, store: &ContextStore, path: &str) -> Result<(), CoordinationError> {
        let body = serde_json::to_string_pretty(&self.snapshot())?;
        store.write_atomic(path, &body, None)?;
        Ok(())
    }

    pub fn load(
        threshold: u32,
        cooldown: Duration,
        store: &ContextStore,
        path: &str,
    ) -> Result<Self, CoordinationError> {
        let breaker = Self::new(threshold, cooldown);
        if let Some((body, _)) = store.read_optional(path)? {
            let snapshot: BreakerSnapshot = serde_json::from_str(&body)?;
            breaker.restore(snapshot);
        }
        Ok(breaker)
    }
}
