//! Resource-aware admission control for heavy operations.
//!
//! Running many independent test suites in parallel on a constrained host
//! degrades into system-wide thrashing. This controller trades throughput
//! for stability: admission is refused outright when live resource usage is
//! over the configured ceilings (fail fast, never queue-and-block), and at
//! most one heavy batch runs at a time across every cooperating process,
//! enforced by an OS file lock on a shared slot file.

mod probe;

pub use probe::{ResourceProbe, ResourceSample, SystemResourceProbe};
#[cfg(test)]
pub use probe::MockResourceProbe;

use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AdmissionConfig;

#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Resources are currently insufficient. The caller may resubmit
    /// later; nothing was executed.
    #[error("admission denied: {reason}")]
    AdmissionDenied { reason: String },

    /// Another heavy batch held the global slot beyond our wait budget.
    #[error("execution slot still held after {waited_ms}ms")]
    SlotTimeout { waited_ms: u64 },

    #[error("resource probe failed: {0}")]
    ProbeFailed(String),

    #[error("I/O error on slot file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A unit of heavy work plus how it should be chunked.
#[derive(Debug)]
pub struct ExecutionBatch<T> {
    pub items: Vec<T>,
    pub batch_size: usize,
}

impl<T> ExecutionBatch<T> {
    pub fn new(items: Vec<T>, batch_size: usize) -> Self {
        Self {
            items,
            batch_size: batch_size.max(1),
        }
    }
}

/// Outcome of a batch run. `aborted` carries the fatal item error, typed,
/// when execution stopped early so callers can branch on what went wrong;
/// results up to that point are always kept.
#[derive(Debug)]
pub struct ExecutionReport<R, E> {
    pub completed: Vec<R>,
    pub aborted: Option<E>,
    pub sub_batches_run: usize,
}

impl<R, E> ExecutionReport<R, E> {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

pub struct AdmissionController {
    slot_path: PathBuf,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(slot_path: impl Into<PathBuf>, config: AdmissionConfig) -> Self {
        Self {
            slot_path: slot_path.into(),
            config,
        }
    }

    /// Submit a batch for execution.
    ///
    /// Denies immediately when the probe reports usage over a ceiling.
    /// Otherwise acquires the single global execution slot, runs sub-batches
    /// of `batch.batch_size` sequentially with a recovery delay between
    /// them, and releases the slot when everything finished or the first
    /// item failed fatally.
    pub async fn submit<T, R, E, F, Fut>(
        &self,
        batch: ExecutionBatch<T>,
        probe: &dyn ResourceProbe,
        mut run_item: F,
    ) -> Result<ExecutionReport<R, E>, AdmissionError>
    where
        E: std::fmt::Display,
        F: FnMut(T) -> Fut,
        Fut: std::future::Future<Output = Result<R, E>>,
    {
        self.check_resources(probe)?;

        let file = self.open_slot_file()?;
        let mut slot = fd_lock::RwLock::new(file);
        let started = Instant::now();
        let _ticket = loop {
            match slot.try_write() {
                Ok(guard) => break guard,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= self.config.slot_timeout() {
                        return Err(AdmissionError::SlotTimeout {
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(self.config.slot_poll_delay()).await;
                }
                Err(e) => {
                    return Err(AdmissionError::Io {
                        path: self.slot_path.clone(),
                        source: e,
                    })
                }
            }
        };
        debug!(slot = %self.slot_path.display(), "execution slot acquired");

        let batch_size = batch.batch_size;
        let total = batch.items.len();
        let mut completed = Vec::with_capacity(total);
        let mut sub_batches_run = 0usize;
        let mut aborted = None;

        'outer: for (chunk_index, chunk) in chunks(batch.items, batch_size).into_iter().enumerate()
        {
            if chunk_index > 0 {
                // Recovery pause lets the host settle between sub-batches.
                tokio::time::sleep(self.config.recovery_delay()).await;
            }
            sub_batches_run += 1;
            for item in chunk {
                match run_item(item).await {
                    Ok(result) => completed.push(result),
                    Err(e) => {
                        warn!(
                            sub_batch = chunk_index,
                            completed = completed.len(),
                            total,
                            error = %e,
                            "fatal item failure; aborting batch"
                        );
                        aborted = Some(e);
                        break 'outer;
                    }
                }
            }
        }

        info!(
            completed = completed.len(),
            total,
            sub_batches = sub_batches_run,
            aborted = aborted.is_some(),
            "batch execution finished"
        );
        Ok(ExecutionReport {
            completed,
            aborted,
            sub_batches_run,
        })
    }

    fn check_resources(&self, probe: &dyn ResourceProbe) -> Result<(), AdmissionError> {
        let sample = probe
            .sample()
            .map_err(|e| AdmissionError::ProbeFailed(e.to_string()))?;

        if sample.memory_used_percent > self.config.memory_ceiling_percent {
            return Err(AdmissionError::AdmissionDenied {
                reason: format!(
                    "memory at {:.1}% exceeds ceiling {:.1}%",
                    sample.memory_used_percent, self.config.memory_ceiling_percent
                ),
            });
        }
        if sample.load_average > self.config.load_ceiling {
            return Err(AdmissionError::AdmissionDenied {
                reason: format!(
                    "load average {:.2} exceeds ceiling {:.2}",
                    sample.load_average, self.config.load_ceiling
                ),
            });
        }
        Ok(())
    }

    fn open_slot_file(&self) -> Result<std::fs::File, AdmissionError> {
        if let Some(parent) = self.slot_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AdmissionError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.slot_path)
            .map_err(|e| AdmissionError::Io {
                path: self.slot_path.clone(),
                source: e,
            })
    }
}

fn chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            out.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
