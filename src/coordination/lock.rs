//! Marker-file locks with bounded polling and stale-lock reclaim.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::CoordinationError;
use crate::config::LockingConfig;
use crate::retry::BackoffPolicy;

/// On-disk contents of a lock marker. Carries enough identity for an
/// operator to trace a stale lock back to the invocation that left it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    pub owner_id: String,
    pub hostname: String,
    pub pid: u32,
    pub resource: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Exclusive ownership of one named resource.
///
/// Released explicitly via [`LockHandle::release`]; `Drop` removes the
/// marker best-effort so a panicking holder does not wedge the resource
/// until the staleness reclaim kicks in.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    marker: LockMarker,
    released: bool,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.marker.resource
    }

    pub fn owner_id(&self) -> &str {
        &self.marker.owner_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.marker.acquired_at
    }

    pub fn release(mut self) -> Result<(), CoordinationError> {
        self.remove_marker()?;
        self.released = true;
        Ok(())
    }

    fn remove_marker(&self) -> Result<(), CoordinationError> {
        // Only remove a marker we still own. A stale-reclaimer may have
        // replaced it while we were running.
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<LockMarker>(&raw) {
                Ok(current) if current.owner_id == self.marker.owner_id => {
                    std::fs::remove_file(&self.path)
                        .map_err(|e| CoordinationError::io(&self.path, e))?;
                    debug!(resource = %self.marker.resource, "lock released");
                    Ok(())
                }
                Ok(current) => {
                    warn!(
                        resource = %self.marker.resource,
                        our_owner = %self.marker.owner_id,
                        current_owner = %current.owner_id,
                        "lock marker was reclaimed by another owner; not removing"
                    );
                    Ok(())
                }
                Err(e) => Err(CoordinationError::CorruptMarker {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoordinationError::io(&self.path, e)),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove_marker() {
                warn!(resource = %self.marker.resource, error = %e, "failed to release lock on drop");
            }
            self.released = true;
        }
    }
}

/// Acquires and releases marker-file locks under one lock directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    lock_dir: PathBuf,
    config: LockingConfig,
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>, config: LockingConfig) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            config,
        }
    }

    fn marker_path(&self, resource: &str) -> PathBuf {
        // Resources are hierarchical names ("workflow/prd-123"); flatten
        // them into a single filename.
        let flat = resource.replace(['/', '\\'], "__");
        self.lock_dir.join(format!("{flat}.lock"))
    }

    /// Acquire an exclusive lock, polling with exponential backoff up to
    /// `timeout`. A marker past its declared expiry is treated as abandoned
    /// and reclaimed.
    pub async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<LockHandle, CoordinationError> {
        let path = self.marker_path(resource);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoordinationError::io(parent, e))?;
        }

        let backoff = BackoffPolicy {
            max_attempts: u32::MAX,
            base_delay: self.config.poll_base_delay(),
            max_delay: self.config.poll_max_delay(),
        };
        let started = Instant::now();
        let mut attempt = 1u32;

        loop {
            match self.try_create_marker(&path, resource) {
                Ok(marker) => {
                    debug!(resource, owner = %marker.owner_id, "lock acquired");
                    return Ok(LockHandle {
                        path,
                        marker,
                        released: false,
                    });
                }
                Err(CoordinationError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::AlreadyExists =>
                {
                    if self.reclaim_if_stale(&path, resource)? {
                        continue;
                    }
                }
                Err(e) => return Err(e),
            }

            if started.elapsed() >= timeout {
                return Err(CoordinationError::LockTimeout {
                    resource: resource.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            let delay = backoff.jittered_delay(attempt).min(remaining);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Run `f` while holding the lock on `resource`, releasing it on every
    /// exit path. The acquisition timeout comes from configuration.
    pub async fn with_lock<T, E, F, Fut>(&self, resource: &str, f: F) -> Result<Result<T, E>, CoordinationError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let handle = self
            .acquire(resource, self.config.acquire_timeout())
            .await?;
        let outcome = f().await;
        handle.release()?;
        Ok(outcome)
    }

    fn try_create_marker(
        &self,
        path: &Path,
        resource: &str,
    ) -> Result<LockMarker, CoordinationError> {
        let now = Utc::now();
        let marker = LockMarker {
            owner_id: uuid::Uuid::new_v4().to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            resource: resource.to_string(),
            acquired_at: now,
            expires_at: now
                + ChronoDuration::milliseconds(self.config.staleness().as_millis() as i64),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| CoordinationError::io(path, e))?;
        let body = serde_json::to_string_pretty(&marker)?;
        file.write_all(body.as_bytes())
            .map_err(|e| CoordinationError::io(path, e))?;
        file.sync_all().map_err(|e| CoordinationError::io(path, e))?;
        Ok(marker)
    }

    /// Returns true if an expired marker was removed and acquisition should
    /// be retried immediately.
    fn reclaim_if_stale(&self, path: &Path, resource: &str) -> Result<bool, CoordinationError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            // Holder released between our create attempt and this read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(CoordinationError::io(path, e)),
        };

        let marker: LockMarker = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                // An unparsable marker is indistinguishable from a crashed
                // half-write; reclaim it.
                warn!(resource, path = %path.display(), error = %e, "reclaiming corrupt lock marker");
                return self.remove_marker_file(path).map(|_| true);
            }
        };

        // Expiry is judged by the holder's own declaration, not this
        // process's staleness config; the two may be configured differently.
        if Utc::now() >= marker.expires_at {
            warn!(
                resource,
                owner = %marker.owner_id,
                holder_host = %marker.hostname,
                holder_pid = marker.pid,
                expired_at = %marker.expires_at,
                "forcibly reclaiming expired lock"
            );
            return self.remove_marker_file(path).map(|_| true);
        }
        Ok(false)
    }

    fn remove_marker_file(&self, path: &Path) -> Result<(), CoordinationError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoordinationError::io(path, e)),
        }
    }
}
