//! Atomic file persistence with content-hash preconditions.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::CoordinationError;

/// Atomic key/content store rooted at a state directory.
///
/// Writes land in a temporary file in the same directory and are renamed
/// over the target, so a reader never observes partial content. An
/// `expected_hash` precondition turns a write into an optimistic
/// compare-and-swap: the live hash is recomputed immediately before the
/// rename and a mismatch aborts with [`CoordinationError::IntegrityViolation`],
/// leaving the store untouched.
#[derive(Debug, Clone)]
pub struct ContextStore {
    root: PathBuf,
}

impl ContextStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn guard_path(full: &Path) -> PathBuf {
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "entry".to_string());
        full.with_file_name(format!(".{name}.guard"))
    }

    pub fn content_hash(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    /// Read content together with the hash it had at read time. The hash is
    /// the precondition token for a later [`ContextStore::write_atomic`].
    pub fn read_with_hash(&self, path: &str) -> Result<(String, String), CoordinationError> {
        let full = self.resolve(path);
        let content =
            std::fs::read_to_string(&full).map_err(|e| CoordinationError::io(&full, e))?;
        let hash = Self::content_hash(&content);
        Ok((content, hash))
    }

    /// Read returning `None` for a missing entry instead of an I/O error.
    pub fn read_optional(&self, path: &str) -> Result<Option<(String, String)>, CoordinationError> {
        match self.read_with_hash(path) {
            Ok(pair) => Ok(Some(pair)),
            Err(CoordinationError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically replace `path` with `content`.
    ///
    /// With `expected_hash`, the write succeeds only if the stored content
    /// still hashes to that value (a missing file is represented by the
    /// empty-content hash never matching). Returns the new content hash.
    pub fn write_atomic(
        &self,
        path: &str,
        content: &str,
        expected_hash: Option<&str>,
    ) -> Result<String, CoordinationError> {
        let full = self.resolve(path);
        let dir = full
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&dir).map_err(|e| CoordinationError::io(&dir, e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| CoordinationError::io(&dir, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| CoordinationError::io(tmp.path(), e))?;
        tmp.flush()
            .map_err(|e| CoordinationError::io(tmp.path(), e))?;

        // Preconditioned writes serialize the hash check and the rename
        // through a sidecar file lock, so two racing writers from the same
        // base hash cannot both pass the check.
        let mut guard_lock;
        let _guard;
        if let Some(expected) = expected_hash {
            let guard_path = Self::guard_path(&full);
            let guard_file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&guard_path)
                .map_err(|e| CoordinationError::io(&guard_path, e))?;
            guard_lock = fd_lock::RwLock::new(guard_file);
            _guard = guard_lock
                .write()
                .map_err(|e| CoordinationError::io(&guard_path, e))?;

            let actual = match std::fs::read_to_string(&full) {
                Ok(current) => Self::content_hash(&current),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::from("<absent>"),
                Err(e) => return Err(CoordinationError::io(&full, e)),
            };
            if actual != expected {
                warn!(
                    path = %full.display(),
                    expected,
                    actual,
                    "precondition hash mismatch; aborting write"
                );
                return Err(CoordinationError::IntegrityViolation {
                    path: full,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        tmp.persist(&full)
            .map_err(|e| CoordinationError::io(&full, e.error))?;
        debug!(path = %full.display(), bytes = content.len(), "atomic write committed");
        Ok(Self::content_hash(content))
    }
}
