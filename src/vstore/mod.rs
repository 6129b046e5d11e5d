//! Durable versioned store on the git object database.
//!
//! A key/blob store committed onto a dedicated reference
//! (`refs/baton/<name>`). The store owns that reference exclusively and
//! works purely against the object database: it never reads or mutates the
//! caller's HEAD, index, or working tree, so agent checkouts stay
//! undisturbed no matter how often state is written.
//!
//! Reference updates are compare-and-swap on the old tip. A concurrent
//! writer moving the reference fails the update with
//! [`VersionedStoreError::RefMoved`], which callers retry through the
//! retry layer; this is the same optimistic-concurrency shape as the
//! context store's hash precondition, one level down.

use git2::{ObjectType, Oid, Repository, Signature, Tree, TreeWalkMode, TreeWalkResult};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

const FILE_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;

#[derive(Debug, Error)]
pub enum VersionedStoreError {
    #[error("no entry at '{path}' on {reference}")]
    NotFound { path: String, reference: String },

    /// The reference moved between reading the tip and updating it.
    /// Retryable: rebuild against the new tip and try again.
    #[error("reference {reference} moved concurrently; write must be retried")]
    RefMoved { reference: String },

    #[error("invalid store path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid commit id '{0}'")]
    InvalidCommitId(String),

    #[error(transparent)]
    Git(#[from] git2::Error),
}

#[derive(Debug, Clone)]
pub struct StoreCommit {
    pub id: String,
    pub message: String,
    pub timestamp: i64,
}

pub struct VersionedStore {
    repo: Repository,
    ref_name: String,
}

impl VersionedStore {
    /// Open the store over an existing repository. `name` scopes the
    /// dedicated reference, e.g. `state` → `refs/baton/state`.
    pub fn open(repo_path: impl AsRef<Path>, name: &str) -> Result<Self, VersionedStoreError> {
        let repo = Repository::open(repo_path)?;
        Ok(Self {
            repo,
            ref_name: format!("refs/baton/{name}"),
        })
    }

    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    fn signature(&self) -> Result<Signature<'_>, git2::Error> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Signature::now("baton", "noreply@baton.dev"),
        }
    }

    fn tip(&self) -> Result<Option<git2::Commit<'_>>, git2::Error> {
        match self.repo.find_reference(&self.ref_name) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn split_path(path: &str) -> Result<Vec<&str>, VersionedStoreError> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return Err(VersionedStoreError::InvalidPath {
                path: path.to_string(),
                reason: "empty path".to_string(),
            });
        }
        if parts.iter().any(|p| *p == "." || *p == "..") {
            return Err(VersionedStoreError::InvalidPath {
                path: path.to_string(),
                reason: "relative components not allowed".to_string(),
            });
        }
        Ok(parts)
    }

    fn upsert_tree(
        &self,
        base: Option<&Tree<'_>>,
        parts: &[&str],
        blob: Oid,
    ) -> Result<Oid, git2::Error> {
        let mut builder = self.repo.treebuilder(base)?;
        if parts.len() == 1 {
            builder.insert(parts[0], blob, FILE_MODE)?;
        } else {
            let sub_base = base
                .and_then(|t| t.get_name(parts[0]))
                .and_then(|entry| entry.to_object(&self.repo).ok())
                .and_then(|obj| obj.into_tree().ok());
            let sub_oid = self.upsert_tree(sub_base.as_ref(), &parts[1..], blob)?;
            builder.insert(parts[0], sub_oid, TREE_MODE)?;
        }
        builder.write()
    }

    /// Write `content` at `path`, committing onto the store reference.
    /// Returns the new commit id; every write stays recoverable by it.
    pub fn write(&self, path: &str, content: &str) -> Result<String, VersionedStoreError> {
        let parts = Self::split_path(path)?;
        let blob = self.repo.blob(content.as_bytes())?;

        let parent = self.tip()?;
        let base_tree = match &parent {
            Some(commit) => Some(commit.tree()?),
            None => None,
        };
        let tree_oid = self.upsert_tree(base_tree.as_ref(), &parts, blob)?;
        let tree = self.repo.find_tree(tree_oid)?;

        let sig = self.signature()?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        // update_ref stays None: the reference only ever moves through the
        // compare-and-swap below.
        let commit_oid = self.repo.commit(
            None,
            &sig,
            &sig,
            &format!("baton: update {path}"),
            &tree,
            &parents,
        )?;

        let expected_tip = parent.as_ref().map(|c| c.id()).unwrap_or_else(Oid::zero);
        match self.repo.reference_matching(
            &self.ref_name,
            commit_oid,
            true,
            expected_tip,
            &format!("baton: update {path}"),
        ) {
            Ok(_) => {
                debug!(path, commit = %commit_oid, reference = %self.ref_name, "versioned write committed");
                Ok(commit_oid.to_string())
            }
            Err(e) if e.code() == git2::ErrorCode::Modified => {
                warn!(reference = %self.ref_name, "reference moved during write");
                Err(VersionedStoreError::RefMoved {
                    reference: self.ref_name.clone(),
                })
            }
            Err(e) if e.code() == git2::ErrorCode::Exists => Err(VersionedStoreError::RefMoved {
                reference: self.ref_name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Read `path` at the current tip of the store reference.
    pub fn read(&self, path: &str) -> Result<String, VersionedStoreError> {
        let tip = self.tip()?.ok_or_else(|| VersionedStoreError::NotFound {
            path: path.to_string(),
            reference: self.ref_name.clone(),
        })?;
        self.read_from_commit(&tip, path)
    }

    /// Read `path` as of a specific commit id.
    pub fn read_at(&self, commit_id: &str, path: &str) -> Result<String, VersionedStoreError> {
        let oid = Oid::from_str(commit_id)
            .map_err(|_| VersionedStoreError::InvalidCommitId(commit_id.to_string()))?;
        let commit = self.repo.find_commit(oid)?;
        self.read_from_commit(&commit, path)
    }

    fn read_from_commit(
        &self,
        commit: &git2::Commit<'_>,
        path: &str,
    ) -> Result<String, VersionedStoreError> {
        let tree = commit.tree()?;
        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| VersionedStoreError::NotFound {
                path: path.to_string(),
                reference: self.ref_name.clone(),
            })?;
        let blob = entry.to_object(&self.repo)?.peel_to_blob()?;
        Ok(String::from_utf8_lossy(blob.content()).into_owned())
    }

    /// All paths present at the current tip.
    pub fn list(&self) -> Result<Vec<String>, VersionedStoreError> {
        let Some(tip) = self.tip()? else {
            return Ok(Vec::new());
        };
        let tree = tip.tree()?;
        let mut paths = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    paths.push(format!("{root}{name}"));
                }
            }
            TreeWalkResult::Ok
        })?;
        paths.sort();
        Ok(paths)
    }

    /// Commit history of the store reference, newest first.
    pub fn history(&self) -> Result<Vec<StoreCommit>, VersionedStoreError> {
        let Some(tip) = self.tip()? else {
            return Ok(Vec::new());
        };
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(tip.id())?;
        let mut commits = Vec::new();
        for oid in revwalk {
            let oid = oid?;
            let commit = self.repo.find_commit(oid)?;
            commits.push(StoreCommit {
                id: oid.to_string(),
                message: commit.message().unwrap_or("").to_string(),
                timestamp: commit.time().seconds(),
            });
        }
        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, VersionedStore) {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path()).unwrap();
        let store = VersionedStore::open(dir.path(), "state").unwrap();
        (dir, store)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, store) = test_store();

        store.write("workflow/prd-1.json", "{\"phase\":1}").unwrap();
        assert_eq!(store.read("workflow/prd-1.json").unwrap(), "{\"phase\":1}");
    }

    #[test]
    fn overwrites_are_new_commits_and_history_is_recoverable() {
        let (_dir, store) = test_store();

        let first = store.write("ctx.md", "v1").unwrap();
        let second = store.write("ctx.md", "v2").unwrap();
        assert_ne!(first, second);

        assert_eq!(store.read("ctx.md").unwrap(), "v2");
        assert_eq!(store.read_at(&first, "ctx.md").unwrap(), "v1");

        let history = store.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second);
    }

    #[test]
    fn list_walks_nested_trees() {
        let (_dir, store) = test_store();

        store.write("a.txt", "a").unwrap();
        store.write("nested/deep/b.txt", "b").unwrap();

        let paths = store.list().unwrap();
        assert_eq!(paths, vec!["a.txt", "nested/deep/b.txt"]);
    }

    #[test]
    fn missing_entry_is_not_found() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.read("absent"),
            Err(VersionedStoreError::NotFound { .. })
        ));

        store.write("present", "x").unwrap();
        assert!(matches!(
            store.read("absent"),
            Err(VersionedStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn never_touches_working_tree_or_head() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("user-file.txt"), "untracked").unwrap();

        let store = VersionedStore::open(dir.path(), "state").unwrap();
        store.write("ctx.md", "state data").unwrap();
        store.write("ctx.md", "more state").unwrap();

        // The caller's untracked file is the only status entry, unchanged.
        let statuses = repo.statuses(None).unwrap();
        let paths: Vec<_> = statuses
            .iter()
            .filter_map(|s| s.path().map(str::to_string))
            .collect();
        assert_eq!(paths, vec!["user-file.txt"]);
        // HEAD stays unborn; the store never creates branches.
        assert!(repo.head().is_err());
    }

    #[test]
    fn rejects_traversal_paths() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.write("../escape", "x"),
            Err(VersionedStoreError::InvalidPath { .. })
        ));
        assert!(matches!(
            store.write("", "x"),
            Err(VersionedStoreError::InvalidPath { .. })
        ));
    }
}
