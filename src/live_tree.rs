//! Governed writes to the live repository.
//!
//! Every write goes through [`LiveTree`]: paths are resolved strictly inside the
//! repository root, each file is replaced atomically, and a batch that fails part
//! way is reverted from the rollback record captured beforehand. [`PublishLock`] is
//! the single-writer guard held while the live tree may change.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use admission_core::manifest::normalize_relative;
use admission_core::{AdmissionError, Result, RollbackEntry, RollbackRecord};

use crate::store::write_atomic;

/// Resolve `relative` under `repo_root`, refusing anything that would land outside it,
/// including through a symlinked directory.
pub fn resolve_governed_path(repo_root: &Path, relative: &str) -> Result<PathBuf> {
    let normalized =
        normalize_relative(relative).map_err(|f| AdmissionError::InvalidInput(f.message))?;
    let root = canonical_root(repo_root);
    let candidate = root.join(&normalized);

    let mut existing = candidate.parent();
    while let Some(dir) = existing {
        if dir.exists() {
            let real = std::fs::canonicalize(dir).map_err(|e| AdmissionError::io(dir, e))?;
            if !real.starts_with(&root) {
                return Err(AdmissionError::InvalidInput(format!(
                    "path '{relative}' resolves outside the repository"
                )));
            }
            break;
        }
        existing = dir.parent();
    }
    Ok(candidate)
}

fn is_absent(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

pub fn canonical_root(repo_root: &Path) -> PathBuf {
    std::fs::canonicalize(repo_root).unwrap_or_else(|_| repo_root.to_path_buf())
}

pub struct LiveTree {
    root: PathBuf,
}

impl LiveTree {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            root: canonical_root(repo_root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Prior content of every file the payload will touch.
    pub async fn capture(
        &self,
        proposal_id: &str,
        trial_id: Uuid,
        payload_files: &BTreeMap<String, String>,
    ) -> Result<RollbackRecord> {
        let mut files = Vec::with_capacity(payload_files.len());
        for relative in payload_files.keys() {
            let path = resolve_governed_path(&self.root, relative)?;
            let prior_content = match tokio::fs::read(&path).await {
                Ok(bytes) => Some(String::from_utf8(bytes).map_err(|_| {
                    AdmissionError::InvalidInput(format!(
                        "{} is not UTF-8 and cannot be governed",
                        path.display()
                    ))
                })?),
                Err(e) if is_absent(&e) => None,
                Err(e) => return Err(AdmissionError::io(&path, e)),
            };
            files.push(RollbackEntry {
                path: relative.clone(),
                prior_content,
            });
        }
        Ok(RollbackRecord {
            proposal_id: proposal_id.to_string(),
            trial_id,
            created_at: Utc::now(),
            repo_root: self.root.display().to_string(),
            files,
        })
    }

    /// Write every payload file. On failure, files already written are restored
    /// from `record` before the error is returned.
    pub async fn apply(
        &self,
        payload_files: &BTreeMap<String, String>,
        record: &RollbackRecord,
    ) -> Result<usize> {
        let mut written: Vec<&str> = Vec::new();
        for (relative, content) in payload_files {
            let result = match resolve_governed_path(&self.root, relative) {
                Ok(path) => write_atomic(&path, content.as_bytes()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(
                    target: "admission.live_tree",
                    proposal_id = %record.proposal_id,
                    path = %relative,
                    error = %e,
                    reverting = written.len(),
                    "live-tree write failed; reverting"
                );
                let partial: Vec<RollbackEntry> = record
                    .files
                    .iter()
                    .filter(|entry| written.contains(&entry.path.as_str()))
                    .cloned()
                    .collect();
                if let Err(revert_err) = self.restore_entries(&partial).await {
                    tracing::error!(
                        target: "admission.live_tree",
                        proposal_id = %record.proposal_id,
                        error = %revert_err,
                        "revert after failed write did not complete"
                    );
                }
                return Err(e);
            }
            written.push(relative.as_str());
        }
        tracing::info!(
            target: "admission.live_tree",
            proposal_id = %record.proposal_id,
            files = written.len(),
            "payload applied to live tree"
        );
        Ok(written.len())
    }

    /// Put every file in `record` back the way it was.
    pub async fn restore(&self, record: &RollbackRecord) -> Result<usize> {
        self.restore_entries(&record.files).await
    }

    async fn restore_entries(&self, entries: &[RollbackEntry]) -> Result<usize> {
        let mut first_error = None;
        let mut restored = 0;
        for entry in entries {
            let outcome = match resolve_governed_path(&self.root, &entry.path) {
                Ok(path) => match &entry.prior_content {
                    Some(content) => write_atomic(&path, content.as_bytes()).await,
                    None => match tokio::fs::remove_file(&path).await {
                        Ok(()) => Ok(()),
                        Err(e) if is_absent(&e) => Ok(()),
                        Err(e) => Err(AdmissionError::io(&path, e)),
                    },
                },
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::error!(
                        target: "admission.live_tree",
                        path = %entry.path,
                        error = %e,
                        "restore failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }
}

// ── Rollback archive ───────────────────────────────────────────

pub struct RollbackArchive {
    dir: PathBuf,
}

impl RollbackArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn store(&self, record: &RollbackRecord) -> Result<PathBuf> {
        let path = self
            .dir
            .join(format!("{}-{}.yaml", record.proposal_id, record.trial_id));
        let rendered = serde_yaml::to_string(record)
            .map_err(|e| AdmissionError::Internal(anyhow::anyhow!("serialize rollback: {e}")))?;
        write_atomic(&path, rendered.as_bytes()).await?;
        Ok(path)
    }

    pub async fn withdraw(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AdmissionError::io(path, e)),
        }
    }

    pub async fn load(path: &Path) -> Result<RollbackRecord> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => AdmissionError::NotFound(format!("rollback record {}", path.display())),
            _ => AdmissionError::io(path, e),
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| AdmissionError::InvalidInput(format!("{}: {e}", path.display())))
    }
}

// ── Single-writer lock ─────────────────────────────────────────

/// Exclusive claim on a repository's live tree, keyed on its canonical root.
///
/// An advisory `flock` on `<state>/locks/<key>.lock`. A second claimant fails
/// immediately with `Conflict`. The kernel drops the lock with the file handle, so
/// a holder that dies mid-trial leaves at most a stale file, never a held lock.
#[derive(Debug)]
pub struct PublishLock {
    path: PathBuf,
    file: File,
}

impl PublishLock {
    pub fn lock_path(state_dir: &Path, repo_root: &Path) -> PathBuf {
        let canonical = canonical_root(repo_root);
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let key = &hex::encode(digest)[..16];
        state_dir.join("locks").join(format!("{key}.lock"))
    }

    pub fn acquire(state_dir: &Path, repo_root: &Path, holder: &str) -> Result<Self> {
        let path = Self::lock_path(state_dir, repo_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AdmissionError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| AdmissionError::io(&path, e))?;
        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == lock_contended_errno() {
                AdmissionError::Conflict(format!(
                    "live tree {} is locked by another admission ({})",
                    repo_root.display(),
                    path.display()
                ))
            } else {
                AdmissionError::io(&path, e)
            }
        })?;

        // Holder details are informational; the lock itself is the flock.
        if let Err(e) = write_holder(&mut file, holder) {
            tracing::warn!(
                target: "admission.live_tree",
                lock = %path.display(),
                error = %e,
                "could not record publish lock holder"
            );
        }
        tracing::debug!(
            target: "admission.live_tree",
            lock = %path.display(),
            holder,
            "publish lock acquired"
        );
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_holder(file: &mut File, holder: &str) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(
        file,
        "holder: {holder}\npid: {}\nacquired_at: {}",
        std::process::id(),
        Utc::now().to_rfc3339()
    )?;
    file.flush()
}

/// `fs2` reports contention as the platform's own lock error.
fn lock_contended_errno() -> Option<i32> {
    fs2::lock_contended_error().raw_os_error()
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        // The file stays; removing it would race a claimant that already opened it.
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(
                target: "admission.live_tree",
                lock = %self.path.display(),
                error = %e,
                "failed to release publish lock"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn payload(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_refuses_escape() {
        let repo = TempDir::new().unwrap();
        assert!(resolve_governed_path(repo.path(), "../x").is_err());
        assert!(resolve_governed_path(repo.path(), "/etc/passwd").is_err());
        let ok = resolve_governed_path(repo.path(), "a/b/c.txt").unwrap();
        assert!(ok.starts_with(canonical_root(repo.path())));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_refuses_symlinked_directory() {
        let repo = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), repo.path().join("link")).unwrap();
        assert!(resolve_governed_path(repo.path(), "link/file.txt").is_err());
    }

    #[tokio::test]
    async fn test_capture_apply_restore() {
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("existing.txt"), "old").unwrap();
        let tree = LiveTree::new(repo.path());
        let files = payload(&[("existing.txt", "new"), ("fresh/created.txt", "hello")]);

        let record = tree.capture("p1", Uuid::new_v4(), &files).await.unwrap();
        assert_eq!(record.files.len(), 2);
        assert_eq!(record.files[0].prior_content.as_deref(), Some("old"));
        assert_eq!(record.files[1].prior_content, None);

        assert_eq!(tree.apply(&files, &record).await.unwrap(), 2);
        assert_eq!(std::fs::read_to_string(repo.path().join("existing.txt")).unwrap(), "new");
        assert_eq!(
            std::fs::read_to_string(repo.path().join("fresh/created.txt")).unwrap(),
            "hello"
        );

        assert_eq!(tree.restore(&record).await.unwrap(), 2);
        assert_eq!(std::fs::read_to_string(repo.path().join("existing.txt")).unwrap(), "old");
        assert!(!repo.path().join("fresh/created.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_apply_reverts_written_files() {
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("a.txt"), "a-old").unwrap();
        // A regular file where a directory is needed makes the second write fail.
        std::fs::write(repo.path().join("blocker"), "file").unwrap();
        let tree = LiveTree::new(repo.path());
        let files = payload(&[("a.txt", "a-new"), ("blocker/b.txt", "b")]);

        let record = tree.capture("p1", Uuid::new_v4(), &files).await.unwrap();
        assert!(tree.apply(&files, &record).await.is_err());
        assert_eq!(std::fs::read_to_string(repo.path().join("a.txt")).unwrap(), "a-old");
        assert_eq!(std::fs::read_to_string(repo.path().join("blocker")).unwrap(), "file");
    }

    #[tokio::test]
    async fn test_archive_store_load_withdraw() {
        let state = TempDir::new().unwrap();
        let archive = RollbackArchive::new(state.path().join("rollbacks"));
        let record = RollbackRecord {
            proposal_id: "p1".into(),
            trial_id: Uuid::new_v4(),
            created_at: Utc::now(),
            repo_root: "/repo".into(),
            files: vec![RollbackEntry {
                path: "a.txt".into(),
                prior_content: None,
            }],
        };
        let path = archive.store(&record).await.unwrap();
        assert_eq!(RollbackArchive::load(&path).await.unwrap(), record);
        archive.withdraw(&path).await.unwrap();
        assert!(!path.exists());
        assert!(matches!(
            RollbackArchive::load(&path).await,
            Err(AdmissionError::NotFound(_))
        ));
    }

    #[test]
    fn test_publish_lock_is_exclusive() {
        let state = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let first = PublishLock::acquire(state.path(), repo.path(), "p1").unwrap();
        let err = PublishLock::acquire(state.path(), repo.path(), "p2").unwrap_err();
        assert!(matches!(err, AdmissionError::Conflict(_)));

        let other_repo = TempDir::new().unwrap();
        let independent = PublishLock::acquire(state.path(), other_repo.path(), "p3").unwrap();

        let path = first.path().to_path_buf();
        assert!(std::fs::read_to_string(&path).unwrap().contains("holder: p1"));
        drop(first);
        let second = PublishLock::acquire(state.path(), repo.path(), "p2").unwrap();
        assert!(std::fs::read_to_string(second.path()).unwrap().starts_with("holder: p2\n"));
        drop(independent);
    }

    #[test]
    fn test_stale_lock_file_does_not_block() {
        let state = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        // What a holder killed mid-trial leaves behind: the file, but no flock.
        let path = PublishLock::lock_path(state.path(), repo.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "holder: crashed\npid: 999999\n").unwrap();

        let lock = PublishLock::acquire(state.path(), repo.path(), "after-crash").unwrap();
        assert!(std::fs::read_to_string(lock.path())
            .unwrap()
            .contains("holder: after-crash"));
        assert!(!std::fs::read_to_string(lock.path()).unwrap().contains("crashed"));
    }
}
