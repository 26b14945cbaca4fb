//! Canary sandbox: a throwaway copy of the repository with the proposal overlaid.
//!
//! The directory is a [`tempfile::TempDir`], so it is removed when the handle is
//! dropped on any path (error, timeout, panic unwinding). [`CanarySandbox::teardown`]
//! removes it eagerly and reports failures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tempfile::TempDir;
use uuid::Uuid;

use admission_core::{AdmissionError, Result};

use crate::live_tree::resolve_governed_path;

/// Where and how sandboxes are created.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub repo_root: PathBuf,
    /// Scratch area that holds every sandbox. Never copied into a sandbox.
    pub scratch_dir: PathBuf,
    /// Directory names skipped anywhere in the tree.
    pub excludes: Vec<String>,
    /// Additional absolute paths skipped (e.g. the state directory).
    pub skip_paths: Vec<PathBuf>,
    pub copy_timeout: Duration,
}

pub struct CanarySandbox {
    dir: TempDir,
    trial_id: Uuid,
}

impl CanarySandbox {
    /// Copy the repository into a fresh sandbox and overlay `payload_files`.
    pub async fn create(
        spec: &SandboxSpec,
        payload_files: &BTreeMap<String, String>,
        trial_id: Uuid,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&spec.scratch_dir)
            .await
            .map_err(|e| AdmissionError::io(&spec.scratch_dir, e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("canary-{trial_id}-"))
            .tempdir_in(&spec.scratch_dir)
            .map_err(|e| AdmissionError::io(&spec.scratch_dir, e))?;

        tracing::debug!(
            target: "admission.sandbox",
            trial_id = %trial_id,
            sandbox = %dir.path().display(),
            "sandbox allocated"
        );

        let sandbox = Self { dir, trial_id };
        sandbox.copy_repository(spec).await?;
        sandbox.overlay(payload_files).await?;
        Ok(sandbox)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn trial_id(&self) -> Uuid {
        self.trial_id
    }

    /// Remove the sandbox now.
    pub fn teardown(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        let trial_id = self.trial_id;
        self.dir
            .close()
            .map_err(|e| AdmissionError::io(&path, e))?;
        tracing::debug!(
            target: "admission.sandbox",
            trial_id = %trial_id,
            sandbox = %path.display(),
            "sandbox torn down"
        );
        Ok(())
    }

    async fn copy_repository(&self, spec: &SandboxSpec) -> Result<()> {
        let cancel = Arc::new(AtomicBool::new(false));
        let job = CopyJob {
            source: spec.repo_root.clone(),
            dest: self.dir.path().to_path_buf(),
            excludes: spec.excludes.clone(),
            skip_paths: canonical_skips(spec),
            cancel: cancel.clone(),
        };
        let mut handle = tokio::task::spawn_blocking(move || job.run());

        match tokio::time::timeout(spec.copy_timeout, &mut handle).await {
            Ok(Ok(Ok(copied))) => {
                tracing::debug!(
                    target: "admission.sandbox",
                    trial_id = %self.trial_id,
                    files = copied,
                    "repository copied into sandbox"
                );
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(AdmissionError::CanaryInfrastructure(format!(
                "sandbox copy failed: {e:#}"
            ))),
            Ok(Err(join_err)) => Err(AdmissionError::CanaryInfrastructure(format!(
                "sandbox copy worker died: {join_err}"
            ))),
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                // Let the worker observe the flag before the directory is removed under it.
                let _ = handle.await;
                Err(AdmissionError::CanaryInfrastructure(format!(
                    "sandbox copy exceeded {}s timeout",
                    spec.copy_timeout.as_secs()
                )))
            }
        }
    }

    async fn overlay(&self, payload_files: &BTreeMap<String, String>) -> Result<()> {
        for (relative, content) in payload_files {
            // Resolved against the sandbox root: a copied symlink may not carry the
            // write out of the sandbox.
            let target = resolve_governed_path(self.dir.path(), relative)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AdmissionError::io(parent, e))?;
            }
            // A symlink copied from the repository must not redirect the write.
            if tokio::fs::symlink_metadata(&target)
                .await
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                tokio::fs::remove_file(&target)
                    .await
                    .map_err(|e| AdmissionError::io(&target, e))?;
            }
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| AdmissionError::io(&target, e))?;
        }
        Ok(())
    }
}

fn canonical_skips(spec: &SandboxSpec) -> Vec<PathBuf> {
    std::iter::once(&spec.scratch_dir)
        .chain(spec.skip_paths.iter())
        .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
        .collect()
}

struct CopyJob {
    source: PathBuf,
    dest: PathBuf,
    excludes: Vec<String>,
    skip_paths: Vec<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl CopyJob {
    /// Returns the number of files copied.
    fn run(self) -> anyhow::Result<usize> {
        let source = std::fs::canonicalize(&self.source)
            .with_context(|| format!("repository root {}", self.source.display()))?;
        let mut copied = 0usize;
        let mut stack = vec![(source.clone(), self.dest.clone())];

        while let Some((from_dir, to_dir)) = stack.pop() {
            for entry in std::fs::read_dir(&from_dir)
                .with_context(|| format!("read {}", from_dir.display()))?
            {
                if self.cancel.load(Ordering::SeqCst) {
                    return Err(anyhow!("copy cancelled"));
                }
                let entry = entry.with_context(|| format!("read {}", from_dir.display()))?;
                let from = entry.path();
                let name = entry.file_name();
                if self.excludes.iter().any(|ex| name.to_string_lossy() == ex.as_str()) {
                    continue;
                }
                if self.skip_paths.iter().any(|skip| from == *skip) {
                    continue;
                }
                let to = to_dir.join(&name);
                let file_type = entry
                    .file_type()
                    .with_context(|| format!("stat {}", from.display()))?;

                if file_type.is_symlink() {
                    copy_symlink(&from, &to, &source, &self.dest)?;
                } else if file_type.is_dir() {
                    std::fs::create_dir_all(&to)
                        .with_context(|| format!("create {}", to.display()))?;
                    stack.push((from, to));
                } else if file_type.is_file() {
                    std::fs::copy(&from, &to)
                        .with_context(|| format!("copy {}", from.display()))?;
                    copied += 1;
                }
            }
        }
        Ok(copied)
    }
}

/// Absolute links into the repository are re-pointed at the same place in the
/// sandbox. Links elsewhere are kept as they are; the overlay refuses to write
/// through them.
#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path, source_root: &Path, dest_root: &Path) -> anyhow::Result<()> {
    let target = std::fs::read_link(from).with_context(|| format!("readlink {}", from.display()))?;
    let target = if target.is_absolute() {
        rebase_into_sandbox(&target, source_root, dest_root).unwrap_or(target)
    } else {
        target
    };
    std::os::unix::fs::symlink(&target, to).with_context(|| format!("symlink {}", to.display()))
}

#[cfg(unix)]
fn rebase_into_sandbox(target: &Path, source_root: &Path, dest_root: &Path) -> Option<PathBuf> {
    let real = std::fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
    real.strip_prefix(source_root)
        .ok()
        .map(|rest| dest_root.join(rest))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, _to: &Path, _source_root: &Path, _dest_root: &Path) -> anyhow::Result<()> {
    tracing::warn!(
        target: "admission.sandbox",
        path = %from.display(),
        "symlink skipped"
    );
    Ok(())
}
