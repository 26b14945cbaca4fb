//! Append-only JSON-lines audit log of admission verbs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use admission_core::ports::AuditSink;
use admission_core::{AdmissionAuditEntry, AdmissionError, Result};

pub struct JsonlAuditLog {
    path: PathBuf,
    // Serializes appends from concurrent tasks in this process.
    write_guard: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read_all(path: &Path) -> Result<Vec<AdmissionAuditEntry>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(AdmissionError::io(path, e)),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| AdmissionError::InvalidInput(format!("{}: {e}", path.display())))
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, entry: &AdmissionAuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| AdmissionError::Internal(anyhow::anyhow!("serialize audit entry: {e}")))?;
        line.push('\n');

        let _guard = self.write_guard.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AdmissionError::io(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AdmissionError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AdmissionError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| AdmissionError::io(&self.path, e))?;
        Ok(())
    }
}
