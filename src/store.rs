//! Filesystem proposal store.
//!
//! Pending layout:
//!   `<pending>/<id>.yaml`                      single-file proposal
//!   `<pending>/<id>/manifest.yaml` + `payload/` crate
//!
//! Processed proposals move to `<processed>/<accepted|rejected>/<id>/` alongside a
//! `result.yaml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_yaml::Value;
use tokio::io::AsyncWriteExt;

use admission_core::ports::ProposalStore;
use admission_core::{
    AdmissionError, ProposalDocument, ProposalFlavor, ResultRecord, Result, Signature,
};

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const PAYLOAD_DIR: &str = "payload";
pub const RESULT_FILE: &str = "result.yaml";

pub struct FsProposalStore {
    pending_dir: PathBuf,
    processed_dir: PathBuf,
}

impl FsProposalStore {
    pub fn new(pending_dir: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            pending_dir: pending_dir.into(),
            processed_dir: processed_dir.into(),
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.pending_dir.join(format!("{id}.yaml"))
    }

    fn crate_dir(&self, id: &str) -> PathBuf {
        self.pending_dir.join(id)
    }

    /// Which flavor a pending id is stored as, if any.
    async fn locate(&self, id: &str) -> Result<Option<ProposalFlavor>> {
        check_id(id)?;
        if exists(&self.file_path(id)).await {
            return Ok(Some(ProposalFlavor::File));
        }
        if exists(&self.crate_dir(id).join(MANIFEST_FILE)).await {
            return Ok(Some(ProposalFlavor::Crate));
        }
        Ok(None)
    }

    fn manifest_path(&self, id: &str, flavor: ProposalFlavor) -> PathBuf {
        match flavor {
            ProposalFlavor::File => self.file_path(id),
            ProposalFlavor::Crate => self.crate_dir(id).join(MANIFEST_FILE),
        }
    }

    async fn read_payload(dir: &Path) -> Result<BTreeMap<String, String>> {
        let mut files = BTreeMap::new();
        if !exists(dir).await {
            return Ok(files);
        }
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|e| AdmissionError::io(&current, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| AdmissionError::io(&current, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| AdmissionError::io(&path, e))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let relative = path
                    .strip_prefix(dir)
                    .map_err(|e| AdmissionError::Internal(e.into()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| AdmissionError::io(&path, e))?;
                let content = String::from_utf8(bytes).map_err(|_| {
                    AdmissionError::InvalidInput(format!(
                        "payload file {} is not UTF-8",
                        path.display()
                    ))
                })?;
                files.insert(relative, content);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl ProposalStore for FsProposalStore {
    async fn list_pending(&self) -> Result<Vec<String>> {
        if !exists(&self.pending_dir).await {
            return Ok(vec![]);
        }
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.pending_dir)
            .await
            .map_err(|e| AdmissionError::io(&self.pending_dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AdmissionError::io(&self.pending_dir, e))?
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                if exists(&path.join(MANIFEST_FILE)).await {
                    ids.push(name);
                }
            } else if let Some(id) = name.strip_suffix(".yaml") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn load(&self, id: &str) -> Result<ProposalDocument> {
        let flavor = self
            .locate(id)
            .await?
            .ok_or_else(|| AdmissionError::NotFound(format!("pending proposal '{id}'")))?;
        let manifest_path = self.manifest_path(id, flavor);
        let manifest = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| AdmissionError::io(&manifest_path, e))?;
        let payload_files = match flavor {
            ProposalFlavor::File => BTreeMap::new(),
            ProposalFlavor::Crate => Self::read_payload(&self.crate_dir(id).join(PAYLOAD_DIR)).await?,
        };
        Ok(ProposalDocument {
            id: id.to_string(),
            flavor,
            manifest,
            payload_files,
        })
    }

    async fn store_signatures(&self, id: &str, signatures: &[Signature]) -> Result<()> {
        let flavor = self
            .locate(id)
            .await?
            .ok_or_else(|| AdmissionError::NotFound(format!("pending proposal '{id}'")))?;
        let path = self.manifest_path(id, flavor);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AdmissionError::io(&path, e))?;

        // Edit the document as a generic value so unknown keys survive the rewrite.
        let mut document: Value = serde_yaml::from_str(&raw)
            .map_err(|e| AdmissionError::InvalidInput(format!("{}: {e}", path.display())))?;
        let Value::Mapping(map) = &mut document else {
            return Err(AdmissionError::InvalidInput(format!(
                "{} is not a YAML mapping",
                path.display()
            )));
        };
        let value = serde_yaml::to_value(signatures)
            .map_err(|e| AdmissionError::Internal(anyhow::anyhow!("serialize signatures: {e}")))?;
        map.insert(Value::from("signatures"), value);

        let rendered = serde_yaml::to_string(&document)
            .map_err(|e| AdmissionError::Internal(anyhow::anyhow!("serialize proposal: {e}")))?;
        write_atomic(&path, rendered.as_bytes()).await
    }

    async fn submit(&self, document: &ProposalDocument) -> Result<()> {
        if document.flavor != ProposalFlavor::File {
            return Err(AdmissionError::InvalidInput(
                "only single-file proposals can be submitted".to_string(),
            ));
        }
        if self.locate(&document.id).await?.is_some() {
            return Err(AdmissionError::Conflict(format!(
                "proposal '{}' is already pending",
                document.id
            )));
        }
        tokio::fs::create_dir_all(&self.pending_dir)
            .await
            .map_err(|e| AdmissionError::io(&self.pending_dir, e))?;

        let path = self.file_path(&document.id);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => AdmissionError::Conflict(format!(
                    "proposal '{}' is already pending",
                    document.id
                )),
                _ => AdmissionError::io(&path, e),
            })?;
        file.write_all(document.manifest.as_bytes())
            .await
            .map_err(|e| AdmissionError::io(&path, e))?;
        file.flush().await.map_err(|e| AdmissionError::io(&path, e))?;
        Ok(())
    }

    async fn finalize(&self, id: &str, record: &ResultRecord) -> Result<String> {
        let flavor = self
            .locate(id)
            .await?
            .ok_or_else(|| AdmissionError::NotFound(format!("pending proposal '{id}'")))?;

        let bucket = self.processed_dir.join(record.status.as_str());
        tokio::fs::create_dir_all(&bucket)
            .await
            .map_err(|e| AdmissionError::io(&bucket, e))?;
        let mut dest = bucket.join(id);
        if exists(&dest).await {
            dest = bucket.join(format!("{id}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        }

        match flavor {
            ProposalFlavor::File => {
                tokio::fs::create_dir_all(&dest)
                    .await
                    .map_err(|e| AdmissionError::io(&dest, e))?;
                let from = self.file_path(id);
                let to = dest.join(format!("{id}.yaml"));
                tokio::fs::rename(&from, &to)
                    .await
                    .map_err(|e| AdmissionError::io(&from, e))?;
            }
            ProposalFlavor::Crate => {
                let from = self.crate_dir(id);
                tokio::fs::rename(&from, &dest)
                    .await
                    .map_err(|e| AdmissionError::io(&from, e))?;
            }
        }

        let result_path = dest.join(RESULT_FILE);
        let rendered = serde_yaml::to_string(record)
            .map_err(|e| AdmissionError::Internal(anyhow::anyhow!("serialize result: {e}")))?;
        write_atomic(&result_path, rendered.as_bytes()).await?;

        tracing::info!(
            target: "admission.orchestrator",
            proposal_id = id,
            status = record.status.as_str(),
            location = %dest.display(),
            "proposal finalized"
        );
        Ok(dest.display().to_string())
    }
}

/// Ids become file names, so they must be a single plain path segment.
fn check_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && !id.contains(['/', '\\'])
        && !id.contains('\0');
    if ok {
        Ok(())
    } else {
        Err(AdmissionError::InvalidInput(format!("invalid proposal id '{id}'")))
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AdmissionError::InvalidInput(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| AdmissionError::io(parent, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.tmp-{}", uuid::Uuid::new_v4().simple()));
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(AdmissionError::io(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(AdmissionError::io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use admission_core::{ResultDetails, ResultStatus};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FsProposalStore {
        FsProposalStore::new(dir.path().join("pending"), dir.path().join("processed"))
    }

    fn record(id: &str, status: ResultStatus) -> ResultRecord {
        ResultRecord {
            status,
            processed_at_utc: Utc::now(),
            details: ResultDetails {
                proposal_id: id.into(),
                flavor: ProposalFlavor::File,
                trial_id: None,
                reasons: vec![],
                findings: vec![],
                quorum: None,
                canary_metrics: BTreeMap::new(),
                rollback_record: None,
            },
        }
    }

    async fn write(path: PathBuf, content: &str) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_and_load_both_flavors() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.list_pending().await.unwrap().is_empty());

        write(store.pending_dir().join("b-file.yaml"), "target_path: a\naction: edit\n").await;
        write(
            store.pending_dir().join("a-crate").join(MANIFEST_FILE),
            "crate_id: a-crate\n",
        )
        .await;
        write(
            store.pending_dir().join("a-crate/payload/src/lib.rs"),
            "pub fn x() {}\n",
        )
        .await;
        tokio::fs::create_dir_all(store.pending_dir().join("not-a-crate"))
            .await
            .unwrap();

        assert_eq!(store.list_pending().await.unwrap(), vec!["a-crate", "b-file"]);

        let doc = store.load("a-crate").await.unwrap();
        assert_eq!(doc.flavor, ProposalFlavor::Crate);
        assert_eq!(doc.payload_files["src/lib.rs"], "pub fn x() {}\n");

        let doc = store.load("b-file").await.unwrap();
        assert_eq!(doc.flavor, ProposalFlavor::File);
        assert!(doc.payload_files.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_and_bad_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.load("nope").await,
            Err(AdmissionError::NotFound(_))
        ));
        for bad in ["", "..", "../x", "a/b", ".hidden"] {
            assert!(
                matches!(store.load(bad).await, Err(AdmissionError::InvalidInput(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn test_store_signatures_preserves_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        write(
            store.pending_dir().join("p.yaml"),
            "target_path: a\naction: edit\nreviewer_notes: keep me\nsignatures: []\n",
        )
        .await;
        let sig = Signature {
            identity: "alice".into(),
            signature_b64: "AAAA".into(),
            token: "core-proposal-v6:00".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
        };
        store.store_signatures("p", &[sig.clone()]).await.unwrap();

        let raw = tokio::fs::read_to_string(store.pending_dir().join("p.yaml"))
            .await
            .unwrap();
        let value: Value = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(value["reviewer_notes"].as_str(), Some("keep me"));
        let stored: Vec<Signature> = serde_yaml::from_value(value["signatures"].clone()).unwrap();
        assert_eq!(stored, vec![sig]);
    }

    #[tokio::test]
    async fn test_submit_refuses_existing_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let doc = ProposalDocument {
            id: "p".into(),
            flavor: ProposalFlavor::File,
            manifest: "target_path: a\naction: create\n".into(),
            payload_files: BTreeMap::new(),
        };
        store.submit(&doc).await.unwrap();
        assert!(matches!(
            store.submit(&doc).await,
            Err(AdmissionError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_moves_and_writes_result() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        write(store.pending_dir().join("p.yaml"), "target_path: a\n").await;

        let location = store
            .finalize("p", &record("p", ResultStatus::Rejected))
            .await
            .unwrap();
        let location = PathBuf::from(location);
        assert!(location.starts_with(dir.path().join("processed/rejected")));
        assert!(location.join("p.yaml").exists());
        assert!(!store.pending_dir().join("p.yaml").exists());

        let result: ResultRecord =
            serde_yaml::from_str(&std::fs::read_to_string(location.join(RESULT_FILE)).unwrap())
                .unwrap();
        assert_eq!(result.status, ResultStatus::Rejected);

        // Same id again does not clobber the earlier archive.
        write(store.pending_dir().join("p.yaml"), "target_path: a\n").await;
        let second = store
            .finalize("p", &record("p", ResultStatus::Rejected))
            .await
            .unwrap();
        assert_ne!(PathBuf::from(second), location);
        assert!(location.join(RESULT_FILE).exists());
    }

    #[tokio::test]
    async fn test_finalize_crate_moves_directory() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        write(store.pending_dir().join("c/manifest.yaml"), "crate_id: c\n").await;
        write(store.pending_dir().join("c/payload/a.txt"), "a").await;

        let location = PathBuf::from(
            store
                .finalize("c", &record("c", ResultStatus::Accepted))
                .await
                .unwrap(),
        );
        assert!(location.join("payload/a.txt").exists());
        assert!(location.join(RESULT_FILE).exists());
        assert!(!store.pending_dir().join("c").exists());
    }
}
