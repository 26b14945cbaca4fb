//! Shared fixtures for admission integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use tempfile::TempDir;

use admission_core::ledger::verifying_key_to_pem;
use admission_core::ports::AuditRunner;
use admission_core::quorum::{QuorumCounts, QuorumMode};
use admission_core::registry::{RawQuorumSection, RawRegistry};
use admission_core::{Approver, AuditFinding, Severity};
use admission_gate::{AdmissionConfig, AdmissionOrchestrator};

pub const CHARTER: &str = ".intent/charter.yaml";

/// Audit runner that counts calls, records the sandbox root it saw, and returns
/// a fixed set of findings.
#[derive(Default)]
pub struct CountingRunner {
    pub calls: AtomicUsize,
    pub findings: Vec<AuditFinding>,
    pub seen_roots: std::sync::Mutex<Vec<PathBuf>>,
}

impl CountingRunner {
    pub fn clean() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_findings(findings: Vec<AuditFinding>) -> Arc<Self> {
        Arc::new(Self {
            findings,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_root(&self) -> Option<PathBuf> {
        self.seen_roots.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl AuditRunner for CountingRunner {
    async fn run_full_audit(&self, root: &Path) -> anyhow::Result<Vec<AuditFinding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_roots.lock().unwrap().push(root.to_path_buf());
        assert!(root.exists(), "sandbox must exist while the audit runs");
        Ok(self.findings.clone())
    }
}

pub struct ErroringRunner;

#[async_trait]
impl AuditRunner for ErroringRunner {
    async fn run_full_audit(&self, _root: &Path) -> anyhow::Result<Vec<AuditFinding>> {
        anyhow::bail!("rule engine failed to start")
    }
}

pub struct PanickingRunner;

#[async_trait]
impl AuditRunner for PanickingRunner {
    async fn run_full_audit(&self, _root: &Path) -> anyhow::Result<Vec<AuditFinding>> {
        panic!("rule engine panicked")
    }
}

pub fn error_finding() -> AuditFinding {
    AuditFinding {
        check_id: "governance.naming".into(),
        severity: Severity::Error,
        message: "module name violates convention".into(),
        file_path: Some(CHARTER.into()),
    }
}

pub fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn alice() -> SigningKey {
    key(11)
}

pub fn bob() -> SigningKey {
    key(22)
}

pub struct Fixture {
    pub repo: TempDir,
    pub config: AdmissionConfig,
}

impl Fixture {
    /// A small repository with a critical charter file, registered approvers
    /// alice and bob, production quorum (standard 1, critical 2).
    pub async fn new() -> Self {
        let repo = TempDir::new().unwrap();
        write(repo.path(), CHARTER, "version: 1\n");
        write(repo.path(), "src/lib.rs", "pub fn hello() {}\n");
        write(repo.path(), ".git/HEAD", "ref: refs/heads/main\n");

        let config = AdmissionConfig::for_repo(repo.path());
        let registry = RawRegistry {
            approvers: vec![approver("alice", &alice()), approver("bob", &bob())],
            quorum: RawQuorumSection {
                current_mode: QuorumMode::Production,
                development: Some(QuorumCounts {
                    standard: Some(1),
                    critical: Some(1),
                }),
                production: Some(QuorumCounts {
                    standard: Some(1),
                    critical: Some(2),
                }),
            },
            critical_paths: vec![CHARTER.into()],
        };
        std::fs::create_dir_all(&config.state_dir).unwrap();
        std::fs::write(&config.approvers, serde_yaml::to_string(&registry).unwrap()).unwrap();

        Self { repo, config }
    }

    pub fn root(&self) -> &Path {
        self.repo.path()
    }

    pub async fn orchestrator(&self, runner: Arc<dyn AuditRunner>) -> AdmissionOrchestrator {
        AdmissionOrchestrator::from_config(self.config.clone())
            .await
            .unwrap()
            .with_audit_runner(runner)
    }

    pub fn pending_file(&self, id: &str, yaml: &str) {
        write(&self.config.pending_dir, &format!("{id}.yaml"), yaml);
    }

    pub fn pending_crate(&self, id: &str, manifest: &str, files: &[(&str, &str)]) {
        let dir = self.config.pending_dir.join(id);
        write(&dir, "manifest.yaml", manifest);
        for (path, content) in files {
            write(&dir.join("payload"), path, content);
        }
    }

    pub fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(relative)).ok()
    }

    /// Every file outside the state directory, for byte-identity checks.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = BTreeMap::new();
        let mut stack = vec![self.root().to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let entry = entry.unwrap();
                let path = entry.path();
                if path.starts_with(&self.config.state_dir) {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.insert(path.clone(), std::fs::read(&path).unwrap());
                }
            }
        }
        files
    }

    pub fn sandbox_leftovers(&self) -> usize {
        std::fs::read_dir(&self.config.sandbox_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub fn rollback_records(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.config.rollback_dir)
            .map(|entries| entries.map(|e| e.unwrap().path()).collect())
            .unwrap_or_default()
    }
}

pub fn approver(identity: &str, key: &SigningKey) -> Approver {
    Approver {
        identity: identity.into(),
        public_key_pem: verifying_key_to_pem(&key.verifying_key()).unwrap(),
    }
}

pub fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

pub fn charter_proposal(content: &str) -> String {
    format!(
        "target_path: {CHARTER}\naction: edit\njustification: tighten charter\ncontent: {}\nsignatures: []\n",
        serde_json::to_string(content).unwrap()
    )
}
