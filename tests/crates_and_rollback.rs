//! Crate bundles, canary configuration and rollback.

mod helpers;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use admission_core::codes;
use admission_core::ports::AuditRunner;
use admission_core::{AdmissionError, AdmissionState, AuditFinding, ProposalFlavor, Severity};
use admission_gate::live_tree::RollbackArchive;
use admission_gate::PendingStatus;

use helpers::*;

const CRATE_MANIFEST: &str = "\
crate_id: refactor-lib
type: STANDARD
justification: split helpers out of lib.rs
payload_files:
  - src/lib.rs
  - src/helpers.rs
";

/// Records what the audit saw in the sandbox.
#[derive(Default)]
struct PeekingRunner {
    seen: Mutex<Vec<(Option<String>, bool)>>,
}

#[async_trait]
impl AuditRunner for PeekingRunner {
    async fn run_full_audit(&self, root: &Path) -> anyhow::Result<Vec<AuditFinding>> {
        let lib = std::fs::read_to_string(root.join("src/lib.rs")).ok();
        let has_git = root.join(".git").exists();
        self.seen.lock().unwrap().push((lib, has_git));
        Ok(vec![AuditFinding {
            check_id: "style.todo".into(),
            severity: Severity::Warning,
            message: "TODO left in code".into(),
            file_path: Some("src/helpers.rs".into()),
        }])
    }
}

struct SlowRunner;

#[async_trait]
impl AuditRunner for SlowRunner {
    async fn run_full_audit(&self, _root: &Path) -> anyhow::Result<Vec<AuditFinding>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(vec![])
    }
}

fn queue_refactor(fixture: &Fixture) {
    fixture.pending_crate(
        "refactor-lib",
        CRATE_MANIFEST,
        &[
            ("src/lib.rs", "mod helpers;\npub use helpers::hello;\n"),
            ("src/helpers.rs", "pub fn hello() {}\n"),
        ],
    );
}

#[tokio::test]
async fn test_crate_is_admitted_on_canary_alone() {
    let fixture = Fixture::new().await;
    queue_refactor(&fixture);

    let runner = std::sync::Arc::new(PeekingRunner::default());
    let orchestrator = fixture.orchestrator(runner.clone()).await;

    match &orchestrator.list().await.unwrap()[0].status {
        PendingStatus::Ready {
            flavor, gate, met, ..
        } => {
            assert_eq!(*flavor, ProposalFlavor::Crate);
            assert_eq!(*gate, "policy_only");
            assert!(*met);
        }
        other => panic!("unexpected status {other:?}"),
    }

    let outcome = orchestrator.approve("refactor-lib").await.unwrap();
    assert!(outcome.is_accepted(), "warnings are tolerated by default");
    assert_eq!(outcome.record.details.canary_metrics["severity.warning"], 1);
    assert_eq!(outcome.record.details.canary_metrics["severity.error"], 0);

    // The audit saw the overlay and no VCS metadata.
    let seen = runner.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(Some("mod helpers;\npub use helpers::hello;\n".to_string()), false)]
    );

    assert_eq!(
        fixture.read("src/helpers.rs").as_deref(),
        Some("pub fn hello() {}\n")
    );
    assert!(!fixture.config.pending_dir.join("refactor-lib").exists());
    assert!(Path::new(&outcome.location).join("manifest.yaml").exists());
    assert!(Path::new(&outcome.location).join("result.yaml").exists());
}

#[tokio::test]
async fn test_crate_missing_declared_file_is_rejected() {
    let fixture = Fixture::new().await;
    fixture.pending_crate(
        "refactor-lib",
        CRATE_MANIFEST,
        &[("src/lib.rs", "mod helpers;\n")],
    );
    let runner = CountingRunner::clean();

    let outcome = fixture
        .orchestrator(runner.clone())
        .await
        .approve("refactor-lib")
        .await
        .unwrap();

    assert_eq!(outcome.state, AdmissionState::Rejected);
    assert!(outcome
        .record
        .details
        .findings
        .iter()
        .any(|f| f.check_id == codes::S_PAYLOAD_MISSING_FILE));
    assert_eq!(runner.calls(), 0);
    assert_eq!(fixture.read("src/lib.rs").as_deref(), Some("pub fn hello() {}\n"));
}

#[tokio::test]
async fn test_crate_writing_into_git_dir_is_rejected() {
    let fixture = Fixture::new().await;
    fixture.pending_crate(
        "sneaky",
        "crate_id: sneaky\ntype: STANDARD\npayload_files:\n  - .git/hooks/pre-commit\n",
        &[(".git/hooks/pre-commit", "#!/bin/sh\n")],
    );

    let outcome = fixture
        .orchestrator(CountingRunner::clean())
        .await
        .approve("sneaky")
        .await
        .unwrap();

    assert_eq!(outcome.state, AdmissionState::Rejected);
    assert_eq!(outcome.record.details.findings[0].check_id, codes::S_PATH_PROTECTED);
    assert!(!fixture.root().join(".git/hooks/pre-commit").exists());
}

#[tokio::test]
async fn test_disabled_canary_skips_the_audit() {
    let mut fixture = Fixture::new().await;
    fixture.config.canary.enabled = false;
    queue_refactor(&fixture);
    let runner = CountingRunner::with_findings(vec![error_finding()]);

    let outcome = fixture
        .orchestrator(runner.clone())
        .await
        .approve("refactor-lib")
        .await
        .unwrap();

    assert!(outcome.is_accepted());
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn test_audit_timeout_rejects() {
    let mut fixture = Fixture::new().await;
    fixture.config.canary.audit_timeout_secs = 1;
    queue_refactor(&fixture);

    let outcome = fixture
        .orchestrator(std::sync::Arc::new(SlowRunner))
        .await
        .approve("refactor-lib")
        .await
        .unwrap();

    assert_eq!(outcome.state, AdmissionState::Rejected);
    assert_eq!(
        outcome.record.details.findings[0].check_id,
        codes::INFRA_CANARY_TIMEOUT
    );
    assert_eq!(fixture.read("src/lib.rs").as_deref(), Some("pub fn hello() {}\n"));
    assert_eq!(fixture.sandbox_leftovers(), 0);
}

#[tokio::test]
async fn test_signature_gated_crates() {
    let mut fixture = Fixture::new().await;
    fixture.config.gating.crates = admission_gate::config::GateMode::Signatures;
    queue_refactor(&fixture);
    let orchestrator = fixture.orchestrator(CountingRunner::clean()).await;

    assert!(matches!(
        orchestrator.approve("refactor-lib").await,
        Err(AdmissionError::QuorumNotMet { valid: 0, required: 1, .. })
    ));
    orchestrator.sign("refactor-lib", &alice(), "alice").await.unwrap();
    assert!(orchestrator.approve("refactor-lib").await.unwrap().is_accepted());
}

#[tokio::test]
async fn test_rollback_restores_prior_tree() {
    let fixture = Fixture::new().await;
    let before = fixture.snapshot();
    queue_refactor(&fixture);
    let orchestrator = fixture.orchestrator(CountingRunner::clean()).await;

    let outcome = orchestrator.approve("refactor-lib").await.unwrap();
    assert!(outcome.is_accepted());
    assert_ne!(fixture.snapshot(), before);

    let record_path = outcome.record.details.rollback_record.clone().unwrap();
    let record = RollbackArchive::load(Path::new(&record_path)).await.unwrap();
    assert_eq!(record.proposal_id, "refactor-lib");
    assert_eq!(Some(record.trial_id), outcome.record.details.trial_id);
    let created: Vec<_> = record
        .files
        .iter()
        .filter(|f| f.prior_content.is_none())
        .map(|f| f.path.as_str())
        .collect();
    assert_eq!(created, vec!["src/helpers.rs"]);

    let restored = orchestrator.rollback(Path::new(&record_path)).await.unwrap();
    assert_eq!(restored, 2);
    assert_eq!(fixture.snapshot(), before);
}

#[tokio::test]
async fn test_rollback_refuses_record_for_another_repository() {
    let first = Fixture::new().await;
    queue_refactor(&first);
    let outcome = first
        .orchestrator(CountingRunner::clean())
        .await
        .approve("refactor-lib")
        .await
        .unwrap();
    let record_path = outcome.record.details.rollback_record.unwrap();

    let second = Fixture::new().await;
    let before = second.snapshot();
    let err = second
        .orchestrator(CountingRunner::clean())
        .await
        .rollback(Path::new(&record_path))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::InvalidInput(_)));
    assert_eq!(second.snapshot(), before);
}
