//! Admission orchestrator: the state machine over a pending proposal.
//!
//!   PENDING → STRUCTURAL_CHECK → QUORUM_CHECK → CANARY_TRIAL → ACCEPTED | REJECTED
//!
//! Structural and canary failures end in REJECTED with a `result.yaml`. An unmet
//! quorum returns the proposal to PENDING untouched and surfaces as
//! [`AdmissionError::QuorumNotMet`]. The live tree changes only on ACCEPTED, under
//! the repository's [`PublishLock`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ed25519_dalek::SigningKey;
use uuid::Uuid;

use admission_core::codes;
use admission_core::ledger::{SignatureCheck, SignatureStatus};
use admission_core::manifest::{render_file_proposal, StructuralRules};
use admission_core::metrics;
use admission_core::ports::{AuditRunner, AuditSink, ProposalStore};
use admission_core::registry::ApproversRegistry;
use admission_core::{
    AdmissionAuditEntry, AdmissionError, AdmissionState, AuditFinding, AuditResult,
    CanaryResult, CanaryVerdictEngine, PolicyOnlyGate, Proposal, ProposalAction, ProposalDocument,
    ProposalFlavor, ProposalKind, QuorumDecision, QuorumGate, Result,
    ResultDetails, ResultRecord, ResultStatus, RollbackRecord, Signature, SignatureLedger,
    SignatureQuorumGate,
};

use crate::audit_log::JsonlAuditLog;
use crate::audit_runner::CommandAuditRunner;
use crate::config::{AdmissionConfig, GateMode};
use crate::live_tree::{canonical_root, LiveTree, PublishLock, RollbackArchive};
use crate::sandbox::{CanarySandbox, SandboxSpec};
use crate::store::FsProposalStore;

/// Terminal outcome of an admission that reached ACCEPTED or REJECTED.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionOutcome {
    pub proposal_id: String,
    pub state: AdmissionState,
    pub record: ResultRecord,
    /// Where the processed proposal now lives.
    pub location: String,
}

impl AdmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        self.state == AdmissionState::Accepted
    }
}

/// What `list` reports for one pending proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingStatus {
    /// Structurally sound; quorum progress so far.
    Ready {
        flavor: ProposalFlavor,
        gate: &'static str,
        valid: usize,
        required: u32,
        met: bool,
        stale: usize,
        invalid: usize,
        unknown_identity: usize,
    },
    /// Would be rejected at STRUCTURAL_CHECK.
    Blocked { findings: Vec<AuditFinding> },
    /// Could not be read at all.
    Unreadable { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSummary {
    pub id: String,
    pub status: PendingStatus,
}

/// Input to `propose`.
#[derive(Debug, Clone)]
pub struct ProposalDraft {
    pub id: String,
    pub target_path: String,
    pub action: ProposalAction,
    pub justification: Option<String>,
    pub content: String,
    pub kind: ProposalKind,
}

/// Tracks the admission state and refuses illegal transitions.
struct Lifecycle<'a> {
    proposal_id: &'a str,
    state: AdmissionState,
}

impl<'a> Lifecycle<'a> {
    fn new(proposal_id: &'a str) -> Self {
        Self {
            proposal_id,
            state: AdmissionState::Pending,
        }
    }

    fn advance(&mut self, next: AdmissionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AdmissionError::Internal(anyhow::anyhow!(
                "illegal admission transition {} → {} for '{}'",
                self.state,
                next,
                self.proposal_id
            )));
        }
        tracing::debug!(
            target: "admission.orchestrator",
            proposal_id = self.proposal_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "state transition"
        );
        metrics::emit_status_transition(self.proposal_id, self.state, next);
        self.state = next;
        Ok(())
    }
}

pub struct AdmissionOrchestrator {
    config: AdmissionConfig,
    registry: ApproversRegistry,
    rules: StructuralRules,
    store: Arc<dyn ProposalStore>,
    file_gate: Arc<dyn QuorumGate>,
    crate_gate: Arc<dyn QuorumGate>,
    audit_runner: Arc<dyn AuditRunner>,
    verdict: CanaryVerdictEngine,
    audit_log: Arc<dyn AuditSink>,
    archive: RollbackArchive,
}

fn gate_for(mode: GateMode, registry: &ApproversRegistry) -> Arc<dyn QuorumGate> {
    match mode {
        GateMode::Signatures => Arc::new(SignatureQuorumGate::new(
            registry.approvers.clone(),
            registry.policy.clone(),
        )),
        GateMode::PolicyOnly => Arc::new(PolicyOnlyGate),
    }
}

impl AdmissionOrchestrator {
    /// Wire the filesystem adapters described by `config`.
    pub async fn from_config(config: AdmissionConfig) -> Result<Self> {
        let registry = load_registry(&config.approvers).await?;
        let store = Arc::new(FsProposalStore::new(
            config.pending_dir.clone(),
            config.processed_dir.clone(),
        ));
        let runner = Arc::new(CommandAuditRunner::new(config.audit_command.clone()));
        let audit_log = Arc::new(JsonlAuditLog::new(config.audit_log.clone()));
        Ok(Self::new(config, registry, store, runner, audit_log))
    }

    pub fn new(
        config: AdmissionConfig,
        registry: ApproversRegistry,
        store: Arc<dyn ProposalStore>,
        audit_runner: Arc<dyn AuditRunner>,
        audit_log: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            rules: config.structural_rules(),
            file_gate: gate_for(config.gating.proposals, &registry),
            crate_gate: gate_for(config.gating.crates, &registry),
            verdict: CanaryVerdictEngine::new(config.canary.thresholds()),
            archive: RollbackArchive::new(config.rollback_dir.clone()),
            config,
            registry,
            store,
            audit_runner,
            audit_log,
        }
    }

    /// Swap the audit collaborator.
    pub fn with_audit_runner(mut self, runner: Arc<dyn AuditRunner>) -> Self {
        self.audit_runner = runner;
        self
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ApproversRegistry {
        &self.registry
    }

    fn gate(&self, flavor: ProposalFlavor) -> &Arc<dyn QuorumGate> {
        match flavor {
            ProposalFlavor::File => &self.file_gate,
            ProposalFlavor::Crate => &self.crate_gate,
        }
    }

    fn sandbox_spec(&self) -> SandboxSpec {
        SandboxSpec {
            repo_root: self.config.repo_root.clone(),
            scratch_dir: self.config.sandbox_dir.clone(),
            excludes: self.config.sandbox_excludes.clone(),
            skip_paths: vec![self.config.state_dir.clone()],
            copy_timeout: self.config.canary.copy_timeout(),
        }
    }

    // ── approve ────────────────────────────────────────────────

    /// Run one pending proposal through the full admission pipeline.
    pub async fn approve(&self, id: &str) -> Result<AdmissionOutcome> {
        let started = Instant::now();
        let outcome = self.admit(id).await;

        let (result, trial_id) = match &outcome {
            Ok(o) => (
                AuditResult::Success {
                    detail: Some(o.record.status.as_str().to_string()),
                },
                o.record.details.trial_id,
            ),
            Err(e) => (
                AuditResult::Failure {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
                None,
            ),
        };
        let mut entry = AdmissionAuditEntry::new("approve", Some(id), result);
        entry.trial_id = trial_id;
        entry.duration_ms = started.elapsed().as_millis() as u64;
        if let Ok(o) = &outcome {
            entry.metadata = Some(serde_json::json!({
                "location": o.location,
                "reasons": o.record.details.reasons,
                "rollback_record": o.record.details.rollback_record,
            }));
        }
        self.record_audit(&entry).await;
        outcome
    }

    async fn admit(&self, id: &str) -> Result<AdmissionOutcome> {
        let document = self.store.load(id).await?;
        let mut lifecycle = Lifecycle::new(id);

        // STRUCTURAL_CHECK
        lifecycle.advance(AdmissionState::StructuralCheck)?;
        let proposal = match self.rules.validate(&document) {
            Ok(p) => p,
            Err(findings) => {
                tracing::warn!(
                    target: "admission.orchestrator",
                    proposal_id = id,
                    findings = findings.len(),
                    "structural check failed"
                );
                lifecycle.advance(AdmissionState::Rejected)?;
                let details = ResultDetails {
                    proposal_id: id.to_string(),
                    flavor: document.flavor,
                    trial_id: None,
                    reasons: findings.iter().map(ToString::to_string).collect(),
                    findings,
                    quorum: None,
                    canary_metrics: BTreeMap::new(),
                    rollback_record: None,
                };
                return self.finish(id, lifecycle.state, details).await;
            }
        };

        // QUORUM_CHECK
        lifecycle.advance(AdmissionState::QuorumCheck)?;
        let decision = self.gate(proposal.flavor).evaluate(&proposal);
        log_signature_problems(id, &decision);
        if !decision.met {
            lifecycle.advance(AdmissionState::Pending)?;
            tracing::warn!(
                target: "admission.quorum",
                proposal_id = id,
                valid = decision.valid_count,
                required = decision.required,
                path = %decision.governing_path,
                "quorum not met; proposal stays pending"
            );
            return Err(AdmissionError::QuorumNotMet {
                path: decision.governing_path,
                valid: decision.valid_count,
                required: decision.required,
            });
        }

        // CANARY_TRIAL: the lock is held from here through the terminal transition.
        lifecycle.advance(AdmissionState::CanaryTrial)?;
        let _lock = PublishLock::acquire(&self.config.state_dir, &self.config.repo_root, id)?;
        let trial_id = Uuid::new_v4();
        let canary = self.run_canary(&proposal, trial_id).await;

        let mut details = ResultDetails {
            proposal_id: id.to_string(),
            flavor: proposal.flavor,
            trial_id: Some(trial_id),
            reasons: canary.reasons.clone(),
            findings: canary.findings.clone(),
            quorum: Some(decision.summary()),
            canary_metrics: canary.metrics.clone(),
            rollback_record: None,
        };

        if !canary.passed {
            tracing::warn!(
                target: "admission.orchestrator",
                proposal_id = id,
                trial_id = %trial_id,
                reasons = ?canary.reasons,
                "canary rejected proposal"
            );
            lifecycle.advance(AdmissionState::Rejected)?;
            return self.finish(id, lifecycle.state, details).await;
        }

        match self.apply(&proposal, trial_id).await {
            Ok((record, record_path)) => {
                lifecycle.advance(AdmissionState::Accepted)?;
                details.rollback_record = Some(record_path.display().to_string());
                metrics::emit_apply(
                    id,
                    proposal.payload_files.len(),
                    &record_path.display().to_string(),
                );
                // The proposal must not stay pending over a mutated tree.
                return match self.finish(id, lifecycle.state, details).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        self.undo_apply(id, &record, &record_path, &e).await;
                        Err(e)
                    }
                };
            }
            Err(e) => {
                tracing::error!(
                    target: "admission.orchestrator",
                    proposal_id = id,
                    trial_id = %trial_id,
                    error = %e,
                    "apply failed; live tree reverted"
                );
                lifecycle.advance(AdmissionState::Rejected)?;
                let finding = AuditFinding::error(
                    codes::APPLY_WRITE_FAILED,
                    format!("applying payload failed: {e}"),
                );
                details.reasons.push(finding.to_string());
                details.findings.push(finding);
            }
        }
        self.finish(id, lifecycle.state, details).await
    }

    /// Sandbox → audit → teardown. Never fails: infrastructure problems become
    /// failing results.
    async fn run_canary(&self, proposal: &Proposal, trial_id: Uuid) -> CanaryResult {
        let started = Instant::now();
        let result = match CanarySandbox::create(&self.sandbox_spec(), &proposal.payload_files, trial_id).await {
            Ok(sandbox) => {
                let result = self
                    .verdict
                    .evaluate(sandbox.path(), self.audit_runner.clone())
                    .await;
                if let Err(e) = sandbox.teardown() {
                    tracing::error!(
                        target: "admission.sandbox",
                        proposal_id = %proposal.id,
                        trial_id = %trial_id,
                        error = %e,
                        "sandbox teardown failed"
                    );
                }
                result
            }
            Err(e) => {
                tracing::error!(
                    target: "admission.sandbox",
                    proposal_id = %proposal.id,
                    trial_id = %trial_id,
                    error = %e,
                    "sandbox creation failed"
                );
                CanaryResult::infra_failure(
                    codes::INFRA_SANDBOX_FAILED,
                    format!("sandbox creation failed: {e}"),
                )
            }
        };
        metrics::emit_canary(
            &proposal.id,
            trial_id,
            &result,
            started.elapsed().as_millis() as u64,
        );
        result
    }

    /// Archive a rollback record and write the payload. On failure the tree is
    /// reverted and the record withdrawn.
    async fn apply(
        &self,
        proposal: &Proposal,
        trial_id: Uuid,
    ) -> Result<(RollbackRecord, PathBuf)> {
        let tree = LiveTree::new(&self.config.repo_root);
        let record = tree
            .capture(&proposal.id, trial_id, &proposal.payload_files)
            .await?;
        let record_path = self.archive.store(&record).await?;
        if let Err(e) = tree.apply(&proposal.payload_files, &record).await {
            if let Err(withdraw_err) = self.archive.withdraw(&record_path).await {
                tracing::error!(
                    target: "admission.live_tree",
                    record = %record_path.display(),
                    error = %withdraw_err,
                    "failed to withdraw rollback record"
                );
            }
            return Err(e);
        }
        Ok((record, record_path))
    }

    /// Put the live tree back after an applied proposal could not be finalized.
    async fn undo_apply(
        &self,
        id: &str,
        record: &RollbackRecord,
        record_path: &Path,
        cause: &AdmissionError,
    ) {
        tracing::error!(
            target: "admission.orchestrator",
            proposal_id = id,
            error = %cause,
            "finalize failed after apply; restoring live tree"
        );
        let tree = LiveTree::new(&self.config.repo_root);
        match tree.restore(record).await {
            Ok(files) => {
                metrics::emit_rollback(id, files);
                if let Err(e) = self.archive.withdraw(record_path).await {
                    tracing::error!(
                        target: "admission.live_tree",
                        record = %record_path.display(),
                        error = %e,
                        "failed to withdraw rollback record"
                    );
                }
            }
            Err(e) => tracing::error!(
                target: "admission.live_tree",
                proposal_id = id,
                record = %record_path.display(),
                error = %e,
                "restore after failed finalize did not complete; rollback record kept"
            ),
        }
    }

    async fn finish(
        &self,
        id: &str,
        state: AdmissionState,
        details: ResultDetails,
    ) -> Result<AdmissionOutcome> {
        let status = match state {
            AdmissionState::Accepted => ResultStatus::Accepted,
            _ => ResultStatus::Rejected,
        };
        let record = ResultRecord {
            status,
            processed_at_utc: Utc::now(),
            details,
        };
        let location = self.store.finalize(id, &record).await?;
        tracing::info!(
            target: "admission.orchestrator",
            proposal_id = id,
            status = status.as_str(),
            "admission complete"
        );
        Ok(AdmissionOutcome {
            proposal_id: id.to_string(),
            state,
            record,
            location,
        })
    }

    // ── sign ───────────────────────────────────────────────────

    /// Sign the current state of a pending proposal as `identity`.
    pub async fn sign(&self, id: &str, key: &SigningKey, identity: &str) -> Result<Signature> {
        let started = Instant::now();
        let outcome = self.sign_inner(id, key, identity).await;
        let result = match &outcome {
            Ok(sig) => AuditResult::Success {
                detail: Some(format!("signed by {identity} over {}", sig.token)),
            },
            Err(e) => AuditResult::Failure {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        };
        let mut entry = AdmissionAuditEntry::new("sign", Some(id), result);
        entry.duration_ms = started.elapsed().as_millis() as u64;
        entry.metadata = Some(serde_json::json!({ "identity": identity }));
        self.record_audit(&entry).await;
        outcome
    }

    async fn sign_inner(&self, id: &str, key: &SigningKey, identity: &str) -> Result<Signature> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(AdmissionError::InvalidInput("identity must not be empty".into()));
        }
        let document = self.store.load(id).await?;
        let mut proposal = self
            .rules
            .validate(&document)
            .map_err(AdmissionError::Structural)?;

        match self.registry.find(identity) {
            None => tracing::warn!(
                target: "admission.ledger",
                proposal_id = id,
                identity,
                "signing identity is not in the approvers registry; signature will not count"
            ),
            Some(approver) => {
                let registered = admission_core::ledger::parse_public_key(&approver.public_key_pem);
                if registered.map_or(true, |k| k != key.verifying_key()) {
                    tracing::warn!(
                        target: "admission.ledger",
                        proposal_id = id,
                        identity,
                        "signing key does not match the registered public key"
                    );
                }
            }
        }

        let signature = SignatureLedger::sign(&mut proposal, key, identity);
        self.store.store_signatures(id, &proposal.signatures).await?;
        Ok(signature)
    }

    // ── list ───────────────────────────────────────────────────

    pub async fn list(&self) -> Result<Vec<PendingSummary>> {
        let ids = self.store.list_pending().await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let status = match self.store.load(&id).await {
                Err(e) => PendingStatus::Unreadable {
                    error: e.to_string(),
                },
                Ok(document) => match self.rules.validate(&document) {
                    Err(findings) => PendingStatus::Blocked { findings },
                    Ok(proposal) => {
                        let decision = self.gate(proposal.flavor).evaluate(&proposal);
                        let count = |status| {
                            decision
                                .verification
                                .as_ref()
                                .map_or(0, |r| r.count(status))
                        };
                        PendingStatus::Ready {
                            flavor: proposal.flavor,
                            gate: decision.gate,
                            valid: decision.valid_count,
                            required: decision.required,
                            met: decision.met,
                            stale: count(SignatureStatus::Stale),
                            invalid: count(SignatureStatus::Invalid),
                            unknown_identity: count(SignatureStatus::UnknownIdentity),
                        }
                    }
                },
            };
            summaries.push(PendingSummary { id, status });
        }
        Ok(summaries)
    }

    // ── propose ────────────────────────────────────────────────

    /// Queue a new single-file proposal. Refuses to overwrite an existing id.
    pub async fn propose(&self, draft: ProposalDraft) -> Result<Proposal> {
        let started = Instant::now();
        let id = draft.id.clone();
        let outcome = self.propose_inner(draft).await;
        let result = match &outcome {
            Ok(p) => AuditResult::Success {
                detail: Some(format!("{} {}", p.action.as_str(), p.target_path)),
            },
            Err(e) => AuditResult::Failure {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        };
        let mut entry = AdmissionAuditEntry::new("propose", Some(&id), result);
        entry.duration_ms = started.elapsed().as_millis() as u64;
        self.record_audit(&entry).await;
        outcome
    }

    async fn propose_inner(&self, draft: ProposalDraft) -> Result<Proposal> {
        let mut proposal = Proposal::single_file(
            draft.id,
            draft.target_path,
            draft.action,
            draft.justification,
            draft.content,
        );
        proposal.kind = draft.kind;
        proposal.created_at = Some(Utc::now());

        let document: ProposalDocument = render_file_proposal(&proposal)?;
        // Same checks approval will apply, so a malformed proposal is never queued.
        self.rules
            .validate(&document)
            .map_err(AdmissionError::Structural)?;
        self.store.submit(&document).await?;
        tracing::info!(
            target: "admission.orchestrator",
            proposal_id = %proposal.id,
            target_path = %proposal.target_path,
            "proposal queued"
        );
        Ok(proposal)
    }

    // ── rollback ───────────────────────────────────────────────

    /// Restore the live tree from an archived rollback record.
    pub async fn rollback(&self, record_path: &Path) -> Result<usize> {
        let started = Instant::now();
        let outcome = self.rollback_inner(record_path).await;
        let (proposal_id, trial_id, result) = match &outcome {
            Ok((record, files)) => (
                Some(record.proposal_id.clone()),
                Some(record.trial_id),
                AuditResult::Success {
                    detail: Some(format!("restored {files} file(s)")),
                },
            ),
            Err(e) => (
                None,
                None,
                AuditResult::Failure {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
            ),
        };
        let mut entry = AdmissionAuditEntry::new("rollback", proposal_id.as_deref(), result);
        entry.trial_id = trial_id;
        entry.duration_ms = started.elapsed().as_millis() as u64;
        entry.metadata = Some(serde_json::json!({ "record": record_path.display().to_string() }));
        self.record_audit(&entry).await;
        outcome.map(|(_, files)| files)
    }

    async fn rollback_inner(&self, record_path: &Path) -> Result<(RollbackRecord, usize)> {
        let record = RollbackArchive::load(record_path).await?;
        let tree = LiveTree::new(&self.config.repo_root);
        if Path::new(&record.repo_root) != canonical_root(&self.config.repo_root) {
            return Err(AdmissionError::InvalidInput(format!(
                "rollback record targets {} but this repository is {}",
                record.repo_root,
                tree.root().display()
            )));
        }
        let _lock = PublishLock::acquire(
            &self.config.state_dir,
            &self.config.repo_root,
            &format!("rollback:{}", record.proposal_id),
        )?;
        let files = tree.restore(&record).await?;
        metrics::emit_rollback(&record.proposal_id, files);
        tracing::info!(
            target: "admission.live_tree",
            proposal_id = %record.proposal_id,
            trial_id = %record.trial_id,
            files,
            "rollback restored live tree"
        );
        Ok((record, files))
    }

    async fn record_audit(&self, entry: &AdmissionAuditEntry) {
        // Audit log failures never change the verdict.
        if let Err(e) = self.audit_log.append(entry).await {
            tracing::error!(
                target: "admission.orchestrator",
                verb = %entry.verb,
                error = %e,
                "failed to append audit log entry"
            );
        }
    }
}

fn log_signature_problems(proposal_id: &str, decision: &QuorumDecision) {
    let Some(report) = &decision.verification else {
        return;
    };
    for SignatureCheck { identity, status } in &report.checks {
        if *status != SignatureStatus::Valid {
            tracing::warn!(
                target: "admission.ledger",
                proposal_id,
                identity = %identity,
                status = status.as_str(),
                "signature excluded from quorum"
            );
        }
    }
}

/// Load the approvers registry. A missing file means no approvers.
pub async fn load_registry(path: &Path) -> Result<ApproversRegistry> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => ApproversRegistry::load_from_str(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                target: "admission.orchestrator",
                path = %path.display(),
                "approvers registry not found; no signatures can count"
            );
            ApproversRegistry::load_from_str("{}")
        }
        Err(e) => Err(AdmissionError::io(path, e)),
    }
}
