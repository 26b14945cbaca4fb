//! Admission pipeline types: proposals, signatures, findings, records.
//! Pure value types with no filesystem access.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Enums ──────────────────────────────────────────────────────

/// Severity of an audit finding.
///
/// The external audit tends to emit upper-case names, so both spellings are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[serde(alias = "ERROR", alias = "Error")]
    Error,
    #[serde(alias = "WARNING", alias = "Warning", alias = "warn", alias = "WARN")]
    Warning,
    #[serde(alias = "INFO", alias = "Info")]
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warning" | "warn" => Some(Self::Warning),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proposal kind. Amendments are always held to the critical quorum tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalKind {
    #[default]
    Standard,
    ConstitutionalAmendment,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::ConstitutionalAmendment => "CONSTITUTIONAL_AMENDMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STANDARD" => Some(Self::Standard),
            "CONSTITUTIONAL_AMENDMENT" => Some(Self::ConstitutionalAmendment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalAction {
    Create,
    Edit,
    Replace,
}

impl ProposalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Replace => "replace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "edit" => Some(Self::Edit),
            "replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

/// Where a proposal came from.
///
/// `File` proposals are single-file YAML documents gated by signatures;
/// `Crate` proposals are multi-file bundles gated by the canary alone (by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalFlavor {
    File,
    Crate,
}

impl ProposalFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Crate => "crate",
        }
    }
}

// ── Proposal ───────────────────────────────────────────────────

/// One approver's signature over an approval token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub identity: String,
    /// Base64 (standard alphabet) of the raw 64-byte Ed25519 signature.
    /// Kept encoded so a corrupt entry only invalidates itself.
    pub signature_b64: String,
    /// The approval token that was signed.
    pub token: String,
    /// RFC 3339 UTC.
    #[serde(default)]
    pub timestamp: String,
}

impl Signature {
    pub fn signature_bytes(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.signature_b64.trim())
    }
}

/// An approver from the static registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approver {
    pub identity: String,
    pub public_key_pem: String,
}

/// A structurally valid proposal, unified across both flavors.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub id: String,
    pub flavor: ProposalFlavor,
    pub kind: ProposalKind,
    pub target_path: String,
    pub action: ProposalAction,
    pub justification: Option<String>,
    pub content: String,
    /// relative path → content; the exact set of files written on acceptance.
    pub payload_files: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub signatures: Vec<Signature>,
}

impl Proposal {
    /// Build a single-file proposal. `payload_files` is derived from target and content.
    pub fn single_file(
        id: impl Into<String>,
        target_path: impl Into<String>,
        action: ProposalAction,
        justification: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        let target_path = target_path.into();
        let content = content.into();
        let mut payload_files = BTreeMap::new();
        payload_files.insert(target_path.clone(), content.clone());
        Self {
            id: id.into(),
            flavor: ProposalFlavor::File,
            kind: ProposalKind::Standard,
            target_path,
            action,
            justification,
            content,
            payload_files,
            created_at: None,
            signatures: vec![],
        }
    }

    /// Replace the signable content of a single-file proposal, keeping the payload in step.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        if self.flavor == ProposalFlavor::File {
            self.payload_files.clear();
            self.payload_files
                .insert(self.target_path.clone(), self.content.clone());
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.payload_files.keys().map(String::as_str)
    }
}

/// Raw proposal as loaded from the pending store, before structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalDocument {
    pub id: String,
    pub flavor: ProposalFlavor,
    /// Proposal YAML (file flavor) or `manifest.yaml` (crate flavor).
    pub manifest: String,
    /// Crate payload files shipped alongside the manifest. Empty for file proposals.
    pub payload_files: BTreeMap<String, String>,
}

// ── Findings & canary results ──────────────────────────────────

/// A finding produced by the external audit (or synthesized by the pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub check_id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl AuditFinding {
    pub fn error(check_id: &str, message: impl Into<String>) -> Self {
        Self {
            check_id: check_id.to_string(),
            severity: Severity::Error,
            message: message.into(),
            file_path: None,
        }
    }

    pub fn at(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }
}

impl std::fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file_path {
            Some(path) => write!(
                f,
                "[{}] {}: {} ({})",
                self.check_id, self.severity, self.message, path
            ),
            None => write!(f, "[{}] {}: {}", self.check_id, self.severity, self.message),
        }
    }
}

/// Outcome of a canary trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryResult {
    pub passed: bool,
    pub metrics: BTreeMap<String, u64>,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub findings: Vec<AuditFinding>,
}

impl CanaryResult {
    /// Failing result carrying a single diagnostic finding.
    pub fn infra_failure(check_id: &str, message: impl Into<String>) -> Self {
        let finding = AuditFinding::error(check_id, message);
        let mut metrics = BTreeMap::new();
        metrics.insert("findings_total".to_string(), 1);
        metrics.insert(format!("severity.{}", Severity::Error.as_str()), 1);
        Self {
            passed: false,
            metrics,
            reasons: vec![finding.to_string()],
            findings: vec![finding],
        }
    }
}

// ── State machine ──────────────────────────────────────────────

/// Admission lifecycle state.
///
/// Transitions:
///   Pending → StructuralCheck → QuorumCheck → CanaryTrial → Accepted
///   StructuralCheck → Rejected
///   QuorumCheck → Pending (quorum not met; proposal stays queued)
///   CanaryTrial → Rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionState {
    Pending,
    StructuralCheck,
    QuorumCheck,
    CanaryTrial,
    Accepted,
    Rejected,
}

impl AdmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::StructuralCheck => "STRUCTURAL_CHECK",
            Self::QuorumCheck => "QUORUM_CHECK",
            Self::CanaryTrial => "CANARY_TRIAL",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }

    pub fn can_transition_to(&self, next: AdmissionState) -> bool {
        use AdmissionState::*;
        matches!(
            (self, next),
            (Pending, StructuralCheck)
                | (StructuralCheck, QuorumCheck)
                | (StructuralCheck, Rejected)
                | (QuorumCheck, CanaryTrial)
                | (QuorumCheck, Pending)
                | (CanaryTrial, Accepted)
                | (CanaryTrial, Rejected)
        )
    }
}

impl std::fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Accepted,
    Rejected,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

/// Quorum numbers as recorded for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumSummary {
    pub mode: String,
    pub required: u32,
    pub valid_count: usize,
}

/// Body of `result.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDetails {
    pub proposal_id: String,
    pub flavor: ProposalFlavor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_id: Option<Uuid>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub findings: Vec<AuditFinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<QuorumSummary>,
    #[serde(default)]
    pub canary_metrics: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_record: Option<String>,
}

/// `result.yaml` persisted next to a processed proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub status: ResultStatus,
    pub processed_at_utc: DateTime<Utc>,
    pub details: ResultDetails,
}

/// Prior state of one file touched by an accepted proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub path: String,
    /// `None` when the file did not exist before the change.
    pub prior_content: Option<String>,
}

/// Everything needed to reverse an accepted proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub proposal_id: String,
    pub trial_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub repo_root: String,
    pub files: Vec<RollbackEntry>,
}

// ── Audit log ──────────────────────────────────────────────────

/// Result of an audited admission verb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AuditResult {
    Success { detail: Option<String> },
    Failure { code: String, message: String },
}

/// One line of the admission audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionAuditEntry {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub verb: String,
    pub proposal_id: Option<String>,
    pub trial_id: Option<Uuid>,
    pub result: AuditResult,
    pub duration_ms: u64,
    pub metadata: Option<serde_json::Value>,
}

impl AdmissionAuditEntry {
    pub fn new(verb: &str, proposal_id: Option<&str>, result: AuditResult) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            verb: verb.to_string(),
            proposal_id: proposal_id.map(str::to_string),
            trial_id: None,
            result,
            duration_ms: 0,
            metadata: None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
