//! Quorum policy: how many valid signatures a path needs, and the pluggable gate
//! that the orchestrator consults during QUORUM_CHECK.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ledger::{SignatureLedger, VerificationReport};
use crate::manifest::normalize_relative;
use crate::types::{Approver, Proposal, ProposalKind, QuorumSummary};

/// Requirement used when the policy has no entry for the mode/tier.
pub const DEFAULT_REQUIRED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumMode {
    #[default]
    Development,
    Production,
}

impl QuorumMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

impl std::fmt::Display for QuorumMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-mode requirement. Absent tiers fall back to [`DEFAULT_REQUIRED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuorumCounts {
    #[serde(default)]
    pub standard: Option<u32>,
    #[serde(default)]
    pub critical: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuorumPolicy {
    #[serde(default)]
    pub current_mode: QuorumMode,
    /// Suffixes, or glob patterns when they contain `*`, `?` or `[`.
    #[serde(default)]
    pub critical_paths: Vec<String>,
    #[serde(default)]
    pub quorum: BTreeMap<QuorumMode, QuorumCounts>,
}

/// Pure quorum arithmetic over a [`QuorumPolicy`].
pub struct QuorumPolicyEvaluator;

impl QuorumPolicyEvaluator {
    pub fn is_critical(path: &str, policy: &QuorumPolicy) -> bool {
        let path = normalize(path);
        policy.critical_paths.iter().any(|entry| {
            let entry = normalize(entry);
            if is_glob(&entry) {
                match glob::Pattern::new(&entry) {
                    Ok(pattern) => pattern.matches(&path),
                    Err(_) => path.ends_with(&entry),
                }
            } else {
                path.ends_with(&entry)
            }
        })
    }

    pub fn required(path: &str, policy: &QuorumPolicy) -> u32 {
        Self::required_for_tier(Self::is_critical(path, policy), policy)
    }

    pub fn required_for_tier(critical: bool, policy: &QuorumPolicy) -> u32 {
        let counts = policy.quorum.get(&policy.current_mode);
        let configured = counts.and_then(|c| if critical { c.critical } else { c.standard });
        configured.unwrap_or(DEFAULT_REQUIRED)
    }

    pub fn met(valid_count: usize, path: &str, policy: &QuorumPolicy) -> bool {
        valid_count >= Self::required(path, policy) as usize
    }

    /// Strictest requirement across every path a proposal touches.
    ///
    /// Returns `(required, governing_path)`. Constitutional amendments are held to
    /// the critical tier regardless of path.
    pub fn required_for_proposal(proposal: &Proposal, policy: &QuorumPolicy) -> (u32, String) {
        let mut best = (0u32, proposal.target_path.clone());
        for path in proposal.paths() {
            let required = Self::required(path, policy);
            if required > best.0 {
                best = (required, path.to_string());
            }
        }
        if proposal.kind == ProposalKind::ConstitutionalAmendment {
            let critical = Self::required_for_tier(true, policy);
            if critical > best.0 {
                best.0 = critical;
            }
        }
        if best.0 == 0 {
            best.0 = Self::required(&proposal.target_path, policy);
        }
        best
    }
}

/// Same lexical form the structural check and the live-tree writer use, so
/// `a/./b` and `a//b` cannot dodge a critical entry.
fn normalize(path: &str) -> String {
    normalize_relative(path).unwrap_or_else(|_| path.trim().to_string())
}

fn is_glob(entry: &str) -> bool {
    entry.contains(['*', '?', '['])
}

// ── Gates ──────────────────────────────────────────────────────

/// Outcome of QUORUM_CHECK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumDecision {
    pub gate: &'static str,
    pub mode: String,
    pub required: u32,
    pub valid_count: usize,
    pub met: bool,
    pub governing_path: String,
    pub verification: Option<VerificationReport>,
}

impl QuorumDecision {
    pub fn summary(&self) -> QuorumSummary {
        QuorumSummary {
            mode: self.mode.clone(),
            required: self.required,
            valid_count: self.valid_count,
        }
    }
}

/// QUORUM_CHECK strategy. The orchestrator holds one per proposal flavor.
pub trait QuorumGate: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, proposal: &Proposal) -> QuorumDecision;
}

/// Signature-quorum gate: ledger verification + policy arithmetic.
pub struct SignatureQuorumGate {
    approvers: Vec<Approver>,
    policy: QuorumPolicy,
}

impl SignatureQuorumGate {
    pub fn new(approvers: Vec<Approver>, policy: QuorumPolicy) -> Self {
        Self { approvers, policy }
    }

    pub fn approvers(&self) -> &[Approver] {
        &self.approvers
    }

    pub fn policy(&self) -> &QuorumPolicy {
        &self.policy
    }
}

impl QuorumGate for SignatureQuorumGate {
    fn name(&self) -> &'static str {
        "signatures"
    }

    fn evaluate(&self, proposal: &Proposal) -> QuorumDecision {
        let report = SignatureLedger::verify(proposal, &self.approvers);
        let (required, governing_path) =
            QuorumPolicyEvaluator::required_for_proposal(proposal, &self.policy);
        let decision = QuorumDecision {
            gate: self.name(),
            mode: self.policy.current_mode.to_string(),
            required,
            valid_count: report.valid_count,
            met: report.valid_count >= required as usize,
            governing_path,
            verification: Some(report),
        };
        crate::metrics::emit_quorum(&proposal.id, &decision);
        decision
    }
}

/// Policy-only gate: admission rests on the canary alone.
pub struct PolicyOnlyGate;

impl QuorumGate for PolicyOnlyGate {
    fn name(&self) -> &'static str {
        "policy_only"
    }

    fn evaluate(&self, proposal: &Proposal) -> QuorumDecision {
        let decision = QuorumDecision {
            gate: self.name(),
            mode: "policy_only".to_string(),
            required: 0,
            valid_count: 0,
            met: true,
            governing_path: proposal.target_path.clone(),
            verification: None,
        };
        crate::metrics::emit_quorum(&proposal.id, &decision);
        decision
    }
}
