//! Structured lifecycle events for the admission pipeline.
//!
//! One `tracing` event per step on target `admission.metrics`, so a log pipeline
//! can count transitions and outcomes without parsing free text.

use uuid::Uuid;

use crate::ledger::{SignatureStatus, VerificationReport};
use crate::quorum::QuorumDecision;
use crate::types::{AdmissionState, CanaryResult};

pub fn emit_verify(proposal_id: &str, report: &VerificationReport) {
    tracing::info!(
        target: "admission.metrics",
        event = "signatures_verified",
        proposal_id,
        valid = report.valid_count,
        stale = report.count(SignatureStatus::Stale),
        invalid = report.count(SignatureStatus::Invalid),
        unknown_identity = report.count(SignatureStatus::UnknownIdentity),
        duplicate = report.count(SignatureStatus::Duplicate),
    );
}

pub fn emit_quorum(proposal_id: &str, decision: &QuorumDecision) {
    tracing::info!(
        target: "admission.metrics",
        event = "quorum_evaluated",
        proposal_id,
        gate = decision.gate,
        mode = %decision.mode,
        required = decision.required,
        valid = decision.valid_count,
        met = decision.met,
    );
}

pub fn emit_canary(proposal_id: &str, trial_id: Uuid, result: &CanaryResult, duration_ms: u64) {
    tracing::info!(
        target: "admission.metrics",
        event = "canary_completed",
        proposal_id,
        trial_id = %trial_id,
        passed = result.passed,
        findings = result.findings.len(),
        duration_ms,
    );
}

pub fn emit_status_transition(proposal_id: &str, from: AdmissionState, to: AdmissionState) {
    tracing::info!(
        target: "admission.metrics",
        event = "status_transition",
        proposal_id,
        from = from.as_str(),
        to = to.as_str(),
    );
}

pub fn emit_apply(proposal_id: &str, files: usize, rollback_record: &str) {
    tracing::info!(
        target: "admission.metrics",
        event = "live_tree_applied",
        proposal_id,
        files,
        rollback_record,
    );
}

pub fn emit_rollback(proposal_id: &str, files: usize) {
    tracing::info!(
        target: "admission.metrics",
        event = "live_tree_rolled_back",
        proposal_id,
        files,
    );
}
