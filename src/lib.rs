//! admission-gate: filesystem adapters and orchestration for change admission.
//!
//! Domain logic (tokens, signatures, quorum arithmetic, verdicts, structural
//! validation) lives in `admission_core`; this crate supplies the pieces that touch
//! disk and processes, and the [`orchestrator::AdmissionOrchestrator`] that drives a
//! proposal from the pending queue to a terminal state.

pub mod audit_log;
pub mod audit_runner;
pub mod config;
pub mod live_tree;
pub mod orchestrator;
pub mod sandbox;
pub mod store;

pub use config::AdmissionConfig;
pub use orchestrator::{
    AdmissionOrchestrator, AdmissionOutcome, PendingStatus, PendingSummary, ProposalDraft,
};
