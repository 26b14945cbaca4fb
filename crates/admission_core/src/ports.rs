//! Port traits for the admission pipeline.
//! Implemented by the `admission-gate` adapters; core logic depends only on these traits.

use std::path::Path;

use async_trait::async_trait;

use crate::types::{AdmissionAuditEntry, AuditFinding, ProposalDocument, ResultRecord, Signature};
use crate::Result;

/// The pending-proposal queue and the processed archive.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    /// Ids of every pending proposal, sorted.
    async fn list_pending(&self) -> Result<Vec<String>>;

    /// Load a pending proposal. `NotFound` when absent.
    async fn load(&self, id: &str) -> Result<ProposalDocument>;

    /// Rewrite the signature list of a pending proposal, preserving every other key.
    async fn store_signatures(&self, id: &str, signatures: &[Signature]) -> Result<()>;

    /// Add a new pending proposal. `Conflict` if the id is already queued.
    async fn submit(&self, document: &ProposalDocument) -> Result<()>;

    /// Move a proposal out of the pending queue and persist its result record.
    /// Returns where the processed proposal now lives.
    async fn finalize(&self, id: &str, record: &ResultRecord) -> Result<String>;
}

/// The external governance audit, consumed as a single call.
#[async_trait]
pub trait AuditRunner: Send + Sync {
    async fn run_full_audit(&self, root: &Path) -> anyhow::Result<Vec<AuditFinding>>;
}

/// Append-only sink for admission audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AdmissionAuditEntry) -> Result<()>;
}
