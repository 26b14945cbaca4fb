use thiserror::Error;

use crate::codes;
use crate::types::AuditFinding;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("structural check failed: {} finding(s)", .0.len())]
    Structural(Vec<AuditFinding>),

    #[error("signature: {0}")]
    Signature(String),

    #[error("quorum not met for {path}: {valid} of {required} valid signature(s)")]
    QuorumNotMet {
        path: String,
        valid: usize,
        required: u32,
    },

    #[error("canary infrastructure: {0}")]
    CanaryInfrastructure(String),

    #[error("policy rejection: {0}")]
    PolicyRejection(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AdmissionError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Structured code recorded in audit-log failure entries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::Structural(_) => codes::S_MANIFEST_PARSE,
            Self::Signature(_) => codes::SIGNATURE_ERROR,
            Self::QuorumNotMet { .. } => codes::Q_NOT_MET,
            Self::CanaryInfrastructure(_) => codes::C_INFRA_FAILURE,
            Self::PolicyRejection(_) => codes::C_POLICY_REJECTION,
            Self::Conflict(_) => codes::APPLY_LOCK_CONTENTION,
            Self::InvalidInput(_) => codes::INVALID_INPUT,
            Self::Io { .. } => codes::IO_ERROR,
            Self::Internal(_) => codes::INTERNAL,
        }
    }
}
