//! Change admission core: pure domain types, port traits, gate logic.
//!
//! Nothing in this crate touches the live filesystem. Storage, sandboxing and the
//! live-tree write path are adapters implemented by the `admission-gate` package
//! against the traits in [`ports`].
//!
//! | Module      | Responsibility                                             |
//! |-------------|------------------------------------------------------------|
//! | `token`     | Canonical approval token over the four signable fields     |
//! | `ledger`    | Ed25519 sign / verify of per-identity signatures           |
//! | `quorum`    | Required-signature arithmetic and the pluggable gate       |
//! | `verdict`   | Canary audit execution, metrics and threshold enforcement  |
//! | `manifest`  | Structural validation of proposal files and crate manifests|
//! | `registry`  | Approvers registry (keys + quorum policy)                  |

pub mod codes;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod metrics;
pub mod ports;
pub mod quorum;
pub mod registry;
pub mod token;
pub mod types;
pub mod verdict;

pub use error::AdmissionError;
pub use ledger::{SignatureLedger, SignatureStatus, VerificationReport};
pub use quorum::{PolicyOnlyGate, QuorumDecision, QuorumGate, QuorumPolicy, SignatureQuorumGate};
pub use token::{ApprovalToken, TOKEN_PROTOCOL_VERSION};
pub use types::*;
pub use verdict::{CanaryVerdictEngine, ThresholdConfig};

pub type Result<T> = std::result::Result<T, AdmissionError>;
