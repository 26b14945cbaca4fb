//! Approvers registry: who may sign, and the quorum policy they sign under.
//!
//! ```yaml
//! approvers:
//!   - identity: alice
//!     public_key_pem: |
//!       -----BEGIN PUBLIC KEY-----
//!       ...
//! quorum:
//!   current_mode: production
//!   development: { standard: 1, critical: 1 }
//!   production:  { standard: 1, critical: 2 }
//! critical_paths: [".intent/charter.yaml", "governance/**/*.yaml"]
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;
use crate::ledger::parse_public_key;
use crate::quorum::{QuorumCounts, QuorumMode, QuorumPolicy};
use crate::types::Approver;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawQuorumSection {
    #[serde(default)]
    pub current_mode: QuorumMode,
    #[serde(default)]
    pub development: Option<QuorumCounts>,
    #[serde(default)]
    pub production: Option<QuorumCounts>,
}

/// Registry file as it appears on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawRegistry {
    #[serde(default)]
    pub approvers: Vec<Approver>,
    #[serde(default)]
    pub quorum: RawQuorumSection,
    #[serde(default)]
    pub critical_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproversRegistry {
    pub approvers: Vec<Approver>,
    pub policy: QuorumPolicy,
}

impl ApproversRegistry {
    pub fn load_from_str(yaml: &str) -> Result<Self> {
        let raw: RawRegistry = serde_yaml::from_str(yaml).map_err(|e| {
            AdmissionError::InvalidInput(format!("Failed to parse approvers registry: {e}"))
        })?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawRegistry) -> Result<Self> {
        let mut seen = HashSet::new();
        for approver in &raw.approvers {
            if approver.identity.trim().is_empty() {
                return Err(AdmissionError::InvalidInput(
                    "approvers registry contains an empty identity".to_string(),
                ));
            }
            if !seen.insert(approver.identity.as_str()) {
                return Err(AdmissionError::InvalidInput(format!(
                    "approvers registry lists identity '{}' more than once",
                    approver.identity
                )));
            }
            if let Err(e) = parse_public_key(&approver.public_key_pem) {
                // Kept: its signatures will verify as invalid rather than failing the load.
                tracing::warn!(
                    target: "admission.ledger",
                    identity = %approver.identity,
                    error = %e,
                    "approver public key is unusable"
                );
            }
        }

        let mut quorum = BTreeMap::new();
        if let Some(counts) = raw.quorum.development {
            quorum.insert(QuorumMode::Development, counts);
        }
        if let Some(counts) = raw.quorum.production {
            quorum.insert(QuorumMode::Production, counts);
        }

        Ok(Self {
            approvers: raw.approvers,
            policy: QuorumPolicy {
                current_mode: raw.quorum.current_mode,
                critical_paths: raw.critical_paths,
                quorum,
            },
        })
    }

    pub fn find(&self, identity: &str) -> Option<&Approver> {
        self.approvers.iter().find(|a| a.identity == identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::QuorumPolicyEvaluator;

    const REGISTRY: &str = r#"
approvers:
  - identity: alice
    public_key_pem: "0101010101010101010101010101010101010101010101010101010101010101"
  - identity: bob
    public_key_pem: "not-a-key"
quorum:
  current_mode: production
  development: {standard: 1, critical: 1}
  production: {standard: 1, critical: 2}
critical_paths: [".intent/charter.yaml"]
"#;

    #[test]
    fn test_load_registry() {
        let registry = ApproversRegistry::load_from_str(REGISTRY).unwrap();
        assert_eq!(registry.approvers.len(), 2);
        assert!(registry.find("bob").is_some());
        assert!(registry.find("carol").is_none());
        assert_eq!(registry.policy.current_mode, QuorumMode::Production);
        assert_eq!(
            QuorumPolicyEvaluator::required(".intent/charter.yaml", &registry.policy),
            2
        );
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let yaml = r#"
approvers:
  - {identity: alice, public_key_pem: x}
  - {identity: alice, public_key_pem: y}
"#;
        let err = ApproversRegistry::load_from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_empty_registry_defaults() {
        let registry = ApproversRegistry::load_from_str("{}").unwrap();
        assert!(registry.approvers.is_empty());
        assert_eq!(registry.policy.current_mode, QuorumMode::Development);
        assert_eq!(QuorumPolicyEvaluator::required("x", &registry.policy), 1);
    }
}
