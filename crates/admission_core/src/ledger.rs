//! Signature ledger: per-identity Ed25519 signatures over the approval token.
//!
//! Verification is lenient per entry and strict in aggregate: every stored signature
//! gets a status, bad entries are excluded from the count, and nothing one entry
//! does can stop the others from being checked.

use std::collections::{BTreeSet, HashMap};

use base64::{engine::general_purpose, Engine as _};
use chrono::{SecondsFormat, Utc};
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;
use crate::token::ApprovalToken;
use crate::types::{Approver, Proposal, Signature};
use crate::Result;

/// Verification status of one stored signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    /// Counted toward quorum.
    Valid,
    /// Signed a token that no longer matches the proposal.
    Stale,
    /// Identity is not in the approvers registry.
    UnknownIdentity,
    /// Signature bytes or key material do not verify.
    Invalid,
    /// A second valid entry for an identity that was already counted.
    Duplicate,
}

impl SignatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Stale => "stale",
            Self::UnknownIdentity => "unknown_identity",
            Self::Invalid => "invalid",
            Self::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureCheck {
    pub identity: String,
    pub status: SignatureStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub expected_token: String,
    pub valid_count: usize,
    pub checks: Vec<SignatureCheck>,
}

impl VerificationReport {
    pub fn count(&self, status: SignatureStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn valid_identities(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.status == SignatureStatus::Valid)
            .map(|c| c.identity.as_str())
            .collect()
    }
}

pub struct SignatureLedger;

impl SignatureLedger {
    /// Sign the proposal's current token as `identity`, replacing any earlier
    /// signature by the same identity.
    pub fn sign(proposal: &mut Proposal, key: &SigningKey, identity: &str) -> Signature {
        let token = ApprovalToken::generate(proposal);
        let raw = key.sign(token.as_str().as_bytes());
        let signature = Signature {
            identity: identity.to_string(),
            signature_b64: general_purpose::STANDARD.encode(raw.to_bytes()),
            token: token.into_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        let replaced = proposal
            .signatures
            .iter()
            .any(|s| s.identity == identity);
        proposal.signatures.retain(|s| s.identity != identity);
        proposal.signatures.push(signature.clone());

        tracing::info!(
            target: "admission.ledger",
            proposal_id = %proposal.id,
            identity,
            replaced,
            "signature recorded"
        );
        signature
    }

    /// Verify every stored signature against the proposal's current token.
    pub fn verify(proposal: &Proposal, approvers: &[Approver]) -> VerificationReport {
        let expected = ApprovalToken::generate(proposal);
        let registry: HashMap<&str, &Approver> = approvers
            .iter()
            .map(|a| (a.identity.as_str(), a))
            .collect();

        let mut counted: BTreeSet<&str> = BTreeSet::new();
        let mut checks = Vec::with_capacity(proposal.signatures.len());

        for sig in &proposal.signatures {
            let status = if !expected.matches(&sig.token) {
                tracing::warn!(
                    target: "admission.ledger",
                    proposal_id = %proposal.id,
                    identity = %sig.identity,
                    "stale signature excluded (token mismatch)"
                );
                SignatureStatus::Stale
            } else if let Some(approver) = registry.get(sig.identity.as_str()) {
                match verify_one(sig, approver, &expected) {
                    Ok(()) if counted.contains(sig.identity.as_str()) => SignatureStatus::Duplicate,
                    Ok(()) => {
                        counted.insert(sig.identity.as_str());
                        SignatureStatus::Valid
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "admission.ledger",
                            proposal_id = %proposal.id,
                            identity = %sig.identity,
                            error = %e,
                            "invalid signature excluded"
                        );
                        SignatureStatus::Invalid
                    }
                }
            } else {
                tracing::warn!(
                    target: "admission.ledger",
                    proposal_id = %proposal.id,
                    identity = %sig.identity,
                    "signature from unknown identity excluded"
                );
                SignatureStatus::UnknownIdentity
            };

            checks.push(SignatureCheck {
                identity: sig.identity.clone(),
                status,
            });
        }

        let report = VerificationReport {
            expected_token: expected.into_string(),
            valid_count: counted.len(),
            checks,
        };
        crate::metrics::emit_verify(&proposal.id, &report);
        report
    }
}

fn verify_one(sig: &Signature, approver: &Approver, token: &ApprovalToken) -> Result<()> {
    let key = parse_public_key(&approver.public_key_pem)?;
    let bytes = sig
        .signature_bytes()
        .map_err(|e| AdmissionError::Signature(format!("signature is not base64: {e}")))?;
    let signature = Ed25519Signature::from_slice(&bytes)
        .map_err(|_| AdmissionError::Signature("signature must be 64 bytes".to_string()))?;
    key.verify_strict(token.as_str().as_bytes(), &signature)
        .map_err(|_| AdmissionError::Signature("signature does not verify".to_string()))
}

// ── Key material ──────────────────────────────────────────────────

/// Parse an approver public key: SPKI PEM, or a raw 32-byte key in hex/base64.
pub fn parse_public_key(raw: &str) -> Result<VerifyingKey> {
    let trimmed = raw.trim();
    if trimmed.starts_with("-----BEGIN") {
        return VerifyingKey::from_public_key_pem(trimmed)
            .map_err(|e| AdmissionError::Signature(format!("invalid public key PEM: {e}")));
    }
    let bytes: [u8; 32] = decode_hex_or_base64(trimmed)?
        .try_into()
        .map_err(|_| AdmissionError::Signature("Ed25519 public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| AdmissionError::Signature("invalid Ed25519 public key bytes".into()))
}

/// Parse a signing key: PKCS#8 PEM, or a raw 32-byte seed in hex/base64.
pub fn parse_signing_key(raw: &str) -> Result<SigningKey> {
    let trimmed = raw.trim();
    if trimmed.starts_with("-----BEGIN") {
        return SigningKey::from_pkcs8_pem(trimmed)
            .map_err(|e| AdmissionError::Signature(format!("invalid private key PEM: {e}")));
    }
    let seed: [u8; 32] = decode_hex_or_base64(trimmed)?
        .try_into()
        .map_err(|_| AdmissionError::Signature("Ed25519 seed must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&seed))
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// PKCS#8 PEM for a signing key.
pub fn signing_key_to_pem(key: &SigningKey) -> Result<String> {
    key.to_pkcs8_pem(Default::default())
        .map(|pem| pem.to_string())
        .map_err(|e| AdmissionError::Signature(format!("cannot encode private key: {e}")))
}

/// SPKI PEM for a verifying key.
pub fn verifying_key_to_pem(key: &VerifyingKey) -> Result<String> {
    key.to_public_key_pem(Default::default())
        .map_err(|e| AdmissionError::Signature(format!("cannot encode public key: {e}")))
}

fn decode_hex_or_base64(raw: &str) -> Result<Vec<u8>> {
    if raw.is_empty() {
        return Err(AdmissionError::Signature("key material is empty".into()));
    }
    if raw.len() % 2 == 0 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return hex::decode(raw)
            .map_err(|e| AdmissionError::Signature(format!("invalid hex key: {e}")));
    }
    general_purpose::STANDARD
        .decode(raw)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(raw))
        .map_err(|e| AdmissionError::Signature(format!("key is neither hex nor base64: {e}")))
}
