//! Approval token: the value approvers sign.
//!
//! Algorithm:
//!   1. Take exactly `target_path`, `action`, `justification`, `content`
//!      (missing `justification` → null, missing `content` → "")
//!   2. Serialize as compact JSON with lexicographically sorted keys
//!   3. Hash: SHA-256, hex-encoded
//!   4. Token: `"core-proposal-v6:" + hex`
//!
//! Anything else on the proposal (signatures, timestamps, unknown keys) is ignored,
//! so attaching a signature never invalidates the token it was made over.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::Proposal;

/// Protocol version prefix baked into every token.
pub const TOKEN_PROTOCOL_VERSION: &str = "core-proposal-v6";

/// The four fields that make up a token, in sorted order.
pub const SIGNABLE_FIELDS: [&str; 4] = ["action", "content", "justification", "target_path"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApprovalToken(String);

impl ApprovalToken {
    /// Token for a parsed proposal.
    pub fn generate(proposal: &Proposal) -> Self {
        Self::from_fields(
            &proposal.target_path,
            proposal.action.as_str(),
            proposal.justification.as_deref(),
            &proposal.content,
        )
    }

    pub fn from_fields(
        target_path: &str,
        action: &str,
        justification: Option<&str>,
        content: &str,
    ) -> Self {
        let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
        fields.insert("target_path", Value::from(target_path));
        fields.insert("action", Value::from(action));
        fields.insert(
            "justification",
            justification.map(Value::from).unwrap_or(Value::Null),
        );
        fields.insert("content", Value::from(content));
        Self::hash_canonical(&fields)
    }

    /// Token for an arbitrary document (e.g. a raw proposal file).
    ///
    /// Keys outside the signable set are dropped; non-object input behaves as an
    /// empty object.
    pub fn from_value(document: &Value) -> Self {
        let get = |key: &str| document.get(key).cloned();
        let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
        fields.insert("target_path", get("target_path").unwrap_or(Value::Null));
        fields.insert("action", get("action").unwrap_or(Value::Null));
        fields.insert("justification", get("justification").unwrap_or(Value::Null));
        fields.insert(
            "content",
            get("content").unwrap_or_else(|| Value::from("")),
        );
        Self::hash_canonical(&fields)
    }

    fn hash_canonical(fields: &BTreeMap<&str, Value>) -> Self {
        // Sorted keys and scalar values, so the compact `Value` rendering is canonical.
        let canonical = Value::Object(
            fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
        .to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("{}:{}", TOKEN_PROTOCOL_VERSION, hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether a stored token string refers to this token.
    pub fn matches(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl std::fmt::Display for ApprovalToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
