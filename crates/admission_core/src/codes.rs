//! Structured finding / error code constants for the admission pipeline.
//!
//! Format: `{STAGE}:{CATEGORY}:{CODE}`
//!   S:*      structural check (manifest / schema / paths)
//!   Q:*      quorum check
//!   C:*      canary trial
//!   APPLY:*  live-tree mutation
//!
//! Infrastructure diagnostics raised inside a canary trial use dotted check ids
//! (`infra.*`) so they sort next to the audit's own check ids in reports.

// ── Structural (S:*) ───────────────────────────────────────────

/// Manifest is not valid YAML or not a mapping.
pub const S_MANIFEST_PARSE: &str = "S:MANIFEST:PARSE";
/// A required manifest field is absent or has the wrong shape.
pub const S_MANIFEST_MISSING_FIELD: &str = "S:MANIFEST:MISSING_FIELD";
/// `type` is not one of the known proposal kinds.
pub const S_MANIFEST_INVALID_TYPE: &str = "S:MANIFEST:INVALID_TYPE";
/// `action` is not one of create / edit / replace.
pub const S_MANIFEST_INVALID_ACTION: &str = "S:MANIFEST:INVALID_ACTION";
/// `created_at` is present but not an RFC 3339 timestamp.
pub const S_MANIFEST_INVALID_TIMESTAMP: &str = "S:MANIFEST:INVALID_TIMESTAMP";
/// Crate id in the manifest does not match its directory.
pub const S_MANIFEST_ID_MISMATCH: &str = "S:MANIFEST:ID_MISMATCH";
/// Payload path is absolute, empty, or escapes the repository root.
pub const S_PATH_ESCAPE: &str = "S:PATH:ESCAPE";
/// Payload path targets a protected directory (VCS metadata, admission state).
pub const S_PATH_PROTECTED: &str = "S:PATH:PROTECTED";
/// A declared crate payload file was not shipped with the crate.
pub const S_PAYLOAD_MISSING_FILE: &str = "S:PAYLOAD:MISSING_FILE";
/// Crate declares no payload files.
pub const S_PAYLOAD_EMPTY: &str = "S:PAYLOAD:EMPTY";

// ── Quorum (Q:*) ───────────────────────────────────────────────

/// Fewer valid signatures than the policy requires.
pub const Q_NOT_MET: &str = "Q:NOT_MET";

// ── Canary (C:*) ───────────────────────────────────────────────

/// Canary ran cleanly but findings exceeded the configured tolerance.
pub const C_POLICY_REJECTION: &str = "C:POLICY:REJECTION";
/// Canary infrastructure (sandbox or audit) failed.
pub const C_INFRA_FAILURE: &str = "C:INFRA:FAILURE";

/// Audit execution raised an error or panicked.
pub const INFRA_CANARY_CRASH: &str = "infra.canary_crash";
/// Audit execution exceeded its time budget.
pub const INFRA_CANARY_TIMEOUT: &str = "infra.canary_timeout";
/// Sandbox could not be created.
pub const INFRA_SANDBOX_FAILED: &str = "infra.sandbox_failed";

// ── Live tree (APPLY:*) ────────────────────────────────────────

/// Writing payload into the live tree failed; applied files were reverted.
pub const APPLY_WRITE_FAILED: &str = "APPLY:WRITE_FAILED";
/// Another admission holds the repository single-writer lock.
pub const APPLY_LOCK_CONTENTION: &str = "APPLY:LOCK_CONTENTION";

// ── Generic ────────────────────────────────────────────────────

pub const NOT_FOUND: &str = "NOT_FOUND";
pub const SIGNATURE_ERROR: &str = "SIGNATURE:ERROR";
pub const INVALID_INPUT: &str = "INVALID_INPUT";
pub const IO_ERROR: &str = "IO:ERROR";
pub const INTERNAL: &str = "INTERNAL";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_code_format() {
        let staged = [
            S_MANIFEST_PARSE,
            S_MANIFEST_MISSING_FIELD,
            S_MANIFEST_INVALID_TYPE,
            S_MANIFEST_INVALID_ACTION,
            S_MANIFEST_INVALID_TIMESTAMP,
            S_MANIFEST_ID_MISMATCH,
            S_PATH_ESCAPE,
            S_PATH_PROTECTED,
            S_PAYLOAD_MISSING_FILE,
            S_PAYLOAD_EMPTY,
            Q_NOT_MET,
            C_POLICY_REJECTION,
            C_INFRA_FAILURE,
            APPLY_WRITE_FAILED,
            APPLY_LOCK_CONTENTION,
        ];

        for code in &staged {
            let parts: Vec<&str> = code.split(':').collect();
            assert!(parts.len() >= 2, "code {code} must have a stage prefix");
            assert!(
                matches!(parts[0], "S" | "Q" | "C" | "APPLY"),
                "code {code} has unknown stage"
            );
        }
    }

    #[test]
    fn test_infra_ids_are_dotted() {
        for id in [INFRA_CANARY_CRASH, INFRA_CANARY_TIMEOUT, INFRA_SANDBOX_FAILED] {
            assert!(id.starts_with("infra."), "{id}");
        }
    }
}
