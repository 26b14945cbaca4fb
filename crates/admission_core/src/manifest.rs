//! Structural validation turns a raw [`ProposalDocument`] into a [`Proposal`].
//!
//! Checks required fields, the `type`/`action` enums, `created_at`, and that every
//! payload path is relative, non-escaping and outside protected directories. Crate
//! manifests must also ship every file they declare. All problems are collected
//! rather than stopping at the first.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde_yaml::{Mapping, Value};

use crate::codes::*;
use crate::error::AdmissionError;
use crate::types::*;
use crate::Result;

/// Directory names a proposal may never write into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralRules {
    pub protected_dirs: Vec<String>,
}

impl Default for StructuralRules {
    fn default() -> Self {
        Self {
            protected_dirs: vec![".git".to_string()],
        }
    }
}

/// Normalize a repository-relative path, refusing absolute or escaping ones.
///
/// `./a/b` becomes `a/b`; `a/../b`, `/etc/passwd` and `C:\x` are refused.
pub fn normalize_relative(path: &str) -> std::result::Result<String, AuditFinding> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(AuditFinding::error(S_PATH_ESCAPE, "empty path"));
    }
    if trimmed.starts_with('\\') || trimmed.contains(":\\") || trimmed.contains(":/") {
        return Err(
            AuditFinding::error(S_PATH_ESCAPE, format!("absolute path '{trimmed}'")).at(trimmed),
        );
    }
    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(AuditFinding::error(
                    S_PATH_ESCAPE,
                    format!("path '{trimmed}' escapes the repository root"),
                )
                .at(trimmed))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AuditFinding::error(
                    S_PATH_ESCAPE,
                    format!("absolute path '{trimmed}'"),
                )
                .at(trimmed))
            }
        }
    }
    if parts.is_empty() {
        return Err(AuditFinding::error(S_PATH_ESCAPE, format!("path '{trimmed}' names the root")).at(trimmed));
    }
    Ok(parts.join("/"))
}

impl StructuralRules {
    /// Full check of one payload path.
    pub fn check_path(&self, path: &str) -> std::result::Result<String, AuditFinding> {
        let normalized = normalize_relative(path)?;
        if let Some(dir) = normalized
            .split('/')
            .find(|part| self.protected_dirs.iter().any(|p| p == part))
        {
            return Err(AuditFinding::error(
                S_PATH_PROTECTED,
                format!("path '{normalized}' is inside protected directory '{dir}'"),
            )
            .at(normalized));
        }
        Ok(normalized)
    }

    pub fn validate(&self, doc: &ProposalDocument) -> std::result::Result<Proposal, Vec<AuditFinding>> {
        let map = match serde_yaml::from_str::<Value>(&doc.manifest) {
            Ok(Value::Mapping(map)) => map,
            Ok(_) => {
                return Err(vec![AuditFinding::error(
                    S_MANIFEST_PARSE,
                    "manifest is not a YAML mapping",
                )])
            }
            Err(e) => {
                return Err(vec![AuditFinding::error(
                    S_MANIFEST_PARSE,
                    format!("manifest is not valid YAML: {e}"),
                )])
            }
        };

        let mut findings = Vec::new();
        let proposal = match doc.flavor {
            ProposalFlavor::File => self.validate_file(doc, &map, &mut findings),
            ProposalFlavor::Crate => self.validate_crate(doc, &map, &mut findings),
        };
        match proposal {
            Some(p) if findings.is_empty() => Ok(p),
            _ => Err(findings),
        }
    }

    fn validate_file(
        &self,
        doc: &ProposalDocument,
        map: &Mapping,
        findings: &mut Vec<AuditFinding>,
    ) -> Option<Proposal> {
        if let Some(id) = optional_str(map, "id", findings) {
            if id != doc.id {
                findings.push(AuditFinding::error(
                    S_MANIFEST_ID_MISMATCH,
                    format!("declared id '{id}' does not match file name '{}'", doc.id),
                ));
            }
        }

        // Token, quorum and write all see the normalized form, never the raw alias.
        let target_path = match required_str(map, "target_path", findings) {
            Some(raw) => match self.check_path(&raw) {
                Ok(path) => Some(path),
                Err(f) => {
                    findings.push(f);
                    None
                }
            },
            None => None,
        };
        let action = match required_str(map, "action", findings) {
            Some(raw) => parse_action(&raw, findings),
            None => None,
        };
        let kind = parse_kind(optional_str(map, "type", findings).as_deref(), findings);
        let justification = optional_str(map, "justification", findings);
        let content = optional_str(map, "content", findings).unwrap_or_default();
        let created_at = parse_created_at(map, findings);
        let signatures = parse_signatures(&doc.id, map.get("signatures"));

        let mut proposal =
            Proposal::single_file(doc.id.clone(), target_path?, action?, justification, content);
        proposal.kind = kind?;
        proposal.created_at = created_at;
        proposal.signatures = signatures;
        Some(proposal)
    }

    fn validate_crate(
        &self,
        doc: &ProposalDocument,
        map: &Mapping,
        findings: &mut Vec<AuditFinding>,
    ) -> Option<Proposal> {
        if let Some(crate_id) = required_str(map, "crate_id", findings) {
            if crate_id != doc.id {
                findings.push(AuditFinding::error(
                    S_MANIFEST_ID_MISMATCH,
                    format!("crate_id '{crate_id}' does not match directory '{}'", doc.id),
                ));
            }
        }
        let kind = match required_str(map, "type", findings) {
            Some(raw) => parse_kind(Some(&raw), findings),
            None => None,
        };
        let action = match optional_str(map, "action", findings) {
            Some(raw) => parse_action(&raw, findings),
            None => Some(ProposalAction::Replace),
        };
        let justification = optional_str(map, "justification", findings);
        let created_at = parse_created_at(map, findings);
        let signatures = parse_signatures(&doc.id, map.get("signatures"));

        let declared = match map.get("payload_files") {
            None | Some(Value::Null) => {
                findings.push(AuditFinding::error(
                    S_MANIFEST_MISSING_FIELD,
                    "missing required field 'payload_files'",
                ));
                Vec::new()
            }
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    other => {
                        findings.push(AuditFinding::error(
                            S_MANIFEST_PARSE,
                            format!("payload_files entry is not a string: {other:?}"),
                        ));
                        None
                    }
                })
                .collect(),
            Some(_) => {
                findings.push(AuditFinding::error(
                    S_MANIFEST_PARSE,
                    "'payload_files' must be a list of relative paths",
                ));
                Vec::new()
            }
        };
        if declared.is_empty() && map.contains_key("payload_files") {
            findings.push(AuditFinding::error(S_PAYLOAD_EMPTY, "crate declares no payload files"));
        }

        let mut payload_files = BTreeMap::new();
        for raw in &declared {
            let path = match self.check_path(raw) {
                Ok(path) => path,
                Err(f) => {
                    findings.push(f);
                    continue;
                }
            };
            match doc.payload_files.get(&path) {
                Some(content) => {
                    payload_files.insert(path, content.clone());
                }
                None => findings.push(
                    AuditFinding::error(
                        S_PAYLOAD_MISSING_FILE,
                        format!("declared payload file '{path}' is missing from payload/"),
                    )
                    .at(path.clone()),
                ),
            }
        }
        for shipped in doc.payload_files.keys() {
            if !payload_files.contains_key(shipped) && !declared.iter().any(|d| d == shipped) {
                tracing::warn!(
                    target: "admission.orchestrator",
                    proposal_id = %doc.id,
                    path = %shipped,
                    "undeclared payload file ignored"
                );
            }
        }

        // The signable view of a crate: sorted paths and the full payload.
        let target_path = payload_files.keys().cloned().collect::<Vec<_>>().join("\n");
        let content = match serde_json::to_string(&payload_files) {
            Ok(content) => content,
            Err(e) => {
                findings.push(AuditFinding::error(
                    S_MANIFEST_PARSE,
                    format!("payload cannot be encoded for signing: {e}"),
                ));
                return None;
            }
        };

        Some(Proposal {
            id: doc.id.clone(),
            flavor: ProposalFlavor::Crate,
            kind: kind?,
            target_path,
            action: action?,
            justification,
            content,
            payload_files,
            created_at,
            signatures,
        })
    }
}

fn required_str(map: &Mapping, key: &str, findings: &mut Vec<AuditFinding>) -> Option<String> {
    let blank = match map.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    };
    if blank {
        findings.push(AuditFinding::error(
            S_MANIFEST_MISSING_FIELD,
            format!("missing required field '{key}'"),
        ));
        return None;
    }
    optional_str(map, key, findings)
}

/// `None` for absent or null; a finding for anything that is not a scalar string.
fn optional_str(map: &Mapping, key: &str, findings: &mut Vec<AuditFinding>) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            findings.push(AuditFinding::error(
                S_MANIFEST_PARSE,
                format!("field '{key}' must be a string, got {}", value_kind(other)),
            ));
            None
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

fn parse_action(raw: &str, findings: &mut Vec<AuditFinding>) -> Option<ProposalAction> {
    let action = ProposalAction::parse(raw);
    if action.is_none() {
        findings.push(AuditFinding::error(
            S_MANIFEST_INVALID_ACTION,
            format!("action '{raw}' is not one of create, edit, replace"),
        ));
    }
    action
}

fn parse_kind(raw: Option<&str>, findings: &mut Vec<AuditFinding>) -> Option<ProposalKind> {
    let Some(raw) = raw else {
        return Some(ProposalKind::Standard);
    };
    let kind = ProposalKind::parse(raw);
    if kind.is_none() {
        findings.push(AuditFinding::error(
            S_MANIFEST_INVALID_TYPE,
            format!("type '{raw}' is not one of STANDARD, CONSTITUTIONAL_AMENDMENT"),
        ));
    }
    kind
}

fn parse_created_at(map: &Mapping, findings: &mut Vec<AuditFinding>) -> Option<DateTime<Utc>> {
    let raw = optional_str(map, "created_at", findings)?;
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            findings.push(AuditFinding::error(
                S_MANIFEST_INVALID_TIMESTAMP,
                format!("created_at '{raw}' is not RFC 3339: {e}"),
            ));
            None
        }
    }
}

/// Malformed entries are dropped with a warning; they never block the proposal.
pub fn parse_signatures(proposal_id: &str, value: Option<&Value>) -> Vec<Signature> {
    let Some(Value::Sequence(entries)) = value else {
        if let Some(v) = value.filter(|v| !v.is_null()) {
            tracing::warn!(
                target: "admission.ledger",
                proposal_id,
                kind = value_kind(v),
                "signatures field is not a list; ignoring"
            );
        }
        return Vec::new();
    };
    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            match serde_yaml::from_value::<Signature>(entry.clone()) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    tracing::warn!(
                        target: "admission.ledger",
                        proposal_id,
                        index,
                        error = %e,
                        "malformed signature entry ignored"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Render a new single-file proposal document for the pending store.
pub fn render_file_proposal(proposal: &Proposal) -> Result<ProposalDocument> {
    let mut map = Mapping::new();
    map.insert("id".into(), proposal.id.clone().into());
    map.insert("type".into(), proposal.kind.as_str().into());
    map.insert("target_path".into(), proposal.target_path.clone().into());
    map.insert("action".into(), proposal.action.as_str().into());
    map.insert(
        "justification".into(),
        proposal
            .justification
            .clone()
            .map(Value::from)
            .unwrap_or(Value::Null),
    );
    map.insert("content".into(), proposal.content.clone().into());
    if let Some(ts) = proposal.created_at {
        map.insert("created_at".into(), ts.to_rfc3339().into());
    }
    map.insert(
        "signatures".into(),
        serde_yaml::to_value(&proposal.signatures)
            .map_err(|e| AdmissionError::Internal(anyhow::anyhow!("serialize signatures: {e}")))?,
    );
    let manifest = serde_yaml::to_string(&Value::Mapping(map))
        .map_err(|e| AdmissionError::Internal(anyhow::anyhow!("serialize proposal: {e}")))?;
    Ok(ProposalDocument {
        id: proposal.id.clone(),
        flavor: ProposalFlavor::File,
        manifest,
        payload_files: BTreeMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::ApprovalToken;

    fn file_doc(yaml: &str) -> ProposalDocument {
        ProposalDocument {
            id: "p1".into(),
            flavor: ProposalFlavor::File,
            manifest: yaml.into(),
            payload_files: BTreeMap::new(),
        }
    }

    fn crate_doc(yaml: &str, files: &[(&str, &str)]) -> ProposalDocument {
        ProposalDocument {
            id: "c1".into(),
            flavor: ProposalFlavor::Crate,
            manifest: yaml.into(),
            payload_files: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn check_ids(findings: &[AuditFinding]) -> Vec<&str> {
        findings.iter().map(|f| f.check_id.as_str()).collect()
    }

    #[test]
    fn test_valid_file_proposal() {
        let doc = file_doc(
            r#"
target_path: src/lib.rs
action: edit
justification: fix
content: "pub fn a() {}\n"
created_at: "2026-03-01T10:00:00Z"
reviewer: someone
signatures:
  - {identity: alice, signature_b64: AAAA, token: "core-proposal-v6:00"}
  - {identity: broken}
"#,
        );
        let p = StructuralRules::default().validate(&doc).unwrap();
        assert_eq!(p.target_path, "src/lib.rs");
        assert_eq!(p.action, ProposalAction::Edit);
        assert_eq!(p.kind, ProposalKind::Standard);
        assert_eq!(p.payload_files["src/lib.rs"], "pub fn a() {}\n");
        assert_eq!(p.signatures.len(), 1);
        assert!(p.created_at.is_some());
        assert_eq!(
            ApprovalToken::generate(&p),
            ApprovalToken::from_fields("src/lib.rs", "edit", Some("fix"), "pub fn a() {}\n")
        );
    }

    #[test]
    fn test_aliased_target_path_is_normalized() {
        for alias in [".intent/./charter.yaml", ".intent//charter.yaml", "./.intent/charter.yaml"] {
            let doc = file_doc(&format!("target_path: \"{alias}\"\naction: edit\ncontent: x\n"));
            let p = StructuralRules::default().validate(&doc).unwrap();
            assert_eq!(p.target_path, ".intent/charter.yaml", "{alias}");
            assert_eq!(
                p.payload_files.keys().collect::<Vec<_>>(),
                vec![".intent/charter.yaml"],
                "{alias}"
            );
            assert_eq!(
                ApprovalToken::generate(&p),
                ApprovalToken::from_fields(".intent/charter.yaml", "edit", None, "x")
            );
        }
    }

    #[test]
    fn test_missing_and_invalid_fields_collected() {
        let doc = file_doc("action: delete\ntype: EMERGENCY\ncreated_at: yesterday\n");
        let findings = StructuralRules::default().validate(&doc).unwrap_err();
        let ids = check_ids(&findings);
        assert!(ids.contains(&S_MANIFEST_MISSING_FIELD));
        assert!(ids.contains(&S_MANIFEST_INVALID_ACTION));
        assert!(ids.contains(&S_MANIFEST_INVALID_TYPE));
        assert!(ids.contains(&S_MANIFEST_INVALID_TIMESTAMP));
    }

    #[test]
    fn test_escaping_and_protected_paths() {
        let rules = StructuralRules {
            protected_dirs: vec![".git".into(), ".admission".into()],
        };
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", "C:\\x"] {
            let f = rules.check_path(bad).unwrap_err();
            assert_eq!(f.check_id, S_PATH_ESCAPE, "{bad}");
        }
        assert_eq!(rules.check_path(".git/config").unwrap_err().check_id, S_PATH_PROTECTED);
        assert_eq!(
            rules.check_path("sub/.admission/pending/x.yaml").unwrap_err().check_id,
            S_PATH_PROTECTED
        );
        assert_eq!(rules.check_path("./src/./lib.rs").unwrap(), "src/lib.rs");
    }

    #[test]
    fn test_amendment_type_and_non_mapping() {
        let doc = file_doc("target_path: a.md\naction: create\ntype: CONSTITUTIONAL_AMENDMENT\n");
        let p = StructuralRules::default().validate(&doc).unwrap();
        assert_eq!(p.kind, ProposalKind::ConstitutionalAmendment);
        assert_eq!(p.content, "");

        let findings = StructuralRules::default().validate(&file_doc("- a\n- b\n")).unwrap_err();
        assert_eq!(check_ids(&findings), vec![S_MANIFEST_PARSE]);
    }

    #[test]
    fn test_id_mismatch() {
        let doc = file_doc("id: other\ntarget_path: a.md\naction: create\n");
        let findings = StructuralRules::default().validate(&doc).unwrap_err();
        assert_eq!(check_ids(&findings), vec![S_MANIFEST_ID_MISMATCH]);
    }

    #[test]
    fn test_valid_crate() {
        let doc = crate_doc(
            "crate_id: c1\ntype: STANDARD\npayload_files: [src/b.rs, ./src/a.rs]\n",
            &[("src/a.rs", "a"), ("src/b.rs", "b"), ("notes.txt", "extra")],
        );
        let p = StructuralRules::default().validate(&doc).unwrap();
        assert_eq!(p.flavor, ProposalFlavor::Crate);
        assert_eq!(p.action, ProposalAction::Replace);
        assert_eq!(p.target_path, "src/a.rs\nsrc/b.rs");
        assert_eq!(p.payload_files.len(), 2);
        assert_eq!(p.content, r#"{"src/a.rs":"a","src/b.rs":"b"}"#);
    }

    #[test]
    fn test_crate_missing_payload_file() {
        let doc = crate_doc(
            "crate_id: c1\ntype: STANDARD\npayload_files: [src/a.rs, src/gone.rs]\n",
            &[("src/a.rs", "a")],
        );
        let findings = StructuralRules::default().validate(&doc).unwrap_err();
        assert_eq!(check_ids(&findings), vec![S_PAYLOAD_MISSING_FILE]);
        assert_eq!(findings[0].file_path.as_deref(), Some("src/gone.rs"));
    }

    #[test]
    fn test_crate_schema_errors() {
        let doc = crate_doc("crate_id: other\npayload_files: []\n", &[]);
        let findings = StructuralRules::default().validate(&doc).unwrap_err();
        let ids = check_ids(&findings);
        assert!(ids.contains(&S_MANIFEST_ID_MISMATCH));
        assert!(ids.contains(&S_MANIFEST_MISSING_FIELD));
        assert!(ids.contains(&S_PAYLOAD_EMPTY));
    }

    #[test]
    fn test_render_then_validate() {
        let mut p = Proposal::single_file(
            "p1",
            "docs/a.md",
            ProposalAction::Create,
            None,
            "# A\n",
        );
        p.created_at = Some(Utc::now());
        let doc = render_file_proposal(&p).unwrap();
        let back = StructuralRules::default().validate(&doc).unwrap();
        assert_eq!(ApprovalToken::generate(&back), ApprovalToken::generate(&p));
        assert!(doc.manifest.contains("justification: null"));
    }
}
