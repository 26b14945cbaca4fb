//! Canary verdict: run the audit against a sandbox and decide pass/fail.
//!
//! `evaluate` never returns an error: audit crashes, panics and timeouts all
//! become failing [`CanaryResult`]s carrying an `infra.*` finding.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::codes;
use crate::ports::AuditRunner;
use crate::types::{AuditFinding, CanaryResult, Severity};

pub const DEFAULT_AUDIT_TIMEOUT_SECS: u64 = 300;

/// Canary thresholds. Severities absent from `tolerances` never block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tolerances")]
    pub tolerances: BTreeMap<Severity, u64>,
    #[serde(default = "default_audit_timeout")]
    pub audit_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_tolerances() -> BTreeMap<Severity, u64> {
    BTreeMap::from([(Severity::Error, 0)])
}

fn default_audit_timeout() -> u64 {
    DEFAULT_AUDIT_TIMEOUT_SECS
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tolerances: default_tolerances(),
            audit_timeout_secs: default_audit_timeout(),
        }
    }
}

impl ThresholdConfig {
    pub fn audit_timeout(&self) -> Duration {
        Duration::from_secs(self.audit_timeout_secs)
    }
}

pub fn severity_metric(severity: Severity) -> String {
    format!("severity.{}", severity.as_str())
}

#[derive(Debug, Clone, Default)]
pub struct CanaryVerdictEngine {
    config: ThresholdConfig,
}

impl CanaryVerdictEngine {
    pub fn new(config: ThresholdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// `findings_total` plus one `severity.<name>` count per severity (zeros included).
    pub fn derive_metrics(findings: &[AuditFinding]) -> BTreeMap<String, u64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("findings_total".to_string(), findings.len() as u64);
        for severity in [Severity::Error, Severity::Warning, Severity::Info] {
            metrics.insert(severity_metric(severity), 0);
        }
        for finding in findings {
            *metrics.entry(severity_metric(finding.severity)).or_insert(0) += 1;
        }
        metrics
    }

    /// Apply thresholds to already-derived metrics. Returns `(passed, reasons)`.
    pub fn enforce(metrics: &BTreeMap<String, u64>, config: &ThresholdConfig) -> (bool, Vec<String>) {
        if !config.enabled {
            tracing::warn!(
                target: "admission.canary",
                "canary thresholds disabled; admitting without enforcement"
            );
            return (true, vec![]);
        }

        let mut reasons = Vec::new();
        for (severity, tolerance) in &config.tolerances {
            let key = severity_metric(*severity);
            let count = metrics.get(&key).copied().unwrap_or(0);
            if count > *tolerance {
                reasons.push(format!(
                    "{key} = {count} exceeds tolerance {tolerance}"
                ));
            }
        }
        (reasons.is_empty(), reasons)
    }

    /// Build a result from a completed audit.
    pub fn judge(&self, findings: Vec<AuditFinding>) -> CanaryResult {
        let metrics = Self::derive_metrics(&findings);
        let (passed, mut reasons) = Self::enforce(&metrics, &self.config);
        if !passed {
            reasons.extend(
                findings
                    .iter()
                    .filter(|f| self.config.tolerances.contains_key(&f.severity))
                    .map(ToString::to_string),
            );
        }
        CanaryResult {
            passed,
            metrics,
            reasons,
            findings,
        }
    }

    /// Run the audit against `sandbox` under the configured timeout.
    pub async fn evaluate(&self, sandbox: &Path, runner: Arc<dyn AuditRunner>) -> CanaryResult {
        if !self.config.enabled {
            tracing::warn!(
                target: "admission.canary",
                sandbox = %sandbox.display(),
                "canary disabled; skipping audit"
            );
            return CanaryResult {
                passed: true,
                metrics: Self::derive_metrics(&[]),
                reasons: vec![],
                findings: vec![],
            };
        }

        let root = sandbox.to_path_buf();
        let started = Instant::now();
        let mut handle = tokio::spawn(async move { runner.run_full_audit(&root).await });

        let outcome = tokio::time::timeout(self.config.audit_timeout(), &mut handle).await;
        let result = match outcome {
            Ok(Ok(Ok(findings))) => self.judge(findings),
            Ok(Ok(Err(e))) => {
                tracing::error!(
                    target: "admission.canary",
                    sandbox = %sandbox.display(),
                    error = %format!("{e:#}"),
                    "audit run failed"
                );
                CanaryResult::infra_failure(
                    codes::INFRA_CANARY_CRASH,
                    format!("audit run failed: {e:#}"),
                )
            }
            Ok(Err(join_err)) => {
                let cause = if join_err.is_panic() {
                    "audit panicked"
                } else {
                    "audit task cancelled"
                };
                tracing::error!(
                    target: "admission.canary",
                    sandbox = %sandbox.display(),
                    error = %join_err,
                    "{cause}"
                );
                CanaryResult::infra_failure(codes::INFRA_CANARY_CRASH, cause)
            }
            Err(_) => {
                handle.abort();
                tracing::error!(
                    target: "admission.canary",
                    sandbox = %sandbox.display(),
                    timeout_secs = self.config.audit_timeout_secs,
                    "audit timed out"
                );
                CanaryResult::infra_failure(
                    codes::INFRA_CANARY_TIMEOUT,
                    format!(
                        "audit exceeded {}s timeout",
                        self.config.audit_timeout_secs
                    ),
                )
            }
        };

        tracing::debug!(
            target: "admission.canary",
            passed = result.passed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "canary verdict"
        );
        result
    }
}
