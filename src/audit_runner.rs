//! External governance audit invoked as a subprocess.
//!
//! The command's stdout must be JSON: either a list of findings or an object with a
//! `findings` list. A non-zero exit with parseable findings is a normal "findings
//! present" result; anything else unparseable is an error, which the verdict engine
//! turns into `infra.canary_crash`.

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::Deserialize;

use admission_core::ports::AuditRunner;
use admission_core::AuditFinding;

pub const ROOT_PLACEHOLDER: &str = "{root}";

#[derive(Debug, Clone)]
pub struct CommandAuditRunner {
    command: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AuditOutput {
    List(Vec<AuditFinding>),
    Wrapped { findings: Vec<AuditFinding> },
}

impl CommandAuditRunner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn argv(&self, root: &Path) -> anyhow::Result<(String, Vec<String>)> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("no audit_command configured"))?;
        let root = root.display().to_string();
        let args = args
            .iter()
            .map(|arg| arg.replace(ROOT_PLACEHOLDER, &root))
            .collect();
        Ok((program.replace(ROOT_PLACEHOLDER, &root), args))
    }
}

pub fn parse_findings(stdout: &str) -> anyhow::Result<Vec<AuditFinding>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }
    let output: AuditOutput =
        serde_json::from_str(trimmed).context("audit output is not a findings document")?;
    Ok(match output {
        AuditOutput::List(findings) => findings,
        AuditOutput::Wrapped { findings } => findings,
    })
}

#[async_trait]
impl AuditRunner for CommandAuditRunner {
    async fn run_full_audit(&self, root: &Path) -> anyhow::Result<Vec<AuditFinding>> {
        let (program, args) = self.argv(root)?;
        tracing::debug!(
            target: "admission.canary",
            program = %program,
            args = ?args,
            "running audit"
        );

        let output = tokio::process::Command::new(&program)
            .args(&args)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The verdict engine aborts this future on timeout; the child must not outlive it.
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn audit command '{program}'"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        match parse_findings(&stdout) {
            Ok(findings) if output.status.success() || !findings.is_empty() => Ok(findings),
            Ok(_) => bail!(
                "audit command exited with {} and reported no findings: {}",
                output.status,
                stderr.trim()
            ),
            Err(e) => Err(e.context(format!(
                "audit command exited with {}: {}",
                output.status,
                stderr.trim()
            ))),
        }
    }
}
