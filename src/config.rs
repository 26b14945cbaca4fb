//! Admission configuration.
//!
//! Loaded from an optional YAML file (`admission.yaml` at the repository root by
//! default), then overridden by environment variables (`.env` is honoured via
//! `dotenvy` in the binary). Relative paths resolve against `repo_root`; every
//! state path defaults to somewhere under `state_dir`.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use admission_core::manifest::StructuralRules;
use admission_core::verdict::ThresholdConfig;
use admission_core::Severity;

pub const DEFAULT_CONFIG_FILE: &str = "admission.yaml";
pub const DEFAULT_STATE_DIR: &str = ".admission";

pub const ENV_REPO_ROOT: &str = "ADMISSION_REPO_ROOT";
pub const ENV_GATING: &str = "ADMISSION_GATING";
pub const ENV_CANARY_ENABLED: &str = "ADMISSION_CANARY_ENABLED";

/// How a proposal flavor is gated before the canary trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    Signatures,
    PolicyOnly,
}

impl GateMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signatures" => Some(Self::Signatures),
            "policy_only" | "policy-only" => Some(Self::PolicyOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatingConfig {
    #[serde(default = "default_proposal_gate")]
    pub proposals: GateMode,
    #[serde(default = "default_crate_gate")]
    pub crates: GateMode,
}

fn default_proposal_gate() -> GateMode {
    GateMode::Signatures
}

fn default_crate_gate() -> GateMode {
    GateMode::PolicyOnly
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            proposals: default_proposal_gate(),
            crates: default_crate_gate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tolerances")]
    pub tolerances: BTreeMap<Severity, u64>,
    #[serde(default = "default_audit_timeout")]
    pub audit_timeout_secs: u64,
    #[serde(default = "default_copy_timeout")]
    pub copy_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_tolerances() -> BTreeMap<Severity, u64> {
    ThresholdConfig::default().tolerances
}

fn default_audit_timeout() -> u64 {
    admission_core::verdict::DEFAULT_AUDIT_TIMEOUT_SECS
}

fn default_copy_timeout() -> u64 {
    120
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerances: default_tolerances(),
            audit_timeout_secs: default_audit_timeout(),
            copy_timeout_secs: default_copy_timeout(),
        }
    }
}

impl CanaryConfig {
    pub fn thresholds(&self) -> ThresholdConfig {
        ThresholdConfig {
            enabled: self.enabled,
            tolerances: self.tolerances.clone(),
            audit_timeout_secs: self.audit_timeout_secs,
        }
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }
}

pub fn default_sandbox_excludes() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        "target",
        "node_modules",
        "__pycache__",
        ".pytest_cache",
        ".mypy_cache",
        ".ruff_cache",
        ".venv",
        ".cache",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// `admission.yaml` as written by operators. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfigFile {
    pub repo_root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub pending_dir: Option<PathBuf>,
    pub processed_dir: Option<PathBuf>,
    pub rollback_dir: Option<PathBuf>,
    pub sandbox_dir: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
    pub approvers: Option<PathBuf>,
    #[serde(default)]
    pub gating: GatingConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default)]
    pub audit_command: Vec<String>,
    pub sandbox_excludes: Option<Vec<String>>,
}

/// Fully resolved configuration injected into the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
    pub pending_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub rollback_dir: PathBuf,
    pub sandbox_dir: PathBuf,
    pub audit_log: PathBuf,
    pub approvers: PathBuf,
    pub gating: GatingConfig,
    pub canary: CanaryConfig,
    /// `[program, args...]`; `{root}` is replaced with the sandbox path.
    pub audit_command: Vec<String>,
    pub sandbox_excludes: Vec<String>,
}

impl AdmissionConfig {
    /// Defaults for a repository, everything under `<repo_root>/.admission`.
    pub fn for_repo(repo_root: impl Into<PathBuf>) -> Self {
        Self::resolve(repo_root.into(), AdmissionConfigFile::default())
    }

    /// Resolve a parsed file against a repository root.
    pub fn resolve(repo_root: PathBuf, file: AdmissionConfigFile) -> Self {
        let state_dir = file
            .state_dir
            .map(|p| absolutize(&repo_root, p))
            .unwrap_or_else(|| repo_root.join(DEFAULT_STATE_DIR));
        let under_state = |value: Option<PathBuf>, default: &str| {
            value
                .map(|p| absolutize(&repo_root, p))
                .unwrap_or_else(|| state_dir.join(default))
        };

        Self {
            pending_dir: under_state(file.pending_dir, "pending"),
            processed_dir: under_state(file.processed_dir, "processed"),
            rollback_dir: under_state(file.rollback_dir, "rollbacks"),
            sandbox_dir: under_state(file.sandbox_dir, "sandboxes"),
            audit_log: under_state(file.audit_log, "audit.jsonl"),
            approvers: under_state(file.approvers, "approvers.yaml"),
            gating: file.gating,
            canary: file.canary,
            audit_command: file.audit_command,
            sandbox_excludes: file.sandbox_excludes.unwrap_or_else(default_sandbox_excludes),
            state_dir,
            repo_root,
        }
    }

    /// Load configuration for the CLI.
    ///
    /// Repository root precedence: `repo_override`, `ADMISSION_REPO_ROOT`, the
    /// config file's `repo_root`, the current directory.
    pub fn load(config_path: Option<&Path>, repo_override: Option<PathBuf>) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let cwd = std::env::current_dir().context("Failed to read current directory")?;

        let early_root = repo_override
            .clone()
            .or_else(|| env(ENV_REPO_ROOT).map(PathBuf::from));

        let file_path = match config_path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let candidate = early_root.as_deref().unwrap_or(&cwd).join(DEFAULT_CONFIG_FILE);
                candidate.exists().then_some(candidate)
            }
        };

        let file = match &file_path {
            Some(path) => {
                tracing::info!("Loading admission configuration from {}", path.display());
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_yaml::from_str::<AdmissionConfigFile>(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => AdmissionConfigFile::default(),
        };

        let repo_root = early_root
            .or_else(|| file.repo_root.clone())
            .unwrap_or(cwd);
        let repo_root = if repo_root.is_absolute() {
            repo_root
        } else {
            std::env::current_dir()
                .context("Failed to read current directory")?
                .join(repo_root)
        };

        let mut config = Self::resolve(repo_root, file);
        config.apply_env_overrides(env)?;
        Ok(config)
    }

    /// Apply `ADMISSION_GATING` / `ADMISSION_CANARY_ENABLED`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_GATING) {
            let mode = GateMode::parse(&raw)
                .ok_or_else(|| anyhow!("{ENV_GATING}='{raw}' is not signatures or policy_only"))?;
            self.gating = GatingConfig {
                proposals: mode,
                crates: mode,
            };
        }
        if let Some(raw) = lookup(ENV_CANARY_ENABLED) {
            self.canary.enabled = parse_bool(&raw)
                .ok_or_else(|| anyhow!("{ENV_CANARY_ENABLED}='{raw}' is not a boolean"))?;
        }
        Ok(())
    }

    /// Protected directories: VCS metadata plus the state directory when it lives
    /// inside the repository.
    pub fn structural_rules(&self) -> StructuralRules {
        let mut rules = StructuralRules::default();
        if let Ok(relative) = self.state_dir.strip_prefix(&self.repo_root) {
            if let Some(Component::Normal(first)) = relative.components().next() {
                let name = first.to_string_lossy().into_owned();
                if !rules.protected_dirs.contains(&name) {
                    rules.protected_dirs.push(name);
                }
            }
        }
        rules
    }
}

fn absolutize(repo_root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        repo_root.join(path)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
