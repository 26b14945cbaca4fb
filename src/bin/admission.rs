//! admission - operator CLI for the change admission pipeline
//!
//! Usage: admission [--config <path>] [--repo <path>] <command>

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use admission_core::ledger::{
    generate_signing_key, parse_signing_key, signing_key_to_pem, verifying_key_to_pem,
};
use admission_core::{AdmissionError, ProposalAction, ProposalKind};
use admission_gate::{
    AdmissionConfig, AdmissionOrchestrator, PendingStatus, ProposalDraft,
};

#[derive(Parser)]
#[command(name = "admission")]
#[command(about = "Gate source changes behind signatures and a canary trial")]
struct Cli {
    /// Configuration file (defaults to <repo>/admission.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository root
    #[arg(long, global = true, env = "ADMISSION_REPO_ROOT")]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Create,
    Edit,
    Replace,
}

impl From<ActionArg> for ProposalAction {
    fn from(value: ActionArg) -> Self {
        match value {
            ActionArg::Create => ProposalAction::Create,
            ActionArg::Edit => ProposalAction::Edit,
            ActionArg::Replace => ProposalAction::Replace,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show pending proposals and their signature progress
    List,

    /// Sign a pending proposal
    Sign {
        id: String,
        /// Approver identity (prompted when omitted)
        #[arg(long)]
        identity: Option<String>,
        /// PKCS#8 PEM private key (or a raw 32-byte seed in hex/base64)
        #[arg(long)]
        key: PathBuf,
    },

    /// Run a pending proposal through admission (exit 0 only when accepted)
    Approve { id: String },

    /// Queue a new single-file proposal
    Propose {
        #[arg(long)]
        id: String,
        /// Repository-relative path the proposal writes
        #[arg(long)]
        target: String,
        #[arg(long, value_enum)]
        action: ActionArg,
        /// File whose content becomes the proposed content
        #[arg(long)]
        content_file: PathBuf,
        #[arg(long)]
        justification: Option<String>,
        /// Mark as a constitutional amendment (critical quorum tier)
        #[arg(long)]
        amendment: bool,
    },

    /// Restore the live tree from an archived rollback record
    Rollback { record: PathBuf },

    /// Generate an Ed25519 key pair for an approver
    Keygen {
        /// Writes <prefix>.pem (private) and <prefix>.pub.pem (public)
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,admission_gate=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "ERROR:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if let Command::Keygen { out } = &cli.command {
        keygen(out)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = AdmissionConfig::load(cli.config.as_deref(), cli.repo.clone())?;
    let orchestrator = AdmissionOrchestrator::from_config(config).await?;

    match cli.command {
        Command::List => list(&orchestrator).await,
        Command::Sign { id, identity, key } => sign(&orchestrator, &id, identity, &key).await,
        Command::Approve { id } => approve(&orchestrator, &id).await,
        Command::Propose {
            id,
            target,
            action,
            content_file,
            justification,
            amendment,
        } => {
            let content = std::fs::read_to_string(&content_file)
                .with_context(|| format!("Failed to read {}", content_file.display()))?;
            let proposal = orchestrator
                .propose(ProposalDraft {
                    id,
                    target_path: target,
                    action: action.into(),
                    justification,
                    content,
                    kind: if amendment {
                        ProposalKind::ConstitutionalAmendment
                    } else {
                        ProposalKind::Standard
                    },
                })
                .await
                .map_err(explain)?;
            println!(
                "{} {} ({} {})",
                "Queued".green().bold(),
                proposal.id,
                proposal.action.as_str(),
                proposal.target_path
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Rollback { record } => {
            let files = orchestrator.rollback(&record).await?;
            println!("{} {files} file(s) restored", "Rolled back:".green().bold());
            Ok(ExitCode::SUCCESS)
        }
        Command::Keygen { .. } => Ok(ExitCode::SUCCESS),
    }
}

async fn list(orchestrator: &AdmissionOrchestrator) -> Result<ExitCode> {
    let pending = orchestrator.list().await?;
    if pending.is_empty() {
        println!("No pending proposals.");
        return Ok(ExitCode::SUCCESS);
    }
    for summary in pending {
        match summary.status {
            PendingStatus::Ready {
                flavor,
                gate,
                valid,
                required,
                met,
                stale,
                invalid,
                unknown_identity,
            } => {
                let progress = format!("{valid}/{required}");
                let progress = if met { progress.green() } else { progress.yellow() };
                println!(
                    "{:<32} {:<6} {:<12} {} valid  (stale {stale}, invalid {invalid}, unknown {unknown_identity})",
                    summary.id.cyan(),
                    flavor.as_str(),
                    gate,
                    progress
                );
            }
            PendingStatus::Blocked { findings } => {
                println!("{:<32} {}", summary.id.cyan(), "blocked".red());
                for finding in findings {
                    println!("    {finding}");
                }
            }
            PendingStatus::Unreadable { error } => {
                println!("{:<32} {} {error}", summary.id.cyan(), "unreadable".red());
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn sign(
    orchestrator: &AdmissionOrchestrator,
    id: &str,
    identity: Option<String>,
    key_path: &Path,
) -> Result<ExitCode> {
    let identity = match identity {
        Some(identity) => identity,
        None => prompt("Identity: ")?,
    };
    let raw = std::fs::read_to_string(key_path)
        .with_context(|| format!("Failed to read {}", key_path.display()))?;
    let key = parse_signing_key(&raw)?;
    let signature = orchestrator
        .sign(id, &key, &identity)
        .await
        .map_err(explain)?;
    println!(
        "{} {id} as {} ({})",
        "Signed".green().bold(),
        signature.identity,
        signature.token
    );
    Ok(ExitCode::SUCCESS)
}

async fn approve(orchestrator: &AdmissionOrchestrator, id: &str) -> Result<ExitCode> {
    match orchestrator.approve(id).await {
        Ok(outcome) if outcome.is_accepted() => {
            println!("{} {id}", "ACCEPTED".green().bold());
            if let Some(record) = &outcome.record.details.rollback_record {
                println!("  rollback record: {record}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Ok(outcome) => {
            println!("{} {id}", "REJECTED".red().bold());
            for reason in &outcome.record.details.reasons {
                println!("  {reason}");
            }
            println!("  result: {}", outcome.location);
            Ok(ExitCode::FAILURE)
        }
        Err(AdmissionError::QuorumNotMet {
            path,
            valid,
            required,
        }) => {
            println!(
                "{} {id}: {valid} of {required} valid signature(s) for {path}; still pending",
                "QUORUM NOT MET".yellow().bold()
            );
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(explain(e)),
    }
}

fn keygen(prefix: &Path) -> Result<()> {
    let key = generate_signing_key();
    let private_pem = signing_key_to_pem(&key)?;
    let public_pem = verifying_key_to_pem(&key.verifying_key())?;

    let private_path = with_suffix(prefix, ".pem");
    let public_path = with_suffix(prefix, ".pub.pem");
    if private_path.exists() {
        bail!("{} already exists", private_path.display());
    }
    write_private(&private_path, &private_pem)?;
    std::fs::write(&public_path, &public_pem)
        .with_context(|| format!("Failed to write {}", public_path.display()))?;

    println!("{} {}", "Private key:".cyan(), private_path.display());
    println!("{} {}", "Public key:".cyan(), public_path.display());
    println!("\nRegistry entry:\n  - identity: <name>\n    public_key_pem: |");
    for line in public_pem.lines() {
        println!("      {line}");
    }
    Ok(())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn write_private(path: &Path, pem: &str) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(pem.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, pem: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(pem.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{label}");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("no identity given");
    }
    Ok(value)
}

/// Structural findings are listed one per line.
fn explain(e: AdmissionError) -> anyhow::Error {
    match &e {
        AdmissionError::Structural(findings) => {
            let lines: Vec<String> = findings.iter().map(|f| format!("  {f}")).collect();
            anyhow::anyhow!("{e}\n{}", lines.join("\n"))
        }
        _ => e.into(),
    }
}
