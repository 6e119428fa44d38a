//! EKS Gateway admin CLI.
//!
//! Usage:
//!   eks-admin --config gateway.toml verify-audit
//!   eks-admin --config gateway.toml export-audit --first 10 --last 20
//!   eks-admin --config gateway.toml prove-entry 14 --first 10 --last 20
//!   eks-admin --config gateway.toml recover
//!
//! The audit commands only read the journal and are safe next to a running
//! gateway. `recover` opens the data directory and is refused while a
//! gateway holds it; the running gateway sweeps on its own.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eks_gateway::hsm::software_hsm::generate_mnemonic;
use eks_gateway::audit::{read_journal, verify_entries, verify_inclusion};
use eks_gateway::storage::AUDIT_JOURNAL;
use eks_gateway::{logging, software_hsm, AuditEntry, AuditExport, Gateway, GatewayConfig, GatewayError, Result};

#[derive(Parser)]
#[command(name = "eks-admin")]
#[command(about = "External Key Store gateway administration")]
struct Cli {
    /// TOML configuration file; `EKS_*` environment variables override it
    #[arg(short, long, env = "EKS_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(short, long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the hash chain of the audit journal
    VerifyAudit,
    /// Print audit entries in a sequence range with their Merkle root
    ExportAudit {
        #[arg(long, default_value_t = 1)]
        first: u64,
        #[arg(long)]
        last: Option<u64>,
    },
    /// Print the Merkle inclusion proof of one entry within an exported range
    ProveEntry {
        sequence: u64,
        #[arg(long, default_value_t = 1)]
        first: u64,
        #[arg(long)]
        last: Option<u64>,
    },
    /// Re-drive orphaned requests and write missing audit entries
    Recover,
    /// Print a fresh mnemonic for the software HSM key store
    GenerateMnemonic,
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    match path {
        Some(path) => GatewayConfig::load_from_file(path),
        None => GatewayConfig::load(),
    }
}

fn read_audit(config: &GatewayConfig) -> Result<Vec<AuditEntry>> {
    let path = config
        .storage
        .journal_path(AUDIT_JOURNAL)
        .ok_or_else(|| GatewayError::configuration("storage.data_dir is not set"))?;
    read_journal(&path)
}

fn export_range(config: &GatewayConfig, first: u64, last: Option<u64>) -> Result<AuditExport> {
    let last = last.unwrap_or(u64::MAX);
    let entries = read_audit(config)?
        .into_iter()
        .filter(|e| e.sequence_number >= first && e.sequence_number <= last)
        .collect();
    let export = AuditExport::from_entries(entries);
    if !export.verify() {
        return Err(GatewayError::storage("exported range does not verify"));
    }
    Ok(export)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.json);

    match cli.command {
        Commands::VerifyAudit => {
            let config = load_config(cli.config.as_ref())?;
            let entries = read_audit(&config)?;
            verify_entries(&entries)?;
            let count = entries.len();
            let root = AuditExport::from_entries(entries).merkle_root;
            if cli.json {
                println!("{}", serde_json::json!({ "entries": count, "merkle_root": root }));
            } else {
                println!("Audit chain intact: {} entries, Merkle root {}", count, root);
            }
        }
        Commands::ExportAudit { first, last } => {
            let config = load_config(cli.config.as_ref())?;
            let export = export_range(&config, first, last)?;
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
        Commands::ProveEntry { sequence, first, last } => {
            let config = load_config(cli.config.as_ref())?;
            let export = export_range(&config, first, last)?;
            let (Some(entry), Some(proof)) = (
                export.entries.iter().find(|e| e.sequence_number == sequence),
                export.prove(sequence),
            ) else {
                return Err(GatewayError::malformed(format!("audit entry {} is not in the exported range", sequence)));
            };
            if !verify_inclusion(&export.merkle_root, entry, &proof) {
                return Err(GatewayError::storage(format!("proof for entry {} does not verify", sequence)));
            }
            let siblings: Vec<String> = proof.siblings.iter().map(hex::encode).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "merkle_root": export.merkle_root,
                    "entry": entry,
                    "leaf_index": proof.leaf_index,
                    "leaf_hash": hex::encode(proof.leaf_hash),
                    "siblings": siblings,
                }))?
            );
        }
        Commands::Recover => {
            let config = load_config(cli.config.as_ref())?;
            let hsm = software_hsm(&config)?;
            let gateway = Gateway::open(config, Arc::new(hsm)).await?;
            let report = gateway.recover_now().await?;
            if cli.json {
                println!("{}", serde_json::to_string(&report)?);
            } else if report.is_empty() {
                println!("Nothing to recover.");
            } else {
                println!(
                    "Re-driven: {}, audited: {}, failed: {}",
                    report.redriven.len(),
                    report.audited.len(),
                    report.failed.len()
                );
                for (request_id, reason) in &report.failed {
                    println!("  {}: {}", request_id, reason);
                }
            }
        }
        Commands::GenerateMnemonic => {
            println!("{}", generate_mnemonic()?);
        }
    }

    Ok(())
}
