use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::app_state::AppState;
use crate::audit::verify_chain;
use crate::catalog::ImportOutcome;
use crate::config::AvsigConfig;
use crate::keys::{generate_signing_key, save_key_file, KeyProvider, StaticKeyProvider};

/// Operator CLI for the signature catalog
#[derive(Parser, Debug)]
#[command(name = "avsig", version, about = "Signed signature-catalog tooling")]
pub struct Cli {
    /// Configuration file (defaults to $AVSIG_CONFIG, then avsig.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a new manifest signing key
    Keygen {
        #[arg(short, long, default_value = "keys/manifest_signing_key.json")]
        output: PathBuf,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Seed an empty catalog from a JSON array of records
    Import {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long, default_value = "bootstrap")]
        actor: String,
    },

    /// Re-sign every stored record with the current key
    Resign,

    /// Print the signed manifest header as JSON
    Header,

    /// Print the manifest document (header and active records) as JSON
    Manifest,

    /// Write the multipart distribution bundle
    Bundle {
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the verifying key as PEM
    Cert,

    /// Re-verify all stored signatures
    Sweep {
        /// Keep running on the configured interval until Ctrl-C
        #[arg(long)]
        watch: bool,
    },

    /// Check the hash chain of the audit log
    AuditVerify {
        /// Audit file (defaults to the configured audit_log_path)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Print the effective configuration with secrets masked
    Config,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AvsigConfig> {
    AvsigConfig::load(path).context("failed to load configuration")
}

fn open_state(path: Option<&Path>) -> anyhow::Result<AppState> {
    AppState::open(load_config(path)?).context("failed to initialize")
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Keygen { output, force } => {
            if output.exists() && !force {
                bail!("{} already exists; pass --force to replace it", output.display());
            }
            let key = generate_signing_key();
            save_key_file(&key, &output, "manifest signing")
                .with_context(|| format!("cannot write {}", output.display()))?;
            let cert = StaticKeyProvider::new(key).load_public_certificate()?;
            println!("Wrote {}", output.display());
            println!("Fingerprint: {}", cert.fingerprint());
        }

        Commands::Import { file, actor } => {
            let state = open_state(config_path)?;
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            match state.catalog.import_bootstrap(&json, &actor)? {
                ImportOutcome::Imported(n) => println!("Imported {n} signatures"),
                ImportOutcome::Skipped { existing } => {
                    println!("Catalog already holds {existing} signatures; import skipped")
                }
            }
        }

        Commands::Resign => {
            let state = open_state(config_path)?;
            let count = state.catalog.resign_all()?;
            println!("Re-signed {count} signatures");
        }

        Commands::Header => {
            let state = open_state(config_path)?;
            let doc = state.manifest.build_document(&state.catalog)?;
            println!("{}", serde_json::to_string_pretty(&doc.header)?);
        }

        Commands::Manifest => {
            let state = open_state(config_path)?;
            let doc = state.manifest.build_document(&state.catalog)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }

        Commands::Bundle { output } => {
            let state = open_state(config_path)?;
            let bundle = state.manifest.build_bundle(&state.catalog)?;
            std::fs::write(&output, &bundle.body)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!("Content-Type: {}", bundle.content_type());
            println!("Wrote {} bytes to {}", bundle.body.len(), output.display());
        }

        Commands::Cert => {
            let state = open_state(config_path)?;
            print!("{}", state.manifest.certificate_pem()?);
        }

        Commands::Sweep { watch } => {
            let state = open_state(config_path)?;
            if watch {
                let period = Duration::from_secs(state.config.sweep.interval_secs);
                tracing::info!(interval_secs = period.as_secs(), "Starting periodic sweep");
                let shutdown = async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Cannot listen for Ctrl-C");
                    }
                };
                state.sweep.clone().run_every(period, shutdown).await;
            } else {
                match state.sweep.run_sweep_once()? {
                    Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                    None => println!("A sweep is already running"),
                }
            }
        }

        Commands::AuditVerify { path } => {
            let path = match path {
                Some(p) => p,
                None => load_config(config_path)?.audit_log_path,
            };
            let report = verify_chain(&path)?;
            match report.first_broken_line {
                None => println!("Audit chain intact: {} entries", report.entries),
                Some(line) => bail!(
                    "audit chain broken at line {line} ({} entries verified before it)",
                    report.entries
                ),
            }
        }

        Commands::Config => {
            let config = load_config(config_path)?;
            print!("{}", config.to_redacted_toml()?);
        }
    }

    Ok(())
}
