//! Riven CLI
//!
//! Operates directly on a vault directory. Every command prints JSON on stdout and exits with
//! `0` on success, `1` for malformed input, `2` when policy refuses, `3` when a trust check
//! failed (the vault has already been wiped) and `4` when storage is unavailable.

use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use riven_core::{DeviceId, MirrorConfig, Result, TokenLabel, TrustError};
use riven_plane::{DeviceFingerprint, HostFingerprint, KernelConfig, TrustKernel};

/// Cal Riven trust kernel CLI
#[derive(Parser)]
#[command(name = "riven")]
#[command(about = "Device-bound trust vault", long_about = None)]
#[command(version)]
struct Cli {
    /// Vault directory
    #[arg(long, env = "RIVEN_VAULT_DIR")]
    vault: PathBuf,

    /// Log level, logs go to stderr
    #[arg(long, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind the vault to this device and create the genesis identity
    Provision,

    /// Show the vault state
    Status,

    /// Ask whether an identity may spawn mirrors
    BlessCheck { identity: DeviceId },

    /// Show the blessing of an identity
    Blessing { identity: DeviceId },

    /// Bless an identity on behalf of an ancestor
    Grant {
        target: DeviceId,
        #[arg(long)]
        authority: DeviceId,
        /// Do not allow the target to spawn
        #[arg(long)]
        no_propagate: bool,
    },

    /// Append a JSON payload to the reflection log
    Reflect { payload: String },

    /// Spawn a mirror
    Spawn {
        /// Parent identity, the genesis vault if omitted
        #[arg(long)]
        parent: Option<DeviceId>,
        /// Idempotency key
        #[arg(long)]
        key: String,
        #[arg(long)]
        label: Option<String>,
        /// Ask for a child that cannot spawn
        #[arg(long)]
        no_propagate: bool,
    },

    /// Issue or verify trust tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Show the latest pairing of a device
    Pairing { device: DeviceId },

    /// Give a paired device an identity in the chain
    Enroll {
        device: DeviceId,
        #[arg(long)]
        authority: DeviceId,
    },

    /// Print the reflection log
    Replay {
        /// Only entries written by this device
        #[arg(long)]
        device: Option<DeviceId>,
    },

    /// Revoke an identity and its descendants
    Revoke {
        target: DeviceId,
        #[arg(long)]
        authority: DeviceId,
    },

    /// Remove a mirror subtree
    Prune {
        mirror: DeviceId,
        #[arg(long)]
        authority: DeviceId,
    },

    /// Hand the vault off to a paired device
    Rebind {
        /// Paired device that receives the vault
        target: DeviceId,
        #[arg(long)]
        authority: DeviceId,
    },

    /// Show a mirror's lineage and direct children
    Lineage { id: DeviceId },

    /// Print the signature file, base64 encoded
    Signature,
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue a token for this device
    Issue {
        #[arg(long, default_value = "genesis")]
        label: TokenLabel,
    },

    /// Verify a token presented by a device
    Verify {
        token: String,
        /// Presenting device, this host if omitted
        #[arg(long)]
        device: Option<DeviceId>,
    },
}

async fn run(kernel: &TrustKernel, command: Commands) -> Result<Value> {
    let output = match command {
        Commands::Provision => serde_json::to_value(kernel.provision().await?)?,
        Commands::Status => serde_json::to_value(kernel.status().await?)?,
        Commands::BlessCheck { identity } => {
            match kernel.request_blessing_check(&identity).await? {
                riven_core::PropagationDecision::Allow => json!({ "decision": "allow" }),
                riven_core::PropagationDecision::Deny(reason) => {
                    return Err(TrustError::BlessingDenied(reason))
                }
            }
        }
        Commands::Blessing { identity } => {
            let blessing = kernel.blessing(&identity).await?;
            json!({ "blessing": blessing, "file": blessing.to_file() })
        }
        Commands::Grant {
            target,
            authority,
            no_propagate,
        } => serde_json::to_value(kernel.grant(&target, &authority, !no_propagate).await?)?,
        Commands::Reflect { payload } => {
            let body: Value = serde_json::from_str(&payload)?;
            let sequence = kernel.submit_reflection(body).await?;
            json!({ "accepted": true, "sequence": sequence })
        }
        Commands::Spawn {
            parent,
            key,
            label,
            no_propagate,
        } => {
            let config = MirrorConfig {
                label,
                propagate: !no_propagate,
            };
            serde_json::to_value(kernel.spawn_mirror_request(parent, &config, &key).await?)?
        }
        Commands::Token { command } => match command {
            TokenCommands::Issue { label } => serde_json::to_value(kernel.issue_token(label).await?)?,
            TokenCommands::Verify { token, device } => {
                let device = match device {
                    Some(device) => device,
                    None => HostFingerprint::new().device_id()?,
                };
                serde_json::to_value(kernel.verify_token(&token, device).await?)?
            }
        },
        Commands::Pairing { device } => serde_json::to_value(kernel.lookup_pairing(&device).await?)?,
        Commands::Enroll { device, authority } => {
            serde_json::to_value(kernel.enroll(device, &authority).await?)?
        }
        Commands::Replay { device } => {
            let mut cursor = kernel.replay(device).await?;
            let mut entries = Vec::new();
            while let Some((entry, payload)) = cursor.next().await? {
                entries.push(json!({
                    "sequence": entry.sequence,
                    "timestamp": entry.timestamp,
                    "device_id": entry.device_id,
                    "vault_sig_prefix": entry.vault_sig_prefix,
                    "payload": payload,
                }));
            }
            Value::Array(entries)
        }
        Commands::Revoke { target, authority } => {
            let revoked = kernel.revoke(&target, &authority).await?;
            json!({ "revoked": revoked })
        }
        Commands::Prune { mirror, authority } => {
            let removed = kernel.prune(&mirror, &authority).await?;
            json!({ "removed": removed })
        }
        Commands::Rebind { target, authority } => {
            serde_json::to_value(kernel.rebind(target, &authority).await?)?
        }
        Commands::Lineage { id } => {
            let lineage = kernel.lineage(&id).await?;
            let children = kernel.children(&id).await?;
            json!({ "lineage": lineage, "children": children })
        }
        Commands::Signature => {
            let signature = kernel.signature_file().await?;
            json!({ "signature": STANDARD.encode(signature) })
        }
    };
    Ok(output)
}

fn fail(err: &TrustError) -> ExitCode {
    let body = json!({ "error": err.to_string(), "kind": err.kind().as_str() });
    println!("{}", body);
    ExitCode::from(err.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let mut config = match KernelConfig::from_env() {
        Ok(config) => config,
        Err(e) => return fail(&TrustError::InvalidRequest(e.to_string())),
    };
    config.vault_dir = Some(cli.vault);

    let kernel = match TrustKernel::open_dir(config, Arc::new(HostFingerprint::new())) {
        Ok(kernel) => kernel,
        Err(e) => return fail(&e),
    };

    match run(&kernel, cli.command).await {
        Ok(output) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string())
            );
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}
