//! Thin CLI bootstrap: validate a config or run a site receiver.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sitesync::{SiteReceiver, SiteReceiverConfig, SyncConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sitesync", version, about = "Multi-site filesystem replication")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = "sitesync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the receiver for a configured site until interrupted.
    Serve {
        /// Site name from the `[receivers]` table.
        site: String,
    },
    /// Load and validate the configuration.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Serve { site } => {
            let Some(endpoint) = config.receivers.get(&site) else {
                bail!("no receiver configured for site `{site}`");
            };
            let receiver = SiteReceiver::new(SiteReceiverConfig::new(
                endpoint.upload_root.clone(),
                endpoint.max_payload_size,
            ));
            let running = receiver.bind(&endpoint.bind_addr()).await?;
            tracing::info!(site = %site, addr = %running.local_addr(), "serving");
            tokio::signal::ctrl_c().await?;
            running.shutdown();
        }
        Command::Check => {
            println!(
                "ok: {} watch dir(s), {} receiver(s), {} transmitter(s), broker {}:{}",
                config.watch_dirs.len(),
                config.receivers.len(),
                config.transmitters.len(),
                config.broker.host,
                config.broker.port,
            );
        }
    }

    Ok(())
}
