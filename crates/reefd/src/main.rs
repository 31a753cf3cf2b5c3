//! `reefd`: the offload proxy daemon.
//!
//! Stands in for the external compute service. Channels attach to one of
//! the served endpoints over TCP and receive Reed-Solomon results computed
//! by the software engine.
//!
//! # Usage
//!
//! ```text
//! reefd serve                              # listen on 127.0.0.1:61616
//! reefd serve -c reefd.toml                # start with a config file
//! reefd serve -l 0.0.0.0:7000 -e 0000:01:00.1 -e 0000:01:00.2
//! reefd check-config -c client.toml        # print resolved offload.* keys
//! ```

mod config;
mod server;
mod telemetry;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reef_offload::{ConfigTable, OffloadConfig};
use tracing::info;

use config::DaemonConfig;
use server::ProxyServer;

#[derive(Parser)]
#[command(name = "reefd", version, about = "Reed-Solomon offload proxy daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "REEFD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept channel connections and answer offload requests.
    Serve {
        /// Override the listen address (e.g. "0.0.0.0:7000").
        #[arg(short = 'l', long)]
        listen_addr: Option<String>,

        /// Endpoint to answer for. Can be specified multiple times.
        #[arg(short, long)]
        endpoint: Vec<String>,
    },

    /// Resolve the `[offload]` client settings and print them.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen_addr,
            endpoint,
        } => {
            let mut config =
                DaemonConfig::load(cli.config.as_deref()).context("failed to load config")?;
            telemetry::init(&config.log);
            // CLI args override config file values.
            if let Some(addr) = listen_addr {
                config.server.listen_addr = addr;
            }
            if !endpoint.is_empty() {
                config.server.endpoints = endpoint;
            }
            cmd_serve(config).await
        }
        Commands::CheckConfig => cmd_check_config(cli.config),
    }
}

async fn cmd_serve(config: DaemonConfig) -> Result<()> {
    info!(
        listen_addr = %config.server.listen_addr,
        endpoints = config.server.endpoints.len(),
        "starting reefd"
    );
    let server = ProxyServer::bind(&config.server.listen_addr, config.server.endpoints).await?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(%e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
}

fn cmd_check_config(path: Option<PathBuf>) -> Result<()> {
    let table = match path.as_deref() {
        Some(p) => ConfigTable::load(p)
            .with_context(|| format!("failed to read {}", p.display()))?,
        None => ConfigTable::new(),
    };
    let offload = OffloadConfig::from_source(&table).context("invalid offload configuration")?;
    for (key, value) in config::describe_offload(&offload) {
        println!("{key} = {value}");
    }
    Ok(())
}
