// Copyright (c) 2024 The Botho Foundation

//! Hub Bridge Service
//!
//! Moves assets between Zilliqa and Ethereum through the TradeHub custody
//! chain.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hub_bridge_core::{BridgeConfig, TransferDirection, TransferRequest, TransferStatus};
use hub_bridge_service::{
    adapter::AdapterSet, db::Database, engine::BridgeEngine, TransferCoordinator,
    TransferObserver,
};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

/// Hub Bridge Service - bridge assets between Zilliqa and Ethereum
#[derive(Parser, Debug)]
#[command(name = "hub-bridge")]
#[command(about = "Transfer coordinator for ZIL <-> ETH bridging via TradeHub")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "HUB_BRIDGE_CONFIG", default_value = "bridge.toml")]
    config: PathBuf,

    /// Override the database path from the configuration
    #[arg(long, env = "HUB_BRIDGE_DB")]
    db: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge service (default)
    Run,

    /// Run database migrations only
    Migrate,

    /// Create a transfer
    Create {
        /// zil-to-eth or eth-to-zil
        #[arg(long)]
        direction: TransferDirection,

        /// Asset symbol
        #[arg(long)]
        asset: String,

        /// Amount in base units
        #[arg(long)]
        amount: u128,

        /// Sender address on the source chain
        #[arg(long)]
        sender: String,

        /// Recipient address on the destination chain
        #[arg(long)]
        recipient: String,
    },

    /// Broadcast the deposit of a created transfer
    Submit { id: Uuid },

    /// Show a transfer
    Status { id: Uuid },

    /// Cancel a transfer that has not attempted its deposit
    Cancel { id: Uuid },

    /// List transfers that have not finished
    List {
        /// Only transfers in this status, including terminal ones
        #[arg(long)]
        status: Option<TransferStatus>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration
    let config_path = args.config.to_string_lossy();
    let mut config = if args.config.exists() {
        info!("Loading configuration from {}", config_path);
        BridgeConfig::from_file(&config_path)?
    } else {
        info!("Using default configuration");
        BridgeConfig::default()
    };
    if let Some(db_path) = args.db {
        config.bridge.db_path = db_path;
    }

    // Initialize database
    info!("Initializing database at {}", config.bridge.db_path);
    let db = Database::open(&config.bridge.db_path)?;
    db.migrate()?;

    let adapters = AdapterSet::from_config(&config)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("Hub bridge service starting...");
            info!("Bridge configuration:");
            info!("  ZIL RPC: {}", config.zilliqa.rpc_url);
            info!("  ETH RPC: {}", config.ethereum.rpc_url);
            info!("  SWTH RPC: {}", config.tradehub.rpc_url);
            info!("  Custody: {}", config.relay.custody_address);
            info!("  Fee: {} bps", config.bridge.fee_bps);

            BridgeEngine::new(config, db, adapters).run().await?;
        }
        Command::Migrate => {
            info!("Database migration complete");
        }
        Command::Create {
            direction,
            asset,
            amount,
            sender,
            recipient,
        } => {
            let coordinator = coordinator(config, db, adapters);
            let record = coordinator
                .create_transfer(TransferRequest {
                    direction,
                    asset,
                    amount,
                    sender,
                    recipient,
                })
                .await?;
            print_json(&record)?;
        }
        Command::Submit { id } => {
            let coordinator = coordinator(config, db, adapters);
            let record = coordinator
                .submit_deposit(id)
                .await
                .with_context(|| format!("Failed to submit deposit for {}", id))?;
            print_json(&record)?;
        }
        Command::Status { id } => {
            let record = coordinator(config, db, adapters).get_status(id)?;
            print_json(&record)?;
        }
        Command::Cancel { id } => {
            let record = coordinator(config, db, adapters).cancel(id).await?;
            print_json(&record)?;
        }
        Command::List { status } => {
            let records = match status {
                Some(status) => db.get_transfers_by_status(status)?,
                None => db.list_non_terminal()?,
            };
            print_json(&records)?;
        }
    }

    Ok(())
}

/// A coordinator for one-shot commands. Nothing polls the legs it
/// broadcasts; a running service picks them up on its next sweep.
fn coordinator(config: BridgeConfig, db: Database, adapters: AdapterSet) -> TransferCoordinator {
    let (watch_tx, _) = mpsc::unbounded_channel();
    TransferCoordinator::new(config, db, adapters, TransferObserver::default(), watch_tx)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
