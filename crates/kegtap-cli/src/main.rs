use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use kegtap_cli::{Core, CoreConfig};
use kegtap_core::backend::mock::MockBackend;
use kegtap_core::constants::{DEFAULT_BAUD_RATE, DEFAULT_MIN_FIRMWARE_VERSION};
use kegtap_flow::FlowConfig;
use kegtap_hardware::{ManagerConfig, NetworkConfig, SerialConfig};
use kegtap_storage::{Database, DatabaseConfig, PendingRecordRepository, SqlitePendingRecordRepository};
use kegtap_sync::SyncConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Kegerator controller daemon.
#[derive(Parser, Debug)]
#[command(name = "kegtap", version, about = "Flow meters, relays and pour sync for kegboards")]
struct Cli {
    /// Path of the pending-record database
    #[arg(long, global = true, env = "KEGTAP_DB", default_value = "kegtap.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run hardware, flow tracking and sync until Ctrl-C
    Run(RunArgs),
    /// Show what is waiting in the pending-record queue
    Queue {
        /// How many of the oldest rows to print
        #[arg(long, default_value = "10")]
        limit: i64,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Use the in-memory backend instead of a remote server
    #[arg(long)]
    offline: bool,

    /// Serial port to open even if enumeration misses it
    #[arg(long = "serial-port", env = "KEGTAP_SERIAL_PORTS", value_delimiter = ',')]
    serial_ports: Vec<String>,

    /// Disable USB-serial controllers
    #[arg(long)]
    no_serial: bool,

    #[arg(long, env = "KEGTAP_BAUD_RATE", default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,

    /// host:port of a network controller
    #[arg(long = "network", env = "KEGTAP_NETWORK", value_delimiter = ',')]
    network: Vec<String>,

    /// Oldest firmware version treated as usable
    #[arg(long, env = "KEGTAP_MIN_FIRMWARE", default_value_t = DEFAULT_MIN_FIRMWARE_VERSION)]
    min_firmware: u16,

    /// Seconds without meter activity before a pour ends (0 disables)
    #[arg(long, env = "KEGTAP_MAX_IDLE_SECS")]
    max_idle_secs: Option<u64>,

    /// Seconds between backend syncs
    #[arg(long, env = "KEGTAP_SYNC_INTERVAL_SECS")]
    sync_interval_secs: Option<u64>,
}

impl RunArgs {
    fn core_config(&self, database: DatabaseConfig) -> CoreConfig {
        let serial = (!self.no_serial).then(|| {
            self.serial_ports
                .iter()
                .fold(SerialConfig::default().with_baud_rate(self.baud_rate), |config, port| {
                    config.with_port(port)
                })
        });
        let network = (!self.network.is_empty()).then(|| {
            self.network
                .iter()
                .fold(NetworkConfig::default(), |config, address| config.with_address(address))
        });

        let mut flow = FlowConfig::default();
        if let Some(secs) = self.max_idle_secs {
            flow = flow.with_max_idle(Duration::from_secs(secs));
        }
        let mut sync = SyncConfig::default();
        if let Some(secs) = self.sync_interval_secs {
            sync = sync.with_sync_interval(Duration::from_secs(secs));
        }

        CoreConfig::default()
            .with_database(database)
            .with_serial(serial)
            .with_network(network)
            .with_manager(ManagerConfig::default().with_min_firmware_version(self.min_firmware))
            .with_flow(flow)
            .with_sync(sync)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kegtap=debug")),
        )
        .init();

    let cli = Cli::parse();
    let database = DatabaseConfig::new(&cli.db);

    match cli.command {
        Command::Run(args) => run(args, database).await,
        Command::Queue { limit } => show_queue(database, limit).await,
    }
}

async fn run(args: RunArgs, database: DatabaseConfig) -> Result<()> {
    if !args.offline {
        bail!("this build has no remote backend client; pass --offline to use the in-memory backend");
    }
    if args.no_serial && args.network.is_empty() {
        warn!("No controller transport enabled");
    }

    let config = args.core_config(database);
    let core = Core::new(config, Arc::new(MockBackend::new()))
        .await
        .context("failed to open the pending-record database")?;

    let mut events = core.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(kind = event.kind(), "Event");
        }
    });

    core.start().await;
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutting down");
    core.stop().await;
    logger.abort();
    Ok(())
}

async fn show_queue(config: DatabaseConfig, limit: i64) -> Result<()> {
    let database = Database::new(config.create_if_missing(false))
        .await
        .context("failed to open the pending-record database")?;
    let repository = SqlitePendingRecordRepository::new(database.pool().clone());

    let depth = repository.count().await?;
    println!("{depth} pending record(s)");
    for row in repository.list(limit).await? {
        println!("#{:<6} {:<7} {}", row.id, row.record_type, row.created_at.to_rfc3339());
    }
    database.close().await;
    Ok(())
}
