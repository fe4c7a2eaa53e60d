//! ssidkv partition server binary.
//!
//! Creates one partition with a fixed row layout and serves it over a Unix
//! domain socket.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ssidkv_core::config::ProtocolConfig;
use ssidkv_core::scheduler::PartitionScheduler;
use ssidkv_core::types::{PartitionId, Value};
use ssidkv_server::PartitionServer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ssidkv-server", version)]
struct Cli {
    /// Partition id served by this process.
    #[arg(short, long, default_value_t = 0)]
    partition: PartitionId,

    /// Unix socket path (default: ~/.local/share/ssidkv/partition-<id>.sock).
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Rows to load, keyed 0..rows.
    #[arg(long, default_value_t = 1024)]
    rows: u64,

    /// Columns per row.
    #[arg(long, default_value_t = 8)]
    columns: usize,

    /// Protocol config file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn default_socket(partition: PartitionId) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ssidkv")
        .join(format!("partition-{partition}.sock"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ProtocolConfig::load(path)?,
        None => ProtocolConfig::default(),
    };
    let socket_path = cli.socket.unwrap_or_else(|| default_socket(cli.partition));

    // Ensure parent directories exist.
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let scheduler = PartitionScheduler::new(cli.partition, &config);
    for key in 0..cli.rows {
        scheduler.load_row(key, vec![Value::Int(0); cli.columns]);
    }
    info!(
        partition = cli.partition,
        rows = cli.rows,
        columns = cli.columns,
        socket = %socket_path.display(),
        "starting"
    );

    let server = PartitionServer::new(Arc::new(scheduler), socket_path);
    server.run().await?;

    Ok(())
}
