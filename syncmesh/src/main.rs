//! Syncmesh node binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use syncmesh::config::NodeConfig;
use syncmesh::logbuf::{BufferLayer, LogBuffer};
use syncmesh::node::Node;
use syncmesh::ws;

#[derive(Debug, Parser)]
#[command(name = "syncmesh", about = "Replicated collaboration backend node")]
struct Cli {
    /// Configuration file (TOML); missing file means defaults.
    #[arg(long, default_value = "syncmesh.toml")]
    config: PathBuf,

    /// Override storage.db_path.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override p2p.port.
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. "info" or "syncmesh=debug,lib_network=trace".
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logs = LogBuffer::new(4_096);
    init_tracing(&cli, Arc::clone(&logs));

    let mut config = NodeConfig::load(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.db_path = data_dir;
    }
    if let Some(port) = cli.port {
        config.p2p.port = port;
    }
    config.validate()?;

    let node = Node::build(config, logs).await?;
    node.start().await?;

    // The WebSocket server runs until the process is told to stop
    let ws_node = Arc::clone(&node);
    let ws_task = tokio::spawn(async move {
        if let Err(e) = ws::serve(ws_node).await {
            tracing::error!(error = %e, "websocket server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");

    node.shutdown().await;
    ws_task.abort();
    Ok(())
}

fn init_tracing(cli: &Cli, logs: Arc<LogBuffer>) {
    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(BufferLayer::new(logs));

    if cli.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
