use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use tessera_node::{Node, NodeConfig, ShutdownHandle};

#[derive(Parser)]
#[command(name = "tessera-node", version, about = "Tessera block-transfer overlay node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/tessera/config.toml")]
    config: PathBuf,

    /// Listen address, overriding `[node] listen`
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log filter, overriding `[logging] level`
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

impl Cli {
    fn load_config(&self) -> Result<NodeConfig, tessera_node::NodeError> {
        let mut config = NodeConfig::load(&self.config)?;
        if let Some(listen) = self.listen {
            config.node.listen = listen.to_string();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Shut down on ctrl-c, and on SIGTERM where there is one.
fn spawn_signal_handler(handle: ShutdownHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
                        _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("received SIGINT, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received ctrl-c, shutting down");
        }
        handle.shutdown();
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid config {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if cli.check {
        println!("{}: ok ({} peers)", cli.config.display(), config.peers.len());
        return ExitCode::SUCCESS;
    }

    tessera_node::logging::init_from_config(&config.logging);

    let mut node = match Node::bind(config) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("failed to create node: {e}");
            return ExitCode::FAILURE;
        }
    };
    spawn_signal_handler(node.shutdown_handle());

    if let Err(e) = node.start().await {
        tracing::error!("failed to start node: {e}");
        return ExitCode::FAILURE;
    }

    node.run().await;
    node.shutdown().await;
    ExitCode::SUCCESS
}
