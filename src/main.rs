//! # GridMesh Node Binary
//!
//! CLI entry point: runs one fabric node as a coordinator or a worker.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, error};

use gridmesh_node::config::NodeConfig;
use gridmesh_node::node::Node;
use gridmesh_node::types::NodeRole;

#[derive(Parser, Debug)]
#[command(author, version, about = "GridMesh distributed compute fabric node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a coordinator node
    Coordinator {
        /// Listening port
        #[arg(long, default_value_t = 9000)]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        address: String,

        /// Stable node identifier
        #[arg(long, default_value = "coordinator-1")]
        node_id: String,

        /// Secure archive directory
        #[arg(long, default_value = "archive")]
        archive: PathBuf,

        /// Secure archive password
        #[arg(long)]
        password: Option<String>,
    },
    /// Run a worker node
    Worker {
        /// Listening port
        #[arg(long, default_value_t = 9100)]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        address: String,

        /// Stable node identifier
        #[arg(long)]
        node_id: String,

        /// Coordinator endpoint, host:port
        #[arg(long)]
        coord: String,

        /// Secure archive directory
        #[arg(long, default_value = "archive")]
        archive: PathBuf,

        /// Secure archive password
        #[arg(long)]
        password: Option<String>,
    },
}

fn build_config(cli: Cli) -> NodeConfig {
    match cli.command {
        Commands::Coordinator { port, address, node_id, archive, password } => {
            if password.is_some() {
                debug!("Archive password accepted");
            }
            let mut config = NodeConfig::new(node_id, NodeRole::Coordinator, port);
            config.bind_address = address;
            config.archive_dir = archive;
            config
        }
        Commands::Worker { port, address, node_id, coord, archive, password } => {
            if password.is_some() {
                debug!("Archive password accepted");
            }
            let mut config = NodeConfig::new(node_id, NodeRole::Worker, port);
            config.bind_address = address;
            config.archive_dir = archive;
            config.coordinator_endpoint = Some(if coord.starts_with("http") {
                coord
            } else {
                format!("http://{coord}")
            });
            config
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,gridmesh_node=debug".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(cli);

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(err) => {
            error!("Failed to build node: {}", err);
            std::process::exit(err.exit_code());
        }
    };

    if let Err(err) = node.start().await {
        error!("Failed to start node: {}", err);
        node.shutdown().await;
        std::process::exit(err.exit_code());
    }

    node.run_until_signal().await;
}
