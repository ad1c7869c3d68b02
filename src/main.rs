// networktools: per-node control agent for an overlay WireGuard mesh.
// Reconciles kernel state against the controller's declarative intent.

mod agent;
mod api;
mod container;
mod init;
mod net;
mod ospf;
mod relay;
mod store;
mod utils;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agent::AgentResult;
use store::Store;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Overlay mesh control agent")]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the local node key and settings, then join the cluster
    Init {
        /// Path to the node state database
        #[clap(short = 'd', long = "data", value_name = "PATH")]
        data: String,
    },

    /// Run the reconciliation service loop
    Run {
        /// Path to the node state database
        #[clap(short = 'd', long = "data", value_name = "PATH")]
        data: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Init { data } => init::run_init(&data).await,
        Commands::Run { data } => run_service(&data).await,
    };

    if let Err(e) = result {
        tracing::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run_service(store_path: &str) -> AgentResult<()> {
    let store = Store::open(store_path).await?;
    tokio::select! {
        result = agent::service::run(store) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    }
}
