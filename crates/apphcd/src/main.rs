//! apphcd — the application controller daemon.
//!
//! Serves the REST API in front of the application manager and the cluster
//! upgrade coordinator.
//!
//! # Usage
//!
//! ```text
//! apphcd serve --config /etc/apphc/apphcd.toml
//! apphcd serve --standalone --port 8080
//! apphcd config > apphcd.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "apphcd", about = "Application controller daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller.
    Serve {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on; overrides the configuration.
        #[arg(long)]
        port: Option<u16>,

        /// Use local catalog directories and no remote collaborators.
        #[arg(long)]
        standalone: bool,
    },

    /// Print the default configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            standalone,
        } => {
            apphcd::init_tracing(cli.log_json);
            serve(config, port, standalone).await
        }
        Command::Config => {
            print!("{}", apphc_core::ControllerConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn serve(config_path: Option<PathBuf>, port: Option<u16>, standalone: bool) -> anyhow::Result<()> {
    let mut config = apphcd::load_config(config_path.as_deref())?;
    if let Some(port) = port {
        config.server.port = port;
    }
    info!(standalone, "apphc controller starting");

    let state = apphcd::assemble(&config, standalone).await?;
    let cluster = state.cluster.clone();
    let router = apphc_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    if cluster.upgrade().in_progress() {
        info!("a cluster upgrade is still running; its outcome will not be recorded");
    }
    info!("apphc controller stopped");
    Ok(())
}
