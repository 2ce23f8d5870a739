//! Transport-network manager daemon.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use mano_core::logging::init_logging;
use mano_transport::agent_client::HttpAgentClient;
use mano_transport::config::TnManagerConfig;
use mano_transport::http::{router, HttpState};
use mano_transport::manager::TransportManager;

#[derive(Parser)]
#[command(name = "mano-tn-manager")]
#[command(about = "Transport-network manager: slice planning, agent fan-out and probing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level: debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file; stdout when omitted
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Listen address override
    #[arg(long)]
    listen: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref().map(TnManagerConfig::load) {
        Some(Ok(config)) => config,
        Some(Err(err)) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
        None => TnManagerConfig::default(),
    };
    config.logging.level = cli.log_level.clone();
    if cli.log_file.is_some() {
        config.logging.file = cli.log_file.clone();
    }
    if let Some(listen) = &cli.listen {
        config.listen_addr = listen.clone();
    }

    let _log_guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("logging setup failed: {err}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("runtime startup failed: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "transport manager terminated abnormally");
            ExitCode::from(2)
        }
    }
}

async fn run(config: TnManagerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let agents = Arc::new(HttpAgentClient::new()?);
    let manager = Arc::new(
        TransportManager::new(config.node_registry(), agents, config.vni_start)
            .with_probing(config.probe_enabled),
    );

    if config.probe_enabled {
        let monitor = manager.clone();
        let monitor_cancel = cancel.clone();
        let interval = std::time::Duration::from_secs(config.probe_interval_secs.max(5));
        tokio::spawn(async move { monitor.run_monitor(interval, monitor_cancel).await });
    }

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, nodes = config.nodes.len(), "transport manager started");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(HttpState { manager }))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();
    let _ = server.await;
    tracing::info!("transport manager stopped");
    Ok(())
}
