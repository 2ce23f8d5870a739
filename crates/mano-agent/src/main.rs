//! Node agent daemon.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mano_agent::bandwidth::BandwidthMonitor;
use mano_agent::config::AgentFileConfig;
use mano_agent::http::{router, HttpState};
use mano_agent::reconcile::{
    AgentReconciler, AgentState, CompositeSource, FileConfigSource, PushedConfigs,
};
use mano_core::logging::init_logging;
use mano_exec::command::SystemRunner;
use mano_exec::probe::Prober;

#[derive(Parser)]
#[command(name = "mano-agent")]
#[command(about = "Node agent reconciling slice transport configuration into kernel state")]
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

    /// Node name override
    #[arg(long)]
    node_name: Option<String>,

    /// Listen address override, e.g. 0.0.0.0:8081
    #[arg(long)]
    listen: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref().map(AgentFileConfig::load) {
        Some(Ok(config)) => config,
        Some(Err(err)) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
        None => AgentFileConfig::default(),
    };
    config.logging.level = cli.log_level.clone();
    if cli.log_file.is_some() {
        config.logging.file = cli.log_file.clone();
    }
    if let Some(node) = &cli.node_name {
        config.agent.node_name = node.clone();
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

    match runtime.block_on(run(config, cli.listen)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "agent terminated abnormally");
            ExitCode::from(2)
        }
    }
}

async fn run(config: AgentFileConfig, listen_override: Option<String>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let node = config.agent.node_name.clone();

    let runner = Arc::new(SystemRunner::default());
    let state = AgentState::new();
    let pushed = PushedConfigs::new();
    let kick = Arc::new(Notify::new());

    let file_source = config.config_dir.clone().map(FileConfigSource::new);
    let source = Arc::new(CompositeSource::new(file_source, pushed.clone()));

    let reconciler = Arc::new(AgentReconciler::new(
        node.clone(),
        source,
        runner.clone(),
        state.clone(),
        kick.clone(),
    ));

    // bound drift left behind by an earlier incarnation
    if let Err(err) = reconciler.sweep().await {
        tracing::warn!(error = %err, "startup sweep incomplete");
    }

    let reconcile_interval = config.reconcile_interval();
    let loop_reconciler = reconciler.clone();
    let loop_cancel = cancel.clone();
    let reconcile_task = tokio::spawn(async move {
        loop_reconciler.run(reconcile_interval, loop_cancel).await;
    });

    let mut monitor_task = None;
    if config.monitoring.enabled {
        let monitor = BandwidthMonitor::new(
            runner.clone(),
            config.agent.interfaces.clone(),
            state.clone(),
            config.monitoring.export_directory.clone(),
        );
        let interval = Duration::from_secs(config.monitoring.interval_secs.max(1));
        let monitor_cancel = cancel.clone();
        monitor_task = Some(tokio::spawn(async move {
            monitor.run(interval, monitor_cancel).await;
        }));
    }

    let listen_addr = listen_override
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.agent.monitoring_port));
    let http_state = HttpState {
        node: node.clone(),
        state: state.clone(),
        pushed,
        kick,
        prober: Arc::new(Prober::new(runner.clone())),
    };
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, node = %node, "agent started");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(http_state))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();

    let _ = reconcile_task.await;
    if let Some(task) = monitor_task {
        let _ = task.await;
    }
    let _ = server.await;

    // best-effort teardown of managed overlays
    if let Err(err) = reconciler.sweep().await {
        tracing::warn!(error = %err, "shutdown sweep incomplete");
    }
    tracing::info!("agent stopped");
    Ok(())
}
