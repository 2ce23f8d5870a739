//! VNF reconciler daemon.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use mano_core::logging::init_logging;
use mano_core::metrics::PROMETHEUS_CONTENT_TYPE;
use mano_package::client::{GitopsPackageBuilder, PackageRepoClient};
use mano_package::deploy::DeploymentServiceClient;
use mano_package::translate::PackageTranslator;
use mano_reconciler::config::ReconcilerConfig;
use mano_reconciler::controller::Controller;
use mano_reconciler::metrics::ReconcilerMetrics;
use mano_reconciler::optimized::{OptimizedReconciler, OptimizerConfig};
use mano_reconciler::reconciler::VnfReconciler;
use mano_reconciler::store::InMemoryVnfStore;

#[derive(Parser)]
#[command(name = "mano-reconciler")]
#[command(about = "Level-triggered VNF reconciler for the MANO control plane")]
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

    /// Bind address override for the health/metrics surface
    #[arg(long)]
    listen: Option<String>,

    /// Package repository URL override
    #[arg(long, env = "MANO_PACKAGE_REPO_URL")]
    repo_url: Option<String>,

    /// Deployment-management service URL override
    #[arg(long, env = "MANO_DEPLOY_SERVICE_URL")]
    deploy_url: Option<String>,
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<ReconcilerMetrics>,
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render(),
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref().map(ReconcilerConfig::load) {
        Some(Ok(config)) => config,
        Some(Err(err)) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
        None => ReconcilerConfig::default(),
    };
    config.logging.level = cli.log_level.clone();
    if cli.log_file.is_some() {
        config.logging.file = cli.log_file.clone();
    }
    if let Some(listen) = &cli.listen {
        config.listen_addr = listen.clone();
    }
    if cli.repo_url.is_some() {
        config.package_repo_url = cli.repo_url.clone();
    }
    if cli.deploy_url.is_some() {
        config.deployment_service_url = cli.deploy_url.clone();
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
            tracing::error!(error = %err, "reconciler terminated abnormally");
            ExitCode::from(2)
        }
    }
}

async fn run(config: ReconcilerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let repo_url = config
        .package_repo_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("package repository url is not configured"))?;
    let deploy_url = config
        .deployment_service_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("deployment service url is not configured"))?;

    let repo_token = std::env::var("MANO_PACKAGE_REPO_TOKEN").unwrap_or_default();
    let deploy_token = std::env::var("MANO_DEPLOY_SERVICE_TOKEN").unwrap_or_default();

    let store = InMemoryVnfStore::new();
    let packages = Arc::new(GitopsPackageBuilder::new(
        PackageTranslator::default(),
        PackageRepoClient::new(&repo_url, &repo_token, cancel.clone())?,
    ));
    let deployments = Arc::new(DeploymentServiceClient::new(&deploy_url, &deploy_token)?);

    let metrics = Arc::new(ReconcilerMetrics::new());
    let base = Arc::new(VnfReconciler::new(
        store.clone(),
        packages,
        deployments,
        cancel.clone(),
    ));
    let optimized = Arc::new(OptimizedReconciler::new(
        base,
        store.clone(),
        metrics.clone(),
        OptimizerConfig::from(&config.optimizer),
        cancel.clone(),
    ));

    let controller = Controller::new(store, optimized, config.workers, cancel.clone());
    controller.resync().await?;

    let state = AppState {
        metrics: metrics.clone(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, workers = config.workers, "reconciler started");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown_cancel.cancel();
        }
    });

    controller.run().await;
    cancel.cancel();
    let _ = server.await;
    tracing::info!("reconciler stopped");
    Ok(())
}
