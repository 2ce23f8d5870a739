//! Orchestrator daemon.
//!
//! Hosts the intent API plus an embedded resource store and VNF reconciler,
//! and talks to the transport-network manager over HTTP.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use mano_core::logging::{init_logging, LoggingConfig};
use mano_core::ManoError;
use mano_orchestrator::http::{router, HttpState};
use mano_orchestrator::orchestrator::Orchestrator;
use mano_orchestrator::transport_client::HttpTransportClient;
use mano_package::client::{GitopsPackageBuilder, PackageRepoClient};
use mano_package::deploy::DeploymentServiceClient;
use mano_package::translate::PackageTranslator;
use mano_reconciler::controller::Controller;
use mano_reconciler::metrics::ReconcilerMetrics;
use mano_reconciler::optimized::{OptimizedReconciler, OptimizerConfig};
use mano_reconciler::reconciler::VnfReconciler;
use mano_reconciler::store::InMemoryVnfStore;

#[derive(Parser)]
#[command(name = "mano-orchestrator")]
#[command(about = "Intent-driven orchestrator facade for O-RAN network slicing")]
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

    /// Tenancy namespace override
    #[arg(long)]
    namespace: Option<String>,

    /// Transport-network manager base URL override
    #[arg(long, env = "MANO_TN_MANAGER_URL")]
    transport_url: Option<String>,

    /// Package repository URL override
    #[arg(long, env = "MANO_PACKAGE_REPO_URL")]
    repo_url: Option<String>,

    /// Deployment-management service URL override
    #[arg(long, env = "MANO_DEPLOY_SERVICE_URL")]
    deploy_url: Option<String>,

    /// Reconcile workers override
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct OrchestratorConfig {
    listen_addr: String,
    namespace: String,
    workers: usize,
    transport_url: Option<String>,
    package_repo_url: Option<String>,
    deployment_service_url: Option<String>,
    logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            namespace: "slices".to_string(),
            workers: 4,
            transport_url: None,
            package_repo_url: None,
            deployment_service_url: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    fn load(path: &Path) -> mano_core::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ManoError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| ManoError::Configuration(format!("malformed config: {e}")))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref().map(OrchestratorConfig::load) {
        Some(Ok(config)) => config,
        Some(Err(err)) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
        None => OrchestratorConfig::default(),
    };
    config.logging.level = cli.log_level.clone();
    if cli.log_file.is_some() {
        config.logging.file = cli.log_file.clone();
    }
    if let Some(listen) = &cli.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if cli.transport_url.is_some() {
        config.transport_url = cli.transport_url.clone();
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
            tracing::error!(error = %err, "orchestrator terminated abnormally");
            ExitCode::from(2)
        }
    }
}

async fn run(config: OrchestratorConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let transport_url = config
        .transport_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("transport manager url is not configured"))?;
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
        metrics,
        OptimizerConfig::default(),
        cancel.clone(),
    ));
    let controller = Controller::new(store.clone(), optimized, config.workers, cancel.clone());

    let transport = Arc::new(HttpTransportClient::new(&transport_url)?);
    let orchestrator = Orchestrator::new(&config.namespace, store, transport);

    let watch_cancel = cancel.clone();
    let watcher = orchestrator.clone();
    tokio::spawn(async move { watcher.run(watch_cancel).await });

    controller.resync().await?;
    let controller_task = tokio::spawn(async move { controller.run().await });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "orchestrator started");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(HttpState { orchestrator }))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();
    let _ = controller_task.await;
    let _ = server.await;
    tracing::info!("orchestrator stopped");
    Ok(())
}
