mod auth;
mod config;
mod driver;
mod dto;
mod error;
mod local;
mod routes;
mod state;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tn_infra::ProviderRegistry;
use tn_topology::ExperimentConfig;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::driver::DeploymentDriver;
use crate::local::DockerCompose;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let providers = match tn_infra::build_providers() {
        Ok(providers) => {
            info!(providers = ?providers.available(), "cloud providers ready");
            providers
        }
        Err(e) => {
            warn!(error = %e, "no cloud providers, only local deployments will work");
            ProviderRegistry::new()
        }
    };

    let driver = DeploymentDriver::new(
        providers,
        Arc::new(DockerCompose::default()),
        &config.output_dir,
    )
    .with_concurrency(config.concurrency);
    info!(output_dir = %driver.output_dir().display(), "deployment records");

    match config.experiment_file.clone() {
        Some(path) => run_once(&driver, &path).await,
        None => serve(Arc::new(driver), config).await,
    }
}

/// Deploy one experiment file and exit. The handle goes to stdout as JSON.
async fn run_once(driver: &DeploymentDriver, path: &Path) -> ExitCode {
    let experiment = match ExperimentConfig::from_path(path) {
        Ok(experiment) => experiment,
        Err(e) => {
            error!(path = %path.display(), error = %e, "could not load experiment");
            return ExitCode::FAILURE;
        }
    };
    let name = experiment.name.clone();

    match driver.run(experiment).await {
        Ok(handle) => match serde_json::to_string_pretty(&handle) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "could not serialize deployment handle");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("deployment {name} failed at stage {}: {}", e.stage, e.source);
            if let Ok(Some(record)) = driver.load(&name)
                && !record.machines.is_empty()
            {
                eprintln!(
                    "machines that may still exist: {}",
                    record.machines.join(", ")
                );
            }
            ExitCode::FAILURE
        }
    }
}

async fn serve(driver: Arc<DeploymentDriver>, config: AppConfig) -> ExitCode {
    if config.api_key.is_none() {
        error!("TESTNET_API_KEY must be set to serve the control API");
        return ExitCode::FAILURE;
    }

    let listen_addr = config.listen_addr;
    let state = AppState { driver, config };
    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = match tokio::net::TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %listen_addr, error = %e, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    info!(addr = %listen_addr, "starting test-network control API");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
