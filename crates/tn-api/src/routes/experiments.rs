use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use tn_topology::ExperimentConfig;

use crate::driver::{DeploymentStatus, ExperimentHandle};
use crate::dto::{ExperimentAccepted, ExperimentSummary};
use crate::error::ApiError;
use crate::state::AppState;

/// Validate and start a deployment in the background. Progress and outcome
/// land in the deployment record served by `get_experiment`.
pub async fn create_experiment(
    State(state): State<AppState>,
    Json(config): Json<ExperimentConfig>,
) -> Result<(StatusCode, Json<ExperimentAccepted>), ApiError> {
    config
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if state.driver.is_active(&config.name) {
        return Err(ApiError::Conflict(format!(
            "deployment {} is in progress",
            config.name
        )));
    }

    let existing = state
        .driver
        .load(&config.name)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if existing.is_some_and(|h| h.status == DeploymentStatus::Deployed) {
        return Err(ApiError::Conflict(format!(
            "deployment {} is running",
            config.name
        )));
    }

    let name = config.name.clone();
    let driver = state.driver.clone();
    tokio::spawn(async move {
        // Failures are logged and recorded by the driver.
        let _ = driver.run(config).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ExperimentAccepted {
            name,
            status: DeploymentStatus::Deploying,
        }),
    ))
}

pub async fn list_experiments(
    State(state): State<AppState>,
) -> Result<Json<Vec<ExperimentSummary>>, ApiError> {
    let handles = state
        .driver
        .list()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(handles.into_iter().map(ExperimentSummary::from).collect()))
}

pub async fn get_experiment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ExperimentHandle>, ApiError> {
    state
        .driver
        .load(&name)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn delete_experiment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ExperimentHandle>, ApiError> {
    let handle = state.driver.tear_down(&name).await?;
    Ok(Json(handle))
}
