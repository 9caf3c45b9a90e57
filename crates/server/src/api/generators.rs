//! Generator pool API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use jobgen_core::{GeneratorError, PoolStatus, TickOutcome};

use super::ErrorResponse;
use crate::state::AppState;

pub async fn list_generators(State(state): State<Arc<AppState>>) -> Json<PoolStatus> {
    Json(state.pool().status().await)
}

#[derive(Debug, Serialize)]
pub struct TickResponse {
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<TickOutcome> for TickResponse {
    fn from(outcome: TickOutcome) -> Self {
        let label = outcome.label().to_string();
        match outcome {
            TickOutcome::Idle => Self {
                outcome: label,
                job_id: None,
                detail: None,
            },
            TickOutcome::Advanced { job_id, from, to } => Self {
                outcome: label,
                job_id: Some(job_id),
                detail: Some(format!("{} -> {}", from.as_str(), to.as_str())),
            },
            TickOutcome::RolledBack { job_id, reason, .. } => Self {
                outcome: label,
                job_id: Some(job_id),
                detail: Some(reason),
            },
            TickOutcome::Conflict { job_id } => Self {
                outcome: label,
                job_id: Some(job_id),
                detail: None,
            },
        }
    }
}

/// Run one tick of a generator on demand.
pub async fn tick_generator(
    State(state): State<Arc<AppState>>,
    Path(task_table): Path<String>,
) -> Result<Json<TickResponse>, impl IntoResponse> {
    match state.pool().tick_once(&task_table).await {
        Ok(outcome) => Ok(Json(TickResponse::from(outcome))),
        Err(GeneratorError::UnknownTaskTable(name)) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No generator for task table {}", name),
            }),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}
