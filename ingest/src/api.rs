use crate::Services;
use crate::actions::{self, FileStatusResponse, ReprocessResponse};
use crate::activity::ActivityEntry;
use crate::config::Listener as ListenerConfig;
use crate::errors::IngestError;
use crate::types::FileStatus;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

pub async fn serve(listener: ListenerConfig, services: Arc<Services>) -> std::io::Result<()> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(services)).await
}

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/files/{name}/status", get(file_status).put(set_file_status))
        .route("/integrations/{id}/pull", post(pull))
        .route("/integrations/{id}/process", post(process))
        .route(
            "/integrations/{id}/files/{name}/reprocess",
            post(reprocess),
        )
        .route("/integrations/{id}/activity", get(activity))
        .with_state(services)
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

#[derive(Deserialize, Debug)]
struct SetStatusBody {
    status: FileStatus,
}

#[derive(Serialize)]
struct PullResponse {
    data_points_file: String,
    transmissions_file: String,
}

#[derive(Serialize)]
struct ProcessResponse {
    observations_processed: usize,
}

#[derive(Serialize)]
struct ActivityResponse {
    healthy: bool,
    entries: Vec<ActivityEntry>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn file_status(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
) -> Result<Json<FileStatusResponse>, IngestError> {
    actions::get_file_status(services.processor(), &name)
        .await
        .map(Json)
}

async fn set_file_status(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
    Json(body): Json<SetStatusBody>,
) -> Result<Json<FileStatusResponse>, IngestError> {
    actions::set_file_status(services.processor(), &name, body.status)
        .await
        .map(Json)
}

async fn pull(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Result<Json<PullResponse>, IngestError> {
    let files = services.pull(&id).await?;
    Ok(Json(PullResponse {
        data_points_file: files.data_points.to_string(),
        transmissions_file: files.transmissions.to_string(),
    }))
}

async fn process(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Result<Json<ProcessResponse>, IngestError> {
    let observations_processed = services.process(&id).await?;
    Ok(Json(ProcessResponse {
        observations_processed,
    }))
}

async fn reprocess(
    State(services): State<Arc<Services>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<ReprocessResponse>, IngestError> {
    services.reprocess(&id, &name).await.map(Json)
}

async fn activity(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Result<Json<ActivityResponse>, IngestError> {
    if !services.has_integration(&id) {
        return Err(IngestError::UnknownIntegration(id));
    }
    Ok(Json(ActivityResponse {
        healthy: services.activity().is_healthy(&id),
        entries: services.activity().entries(&id),
    }))
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngestError::UnknownIntegration(_) => StatusCode::NOT_FOUND,
            IngestError::InvalidFileName(_) => StatusCode::BAD_REQUEST,
            IngestError::BadPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IngestError::Vendor(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}
