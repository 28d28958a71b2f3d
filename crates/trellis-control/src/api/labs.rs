//! Lab lifecycle endpoints.
//!
//! POST   /api/labs                  — deploy from JSON (containerlab or wrapper yaml)
//! POST   /api/labs/file             — deploy from an uploaded YAML file
//! GET    /api/labs                  — list labs (in-memory + cluster-discovered)
//! GET    /api/labs/{name}           — lab details
//! GET    /api/labs/{name}/status    — deployment status
//! GET    /api/labs/{name}/topology  — the lab's nodes and links
//! DELETE /api/labs/{name}           — delete lab, CRD, and store entities

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::labs::{DeployError, DeployRequest, DeployResponse, Lab};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(deploy_lab).get(list_labs))
        .route("/file", post(deploy_lab_from_file))
        .route("/{name}", get(get_lab).delete(delete_lab))
        .route("/{name}/status", get(get_lab_status))
        .route("/{name}/topology", get(get_lab_topology))
}

fn deploy_error_response(err: DeployError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        DeployError::Validation(_) => StatusCode::BAD_REQUEST,
        DeployError::AlreadyExists(_) => StatusCode::CONFLICT,
    };
    (status, Json(serde_json::json!({"error": err.to_string()})))
}

async fn deploy_lab(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> Result<Json<DeployResponse>, (StatusCode, Json<serde_json::Value>)> {
    state
        .labs()
        .deploy_lab(request)
        .await
        .map(Json)
        .map_err(deploy_error_response)
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

async fn deploy_lab_from_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
    mut multipart: Multipart,
) -> Result<Json<DeployResponse>, (StatusCode, Json<serde_json::Value>)> {
    let mut yaml = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            yaml = field.text().await.ok();
            break;
        }
    }
    let Some(yaml) = yaml else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "missing 'file' field"})),
        ));
    };

    // A clabernetes wrapper mentions its API group; plain containerlab
    // does not
    let is_wrapper = yaml.contains("apiVersion:") && yaml.to_lowercase().contains("clabernetes");
    let request = DeployRequest {
        name: query.name.unwrap_or_default(),
        namespace: query.namespace.unwrap_or_default(),
        containerlab_yaml: (!is_wrapper).then(|| yaml.clone()),
        clabernetes_yaml: is_wrapper.then_some(yaml),
    };

    state
        .labs()
        .deploy_lab(request)
        .await
        .map(Json)
        .map_err(deploy_error_response)
}

#[derive(Debug, Serialize)]
struct LabListResponse {
    labs: Vec<Lab>,
    count: usize,
}

async fn list_labs(State(state): State<AppState>) -> Json<LabListResponse> {
    let labs = state.labs().list_labs().await;
    Json(LabListResponse {
        count: labs.len(),
        labs,
    })
}

async fn get_lab(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Lab>, StatusCode> {
    state
        .labs()
        .get_lab(&name)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_lab_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let status = state
        .labs()
        .get_lab_status(&name)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(
        serde_json::json!({"lab": name, "status": status.to_string()}),
    ))
}

async fn get_lab_topology(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<trellis_common::models::TopologyView>, StatusCode> {
    state
        .labs()
        .get_lab_topology(&name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_lab(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if state.labs().delete_lab(&name).await {
        Ok(Json(serde_json::json!({"status": "deleted", "lab": name})))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
