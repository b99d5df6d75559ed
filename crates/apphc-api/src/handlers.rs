//! REST API handlers.
//!
//! Handlers delegate to the [`AppManager`](apphc_orchestrator::AppManager)
//! or the [`ClusterManager`](apphc_cluster::ClusterManager) and translate
//! their outcome into the response envelope.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::info;

use apphc_cluster::{ClusterError, ClusterResult};
use apphc_core::{
    AddNodeRequest, AppFilter, AppRequest, Cycle, DeleteMetadataRequest, DeleteQuotasRequest, DeleteRequest,
    EnableDisableRequest, NodeStateRequest, RemoveNodeRequest, Response, ResponseStatus, SetQuotasRequest,
};
use apphc_orchestrator::{OrchestratorError, OrchestratorResult};

use crate::ApiState;

/// HTTP status for a response envelope.
pub fn http_status(response: &Response) -> StatusCode {
    match response.status {
        ResponseStatus::Success | ResponseStatus::Unchanged => StatusCode::OK,
        ResponseStatus::InProgress => StatusCode::ACCEPTED,
        ResponseStatus::NotFound => StatusCode::NOT_FOUND,
        ResponseStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn envelope(status: StatusCode, response: Response) -> axum::response::Response {
    (status, Json(response)).into_response()
}

fn reply(result: OrchestratorResult<Response>) -> axum::response::Response {
    match result {
        Ok(response) => envelope(http_status(&response), response),
        Err(e) => {
            let status = match &e {
                OrchestratorError::Locked(_) => StatusCode::CONFLICT,
                OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let response = e.into_response();
            let status = if response.status == ResponseStatus::NotFound {
                StatusCode::NOT_FOUND
            } else {
                status
            };
            envelope(status, response)
        }
    }
}

fn cluster_failure(e: ClusterError) -> axum::response::Response {
    if e.is_not_found() {
        return envelope(StatusCode::NOT_FOUND, Response::not_found(e.to_string()));
    }
    let status = match &e {
        e if e.is_locked() => StatusCode::CONFLICT,
        ClusterError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    envelope(status, Response::error(e.to_string()))
}

fn cluster_reply(result: ClusterResult<Response>) -> axum::response::Response {
    match result {
        Ok(response) => envelope(http_status(&response), response),
        Err(e) => cluster_failure(e),
    }
}

// ── Applications ───────────────────────────────────────────────

/// Query string of `GET /api/v1/apps`. Group ids are comma-separated.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppsQuery {
    pub name: Option<String>,
    pub version: Option<String>,
    pub cycle: Option<Cycle>,
    pub root_group_id: Option<String>,
    pub group_ids: Option<String>,
}

impl From<AppsQuery> for AppFilter {
    fn from(q: AppsQuery) -> Self {
        AppFilter {
            name: q.name.filter(|n| !n.is_empty()),
            version: q.version.filter(|v| !v.is_empty()),
            cycle: q.cycle,
            root_group_id: q.root_group_id.filter(|r| !r.is_empty()),
            group_ids: q
                .group_ids
                .map(|ids| {
                    ids.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// GET /api/v1/apps
pub async fn get_apps(State(state): State<ApiState>, Query(query): Query<AppsQuery>) -> impl IntoResponse {
    reply(state.manager.get_apps(&query.into()).await)
}

/// POST /api/v1/apps
pub async fn create_app(State(state): State<ApiState>, Json(req): Json<AppRequest>) -> impl IntoResponse {
    info!(app = %req.name, "received create request");
    reply(state.manager.create_app(&req).await)
}

/// PUT /api/v1/apps
pub async fn update_app(State(state): State<ApiState>, Json(req): Json<AppRequest>) -> impl IntoResponse {
    info!(app = %req.name, "received update request");
    reply(state.manager.update_app(&req).await)
}

/// POST /api/v1/apps/upgrade
pub async fn upgrade_app(State(state): State<ApiState>, Json(req): Json<AppRequest>) -> impl IntoResponse {
    info!(app = %req.name, "received upgrade request");
    reply(state.manager.upgrade_app(&req).await)
}

/// POST /api/v1/apps/delete
pub async fn delete_app(State(state): State<ApiState>, Json(req): Json<DeleteRequest>) -> impl IntoResponse {
    info!(app = %req.name, "received delete request");
    reply(state.manager.delete_app(&req).await)
}

/// POST /api/v1/apps/delete-all
pub async fn delete_apps(State(state): State<ApiState>, Json(req): Json<DeleteRequest>) -> impl IntoResponse {
    info!(purge = req.purge, "received bulk delete request");
    reply(state.manager.delete_apps(&req).await)
}

/// POST /api/v1/apps/metadata/delete
pub async fn delete_app_metadata(
    State(state): State<ApiState>,
    Json(req): Json<DeleteMetadataRequest>,
) -> impl IntoResponse {
    info!(app = %req.name, "received metadata delete request");
    reply(state.manager.delete_app_metadata(&req).await)
}

/// POST /api/v1/apps/state
pub async fn enable_disable_app(
    State(state): State<ApiState>,
    Json(req): Json<EnableDisableRequest>,
) -> impl IntoResponse {
    info!(app = %req.name, enable = req.enable, "received state change request");
    reply(state.manager.enable_disable_app(&req).await)
}

// ── Cluster ────────────────────────────────────────────────────

/// POST /api/v1/cluster/upgrade
pub async fn upgrade_cluster(State(state): State<ApiState>) -> impl IntoResponse {
    info!("received cluster upgrade request");
    match state.cluster.upgrade().start().await {
        // The upgrade outlives the request; its outcome is read back later.
        Ok(_handle) => {
            let response = Response::in_progress("AppHoster cluster upgrade in progress");
            envelope(http_status(&response), response)
        }
        Err(e) => cluster_failure(e),
    }
}

/// GET /api/v1/cluster/upgrade
pub async fn last_upgrade(State(state): State<ApiState>) -> impl IntoResponse {
    if state.cluster.upgrade().in_progress() {
        let response = Response::in_progress("AppHoster cluster upgrade in progress");
        return envelope(http_status(&response), response);
    }
    match state.cluster.upgrade().last_upgrade().await {
        Ok(Some(upgrade)) => {
            let response = Response::success("Last cluster upgrade").with_body(&upgrade);
            envelope(StatusCode::OK, response)
        }
        Ok(None) => envelope(
            StatusCode::NOT_FOUND,
            Response::not_found("no cluster upgrade recorded"),
        ),
        Err(e) => cluster_failure(e),
    }
}

/// GET /api/v1/cluster/info
pub async fn cluster_info(State(state): State<ApiState>) -> impl IntoResponse {
    cluster_reply(state.cluster.info().await)
}

/// POST /api/v1/cluster/nodes
pub async fn add_node(State(state): State<ApiState>, Json(req): Json<AddNodeRequest>) -> impl IntoResponse {
    info!(hostname = %req.hostname, master = req.master, "received add node request");
    cluster_reply(state.cluster.add_node(&req).await)
}

/// POST /api/v1/cluster/nodes/delete
pub async fn remove_node(State(state): State<ApiState>, Json(req): Json<RemoveNodeRequest>) -> impl IntoResponse {
    info!(hostname = %req.hostname, "received remove node request");
    cluster_reply(state.cluster.remove_node(&req).await)
}

/// POST /api/v1/cluster/nodes/state
pub async fn update_node_state(
    State(state): State<ApiState>,
    Json(req): Json<NodeStateRequest>,
) -> impl IntoResponse {
    info!(hostname = %req.hostname, state = ?req.state, "received node state request");
    cluster_reply(state.cluster.update_node_state(&req).await)
}

/// Query string of `GET /api/v1/cluster/quotas`. Namespaces are comma-separated.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QuotasQuery {
    pub namespaces: String,
}

impl QuotasQuery {
    fn namespaces(&self) -> Vec<String> {
        self.namespaces
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// GET /api/v1/cluster/quotas
pub async fn get_quotas(State(state): State<ApiState>, Query(query): Query<QuotasQuery>) -> impl IntoResponse {
    cluster_reply(state.cluster.get_quotas(&query.namespaces()).await)
}

/// POST /api/v1/cluster/quotas
pub async fn set_quotas(State(state): State<ApiState>, Json(req): Json<SetQuotasRequest>) -> impl IntoResponse {
    info!(quotas = req.quotas.len(), "received set quotas request");
    cluster_reply(state.cluster.set_quotas(&req).await)
}

/// POST /api/v1/cluster/quotas/delete
pub async fn delete_quotas(
    State(state): State<ApiState>,
    Json(req): Json<DeleteQuotasRequest>,
) -> impl IntoResponse {
    info!(namespace = %req.namespace, "received delete quotas request");
    cluster_reply(state.cluster.delete_quotas(&req).await)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
