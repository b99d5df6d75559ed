//! apphc-api — REST API for the application controller.
//!
//! Every handler answers with the [`Response`](apphc_core::Response)
//! envelope; the HTTP status mirrors its status field.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/apps` | List running instances |
//! | POST | `/api/v1/apps` | Create an application |
//! | PUT | `/api/v1/apps` | Update an application |
//! | POST | `/api/v1/apps/upgrade` | Upgrade an application |
//! | POST | `/api/v1/apps/delete` | Delete instances of an application |
//! | POST | `/api/v1/apps/delete-all` | Delete every application |
//! | POST | `/api/v1/apps/metadata/delete` | Delete chart metadata |
//! | POST | `/api/v1/apps/state` | Enable or disable instances |
//! | GET | `/api/v1/cluster/upgrade` | Last cluster upgrade |
//! | POST | `/api/v1/cluster/upgrade` | Start a cluster upgrade |
//! | GET | `/api/v1/cluster/info` | Capacity, workloads, and nodes |
//! | POST | `/api/v1/cluster/nodes` | Add a node |
//! | POST | `/api/v1/cluster/nodes/delete` | Drain and remove a node |
//! | POST | `/api/v1/cluster/nodes/state` | Cordon, drain, or reactivate a node |
//! | GET | `/api/v1/cluster/quotas?namespaces=a,b` | Namespace quotas |
//! | POST | `/api/v1/cluster/quotas` | Set namespace quotas |
//! | POST | `/api/v1/cluster/quotas/delete` | Remove a namespace quota |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use apphc_orchestrator::AppManager;
use apphc_cluster::ClusterManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<AppManager>,
    pub cluster: Arc<ClusterManager>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/apps",
            get(handlers::get_apps)
                .post(handlers::create_app)
                .put(handlers::update_app),
        )
        .route("/apps/upgrade", post(handlers::upgrade_app))
        .route("/apps/delete", post(handlers::delete_app))
        .route("/apps/delete-all", post(handlers::delete_apps))
        .route("/apps/metadata/delete", post(handlers::delete_app_metadata))
        .route("/apps/state", post(handlers::enable_disable_app))
        .route(
            "/cluster/upgrade",
            get(handlers::last_upgrade).post(handlers::upgrade_cluster),
        )
        .route("/cluster/info", get(handlers::cluster_info))
        .route("/cluster/nodes", post(handlers::add_node))
        .route("/cluster/nodes/delete", post(handlers::remove_node))
        .route("/cluster/nodes/state", post(handlers::update_node_state))
        .route(
            "/cluster/quotas",
            get(handlers::get_quotas).post(handlers::set_quotas),
        )
        .route("/cluster/quotas/delete", post(handlers::delete_quotas))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
