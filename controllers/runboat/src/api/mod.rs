//! REST surface.
//!
//! JSON under `/api/v1`; the shared admin credential guards mutating
//! routes, while list/inspect/stream routes are open. Error mapping per
//! kind lives in [`error`].

pub mod auth;
pub mod builds;
pub mod error;
pub mod events;
pub mod webhook;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use cluster_gateway::ClusterGateway;

use crate::github::GithubClient;
use crate::index::BuildIndex;
use crate::lifecycle::Lifecycle;
use crate::settings::Settings;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub index: Arc<BuildIndex>,
    pub lifecycle: Arc<Lifecycle>,
    pub gateway: Arc<dyn ClusterGateway>,
    pub github: Arc<GithubClient>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(builds::controller_status))
        .route(
            "/builds",
            get(builds::list_builds)
                .post(builds::deploy_build)
                .delete(builds::undeploy_builds),
        )
        .route("/builds/trigger/branch", post(builds::trigger_branch))
        .route("/builds/trigger/pr", post(builds::trigger_pr))
        .route("/builds/:name", get(builds::get_build))
        .route("/builds/:name/start", post(builds::start_build))
        .route("/builds/:name/stop", post(builds::stop_build))
        .route("/builds/:name/reset", post(builds::reset_build))
        .route("/builds/:name/undeploy", post(builds::undeploy_build))
        .route("/builds/:name/init-log", get(builds::init_log))
        .route("/builds/:name/log", get(builds::log))
        .route("/build-events", get(events::build_events))
        .route("/webhooks/github", post(webhook::github_webhook));
    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
