//! Runboat controller
//!
//! A Kubernetes operator managing short-lived per-commit preview builds
//! from GitHub branches and pull requests. The controller watches the
//! build namespace to maintain an in-memory index, drives each build
//! through its lifecycle (initialize, start, stop, clean up), enforces
//! fleet-wide capacity limits by age-based eviction, and exposes a REST
//! and webhook surface.

mod api;
mod controller;
mod error;
mod events;
mod github;
mod index;
mod lifecycle;
mod reconciler;
mod settings;
mod watcher;

#[cfg(test)]
mod lifecycle_test;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cluster_gateway::{ClusterGateway, KubeGateway};

use crate::controller::Controller;
use crate::error::ControllerError;
use crate::settings::Settings;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let settings = Arc::new(
        Settings::from_env().map_err(|e| ControllerError::InvalidConfig(e.to_string()))?,
    );

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(settings.log_config.as_deref().unwrap_or("info"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting runboat controller");
    info!(
        namespace = %settings.build_namespace,
        domain = %settings.build_domain,
        "configuration loaded, {} repo rules",
        settings.repos.len()
    );

    let client = kube::Client::try_default()
        .await
        .map_err(|e| ControllerError::Gateway(e.into()))?;
    let gateway: Arc<dyn ClusterGateway> =
        Arc::new(KubeGateway::new(client, &settings.build_namespace));
    let controller = Controller::new(settings.clone(), gateway)?;

    let cancel = CancellationToken::new();
    let handles = controller.spawn(&cancel);

    let app = api::router(controller.app_state());
    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    info!("listening on {}", settings.listen_addr);
    let shutdown = cancel.clone().cancelled_owned();
    let mut server =
        tokio::spawn(async move { axum::serve(listener, app).with_graceful_shutdown(shutdown).await });

    let mut server_result = Ok(());
    tokio::select! {
        result = &mut server => {
            // The server exiting on its own is a failure.
            server_result = match result {
                Ok(Ok(())) => Err(ControllerError::Watch("server stopped unexpectedly".to_string())),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(ControllerError::Watch(format!("server task panicked: {e}"))),
            };
            cancel.cancel();
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            cancel.cancel();
            if tokio::time::timeout(settings.shutdown_deadline, server).await.is_err() {
                warn!("server did not drain before the shutdown deadline");
            }
        }
    }

    // Give the task tree until the deadline; the cluster reflects
    // ground truth on restart, so abandoned writes are safe.
    if tokio::time::timeout(
        settings.shutdown_deadline,
        futures::future::join_all(handles),
    )
    .await
    .is_err()
    {
        warn!("shutdown deadline exceeded, abandoning in-flight work");
    }
    info!("controller stopped");
    server_result
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler means no clean way to stop; park forever
        // rather than busy-loop.
        std::future::pending::<()>().await;
    }
}
