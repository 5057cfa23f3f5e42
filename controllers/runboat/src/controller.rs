//! Controller assembly and task supervision.
//!
//! One controller object owns the index, the lifecycle and the gateway,
//! and spawns the long-lived task tree: two watch demultiplexers and
//! four reconcilers. Every task runs under a supervisor that logs
//! failures and restarts the task after a delay; a dropped watch stream
//! is never fatal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cluster_gateway::ClusterGateway;

use crate::api::AppState;
use crate::error::ControllerError;
use crate::github::GithubClient;
use crate::index::BuildIndex;
use crate::lifecycle::Lifecycle;
use crate::reconciler::cleaner::Cleaner;
use crate::reconciler::initializer::Initializer;
use crate::reconciler::stopper::Stopper;
use crate::reconciler::undeployer::Undeployer;
use crate::settings::Settings;
use crate::watcher::{JobWatcher, WorkloadWatcher};

/// Delay before restarting a failed watcher or reconciler.
const RESTART_DELAY: Duration = Duration::from_secs(5);

pub struct Controller {
    pub settings: Arc<Settings>,
    pub gateway: Arc<dyn ClusterGateway>,
    pub index: Arc<BuildIndex>,
    pub lifecycle: Arc<Lifecycle>,
    pub github: Arc<GithubClient>,
}

impl Controller {
    pub fn new(
        settings: Arc<Settings>,
        gateway: Arc<dyn ClusterGateway>,
    ) -> Result<Self, ControllerError> {
        let github = Arc::new(
            GithubClient::new(settings.github_token.clone())
                .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?,
        );
        let index = Arc::new(BuildIndex::new());
        let lifecycle = Arc::new(Lifecycle::new(
            settings.clone(),
            gateway.clone(),
            index.clone(),
            Some(github.clone()),
        )?);
        Ok(Self {
            settings,
            gateway,
            index,
            lifecycle,
            github,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            settings: self.settings.clone(),
            index: self.index.clone(),
            lifecycle: self.lifecycle.clone(),
            gateway: self.gateway.clone(),
            github: self.github.clone(),
        }
    }

    /// Spawns the watcher and reconciler tasks. They run until the
    /// token is cancelled.
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let workload_watcher = Arc::new(WorkloadWatcher::new(
            self.gateway.clone(),
            self.index.clone(),
        ));
        let job_watcher = Arc::new(JobWatcher::new(
            self.gateway.clone(),
            self.index.clone(),
            self.lifecycle.clone(),
        ));
        let initializer = Arc::new(Initializer::new(
            self.index.clone(),
            self.lifecycle.clone(),
            self.settings.max_initializing,
        ));
        let cleaner = Arc::new(Cleaner::new(self.index.clone(), self.lifecycle.clone()));
        let stopper = Arc::new(Stopper::new(
            self.index.clone(),
            self.lifecycle.clone(),
            self.settings.max_started,
        ));
        let undeployer = Arc::new(Undeployer::new(
            self.index.clone(),
            self.lifecycle.clone(),
            self.settings.max_deployed,
        ));

        vec![
            spawn_supervised("workload-watcher", cancel.clone(), move |cancel| {
                let watcher = workload_watcher.clone();
                async move { watcher.run(cancel).await }
            }),
            spawn_supervised("job-watcher", cancel.clone(), move |cancel| {
                let watcher = job_watcher.clone();
                async move { watcher.run(cancel).await }
            }),
            spawn_supervised("initializer", cancel.clone(), move |cancel| {
                let initializer = initializer.clone();
                async move { initializer.run(cancel).await }
            }),
            spawn_supervised("cleaner", cancel.clone(), move |cancel| {
                let cleaner = cleaner.clone();
                async move { cleaner.run(cancel).await }
            }),
            spawn_supervised("stopper", cancel.clone(), move |cancel| {
                let stopper = stopper.clone();
                async move { stopper.run(cancel).await }
            }),
            spawn_supervised("undeployer", cancel.clone(), move |cancel| {
                let undeployer = undeployer.clone();
                async move { undeployer.run(cancel).await }
            }),
        ]
    }
}

/// Runs a task in a loop: a failure is logged and the task restarts
/// after a delay, so a single bad pass or dropped stream never takes
/// the process down.
fn spawn_supervised<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    task: F,
) -> JoinHandle<()>
where
    F: Fn(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ControllerError>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            info!("starting {name}");
            if let Err(e) = task(cancel.clone()).await {
                error!("{name} failed: {e}, restarting in {}s", RESTART_DELAY.as_secs());
            }
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
        info!("{name} stopped");
    })
}
