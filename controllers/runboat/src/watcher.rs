//! Watch demultiplexers.
//!
//! Two long-lived streams feed the controller: workload changes keep
//! the build index current, and job changes drive the job reaper
//! (init-status bookkeeping, auto-start, cleanup completion). Both
//! streams re-list atomically after a drop; a stream error bubbles up
//! so the supervisor restarts the watcher.

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use build_model::labels::{LABEL_BUILD, LABEL_JOB_KIND};
use build_model::{Build, InitStatus, JobKind};
use cluster_gateway::{ClusterGateway, WatchEvent};

use crate::error::ControllerError;
use crate::index::{BuildIndex, JobPhase};
use crate::lifecycle::Lifecycle;

/// Attempts at cleanup before the controller gives up and escalates.
const MAX_CLEANUP_ATTEMPTS: u32 = 3;

/// Keeps the build index in sync with workload state.
pub struct WorkloadWatcher {
    gateway: Arc<dyn ClusterGateway>,
    index: Arc<BuildIndex>,
}

impl WorkloadWatcher {
    pub fn new(gateway: Arc<dyn ClusterGateway>, index: Arc<BuildIndex>) -> Self {
        Self { gateway, index }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let mut stream = self.gateway.watch_workloads();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = stream.next() => event,
            };
            match event {
                Some(Ok(event)) => self.handle(event),
                Some(Err(e)) => return Err(ControllerError::Watch(e.to_string())),
                None => return Err(ControllerError::Watch("workload stream ended".to_string())),
            }
        }
    }

    pub fn handle(&self, event: WatchEvent<Deployment>) {
        match event {
            WatchEvent::Restarted(workloads) => {
                let builds = workloads.iter().filter_map(Build::from_workload).collect();
                self.index.replace_all(builds);
            }
            WatchEvent::Applied(workload) => match Build::from_workload(&workload) {
                Some(build) => self.index.upsert(build),
                None => debug!(
                    workload = workload.metadata.name.as_deref().unwrap_or("?"),
                    "ignoring workload without build identity"
                ),
            },
            WatchEvent::Deleted(workload) => {
                if let Some(name) = build_label(&workload.metadata.labels) {
                    self.index.remove(&name);
                }
            }
        }
    }
}

/// Reacts to job lifecycle: maintains the job table and drives the
/// transitions that follow job completion.
pub struct JobWatcher {
    gateway: Arc<dyn ClusterGateway>,
    index: Arc<BuildIndex>,
    reaper: JobReaper,
}

impl JobWatcher {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        index: Arc<BuildIndex>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        let reaper = JobReaper {
            gateway: gateway.clone(),
            index: index.clone(),
            lifecycle,
            cleanup_attempts: Mutex::new(HashMap::new()),
        };
        Self {
            gateway,
            index,
            reaper,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let mut stream = self.gateway.watch_jobs();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = stream.next() => event,
            };
            match event {
                Some(Ok(event)) => self.handle(event).await,
                Some(Err(e)) => return Err(ControllerError::Watch(e.to_string())),
                None => return Err(ControllerError::Watch("job stream ended".to_string())),
            }
        }
    }

    pub async fn handle(&self, event: WatchEvent<Job>) {
        match event {
            WatchEvent::Restarted(jobs) => {
                let table = jobs.iter().filter_map(job_table_entry).collect();
                self.index.replace_jobs(table);
                // Completions observed while the stream was down must
                // still be acted on.
                for job in &jobs {
                    self.react(job).await;
                }
            }
            WatchEvent::Applied(job) => {
                if let Some((name, kind, phase)) = job_table_entry(&job) {
                    self.index.set_job(&name, kind, phase);
                }
                self.react(&job).await;
            }
            WatchEvent::Deleted(job) => {
                if let Some((name, kind, _)) = job_table_entry(&job) {
                    self.index.remove_job(&name, kind);
                }
            }
        }
    }

    async fn react(&self, job: &Job) {
        if let Err(e) = self.reaper.on_job_event(job).await {
            error!(
                job = job.metadata.name.as_deref().unwrap_or("?"),
                "job event handling failed: {e}"
            );
        }
    }
}

struct JobReaper {
    gateway: Arc<dyn ClusterGateway>,
    index: Arc<BuildIndex>,
    lifecycle: Arc<Lifecycle>,
    cleanup_attempts: Mutex<HashMap<String, u32>>,
}

impl JobReaper {
    async fn on_job_event(&self, job: &Job) -> Result<(), ControllerError> {
        let Some(name) = build_label(&job.metadata.labels) else {
            return Ok(());
        };
        let Some(kind) = job_kind_label(job) else {
            return Ok(());
        };
        // Job events may arrive before the workload event that creates
        // the build, so fall back to a point read.
        let build = match self.index.get(&name) {
            Some(build) => build,
            None => match self.gateway.get_workload(&name).await? {
                Some(workload) => match Build::from_workload(&workload) {
                    Some(build) => {
                        self.index.upsert(build.clone());
                        build
                    }
                    None => return Ok(()),
                },
                None => {
                    warn!(
                        build = %name,
                        job = job.metadata.name.as_deref().unwrap_or("?"),
                        "job event for a build whose workload is gone, deleting leftovers"
                    );
                    self.gateway.delete_by_label(&name).await?;
                    return Ok(());
                }
            },
        };

        match (kind, job_phase(job)) {
            // The annotation patch normally precedes the job, but a
            // concurrent controller's job may be observed first.
            (JobKind::Initialize, JobPhase::Active) => {
                if build.init_status == InitStatus::Todo && !build.deleted {
                    self.lifecycle
                        .set_init_status(&name, InitStatus::Started)
                        .await?;
                }
            }
            (JobKind::Initialize, JobPhase::Succeeded) => {
                if build.init_status != InitStatus::Succeeded {
                    self.lifecycle.on_initialize_succeeded(&build).await?;
                }
            }
            (JobKind::Initialize, JobPhase::Failed) => {
                if build.init_status != InitStatus::Failed {
                    self.lifecycle.on_initialize_failed(&build).await?;
                }
            }
            (JobKind::Cleanup, JobPhase::Active) => {}
            (JobKind::Cleanup, JobPhase::Succeeded) => {
                self.cleanup_attempts.lock().remove(&name);
                self.lifecycle.on_cleanup_succeeded(&name).await?;
            }
            (JobKind::Cleanup, JobPhase::Failed) => {
                let attempts = {
                    let mut attempts = self.cleanup_attempts.lock();
                    let count = attempts.entry(name.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                if attempts < MAX_CLEANUP_ATTEMPTS {
                    warn!(
                        build = %name,
                        attempts,
                        "cleanup job failed, deleting it for another attempt"
                    );
                    // The cleaner recreates the job on its next pass.
                    self.gateway.delete_job(&name, JobKind::Cleanup).await?;
                } else {
                    error!(
                        build = %name,
                        "cleanup keeps failing, leaving resources for operator inspection"
                    );
                }
            }
        }
        Ok(())
    }
}

fn build_label(labels: &Option<std::collections::BTreeMap<String, String>>) -> Option<String> {
    labels.as_ref().and_then(|l| l.get(LABEL_BUILD)).cloned()
}

fn job_kind_label(job: &Job) -> Option<JobKind> {
    job.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_JOB_KIND))
        .and_then(|v| JobKind::from_str(v).ok())
}

fn job_phase(job: &Job) -> JobPhase {
    let status = job.status.as_ref();
    if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        JobPhase::Succeeded
    } else if status.and_then(|s| s.failed).unwrap_or(0) > 0 {
        JobPhase::Failed
    } else {
        // Newly created jobs without status yet count as in flight.
        JobPhase::Active
    }
}

fn job_table_entry(job: &Job) -> Option<(String, JobKind, JobPhase)> {
    let name = build_label(&job.metadata.labels)?;
    let kind = job_kind_label(job)?;
    Some((name, kind, job_phase(job)))
}
