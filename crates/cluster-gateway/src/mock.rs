//! Mock cluster for unit testing
//!
//! An in-memory implementation of [`ClusterGateway`] that behaves like a
//! small fake cluster: bundles materialize objects, mutations emit watch
//! events, finalizers block workload removal. Controller logic can be
//! exercised against it without a running apiserver.
//!
//! What the mock does *not* do is converge replicas: scaling a workload
//! sets the desired count only, and tests call
//! [`MockCluster::converge_workload`] to simulate the deployment
//! controller catching up. This keeps the `starting` state observable.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use build_model::labels::{
    ANNOTATION_GIT_COMMIT, ANNOTATION_INIT_STATUS, ANNOTATION_INIT_STATUS_TIMESTAMP,
    ANNOTATION_LAST_SCALED, ANNOTATION_PR, ANNOTATION_REPO, ANNOTATION_TARGET_BRANCH,
    FINALIZER_CLEANUP, LABEL_BUILD, LABEL_JOB_KIND,
};
use build_model::JobKind;

use crate::bundle::{BundleRequest, BundleVars, DeploymentMode};
use crate::error::GatewayError;
use crate::gateway_trait::{ClusterGateway, WatchEvent, WatchStream};

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct State {
    /// Workloads keyed by build name.
    workloads: BTreeMap<String, Deployment>,
    jobs: BTreeMap<(String, JobKind), Job>,
    /// Auxiliary labelled resources (volume, service, ingress) per build.
    extras: BTreeMap<String, BTreeSet<String>>,
    logs: BTreeMap<(String, Option<JobKind>), String>,
}

/// In-memory fake cluster.
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
    workload_tx: broadcast::Sender<WatchEvent<Deployment>>,
    job_tx: broadcast::Sender<WatchEvent<Job>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        let (workload_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (job_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            workload_tx,
            job_tx,
        }
    }

    fn emit_workload(&self, event: WatchEvent<Deployment>) {
        let _ = self.workload_tx.send(event);
    }

    fn emit_job(&self, event: WatchEvent<Job>) {
        let _ = self.job_tx.send(event);
    }

    fn job_for_vars(vars: &BundleVars, kind: JobKind) -> Job {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_BUILD.to_string(), vars.build_name.clone());
        labels.insert(LABEL_JOB_KIND.to_string(), kind.as_str().to_string());
        Job {
            metadata: ObjectMeta {
                name: Some(format!("{}-{kind}", vars.build_name)),
                labels: Some(labels),
                creation_timestamp: Some(Time(Utc::now())),
                ..Default::default()
            },
            status: Some(JobStatus {
                active: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn workload_for_vars(vars: &BundleVars) -> Deployment {
        let now = Utc::now();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_BUILD.to_string(), vars.build_name.clone());
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_REPO.to_string(), vars.repo.clone());
        annotations.insert(
            ANNOTATION_TARGET_BRANCH.to_string(),
            vars.target_branch.clone(),
        );
        if let Some(pr) = vars.pr {
            annotations.insert(ANNOTATION_PR.to_string(), pr.to_string());
        }
        annotations.insert(ANNOTATION_GIT_COMMIT.to_string(), vars.git_commit.clone());
        annotations.insert(ANNOTATION_INIT_STATUS.to_string(), "todo".to_string());
        annotations.insert(
            ANNOTATION_INIT_STATUS_TIMESTAMP.to_string(),
            now.to_rfc3339(),
        );
        annotations.insert(ANNOTATION_LAST_SCALED.to_string(), now.to_rfc3339());
        Deployment {
            metadata: ObjectMeta {
                name: Some(vars.build_name.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                finalizers: Some(vec![FINALIZER_CLEANUP.to_string()]),
                creation_timestamp: Some(Time(now)),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(0),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "build".to_string(),
                            image: Some(format!("{}:{}", vars.image_name, vars.image_tag)),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                available_replicas: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // ---- test setup / inspection helpers ----

    pub fn workload(&self, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().workloads.get(name).cloned()
    }

    pub fn workload_names(&self) -> Vec<String> {
        self.state.lock().unwrap().workloads.keys().cloned().collect()
    }

    /// Snapshot of all workloads, for crash-recovery equivalence checks.
    pub fn workloads(&self) -> Vec<Deployment> {
        self.state.lock().unwrap().workloads.values().cloned().collect()
    }

    pub fn job(&self, name: &str, kind: JobKind) -> Option<Job> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&(name.to_string(), kind))
            .cloned()
    }

    /// Simulates the deployment controller converging observed replicas
    /// to the desired count.
    pub fn converge_workload(&self, name: &str) {
        let updated = {
            let mut state = self.state.lock().unwrap();
            let Some(workload) = state.workloads.get_mut(name) else {
                return;
            };
            let desired = workload.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            workload.status = Some(DeploymentStatus {
                available_replicas: Some(desired),
                ..Default::default()
            });
            workload.clone()
        };
        self.emit_workload(WatchEvent::Applied(updated));
    }

    /// Marks a job terminal and emits the corresponding watch event.
    pub fn complete_job(&self, name: &str, kind: JobKind, success: bool) {
        let updated = {
            let mut state = self.state.lock().unwrap();
            let Some(job) = state.jobs.get_mut(&(name.to_string(), kind)) else {
                return;
            };
            job.status = Some(JobStatus {
                active: None,
                succeeded: success.then_some(1),
                failed: (!success).then_some(1),
                ..Default::default()
            });
            job.clone()
        };
        self.emit_job(WatchEvent::Applied(updated));
    }

    pub fn set_log(&self, name: &str, kind: Option<JobKind>, text: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert((name.to_string(), kind), text.to_string());
    }

    /// Number of resources still labelled with the build name; zero
    /// means cleanup is complete.
    pub fn labeled_resource_count(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        let workloads = usize::from(state.workloads.contains_key(name));
        let jobs = state.jobs.keys().filter(|(n, _)| n == name).count();
        let extras = state.extras.get(name).map(BTreeSet::len).unwrap_or(0);
        workloads + jobs + extras
    }
}

#[async_trait::async_trait]
impl ClusterGateway for MockCluster {
    fn watch_workloads(&self) -> WatchStream<Deployment> {
        // Subscribe before snapshotting so no event falls in the gap;
        // a duplicate Applied after the snapshot is harmless.
        let rx = self.workload_tx.subscribe();
        let snapshot: Vec<Deployment> = self.state.lock().unwrap().workloads.values().cloned().collect();
        Box::pin(
            stream::iter(vec![Ok(WatchEvent::Restarted(snapshot))]).chain(live_events(rx)),
        )
    }

    fn watch_jobs(&self) -> WatchStream<Job> {
        let rx = self.job_tx.subscribe();
        let snapshot: Vec<Job> = self.state.lock().unwrap().jobs.values().cloned().collect();
        Box::pin(
            stream::iter(vec![Ok(WatchEvent::Restarted(snapshot))]).chain(live_events(rx)),
        )
    }

    async fn get_workload(&self, name: &str) -> Result<Option<Deployment>, GatewayError> {
        Ok(self.workload(name))
    }

    async fn patch_workload_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), GatewayError> {
        let updated = {
            let mut state = self.state.lock().unwrap();
            let workload = state
                .workloads
                .get_mut(name)
                .ok_or_else(|| GatewayError::NotFound(format!("no workload for build {name}")))?;
            let existing = workload.metadata.annotations.get_or_insert_with(Default::default);
            for (key, value) in annotations {
                existing.insert(key, value);
            }
            workload.clone()
        };
        self.emit_workload(WatchEvent::Applied(updated));
        Ok(())
    }

    async fn scale_workload(&self, name: &str, replicas: i32) -> Result<(), GatewayError> {
        let updated = {
            let mut state = self.state.lock().unwrap();
            let workload = state
                .workloads
                .get_mut(name)
                .ok_or_else(|| GatewayError::NotFound(format!("no workload for build {name}")))?;
            workload.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            workload.clone()
        };
        self.emit_workload(WatchEvent::Applied(updated));
        Ok(())
    }

    async fn apply_bundle(&self, request: &BundleRequest) -> Result<(), GatewayError> {
        let vars = &request.vars;
        if vars.build_name.is_empty() {
            return Err(GatewayError::Manifest("bundle without build name".to_string()));
        }
        match vars.mode {
            DeploymentMode::Deployment => {
                let workload = Self::workload_for_vars(vars);
                {
                    let mut state = self.state.lock().unwrap();
                    state.workloads.insert(vars.build_name.clone(), workload.clone());
                    state
                        .extras
                        .entry(vars.build_name.clone())
                        .or_default()
                        .insert(format!("pvc/{}", vars.build_name));
                }
                self.emit_workload(WatchEvent::Applied(workload));
            }
            DeploymentMode::Initialization | DeploymentMode::Cleanup => {
                let kind = vars.mode.job_kind().expect("job mode");
                let job = Self::job_for_vars(vars, kind);
                self.state
                    .lock()
                    .unwrap()
                    .jobs
                    .insert((vars.build_name.clone(), kind), job.clone());
                self.emit_job(WatchEvent::Applied(job));
            }
            DeploymentMode::Start => {
                let mut state = self.state.lock().unwrap();
                let extras = state.extras.entry(vars.build_name.clone()).or_default();
                extras.insert(format!("service/{}", vars.build_name));
                extras.insert(format!("ingress/{}", vars.build_name));
            }
            // The default stop bundle is empty: start-time resources
            // are labelled and go away with the build.
            DeploymentMode::Stop => {}
        }
        Ok(())
    }

    async fn delete_workload(&self, name: &str) -> Result<(), GatewayError> {
        enum Outcome {
            Marked(Deployment),
            Removed(Deployment),
            Absent,
        }
        let outcome = {
            let mut state = self.state.lock().unwrap();
            match state.workloads.get_mut(name) {
                None => Outcome::Absent,
                Some(workload) => {
                    let has_finalizers = workload
                        .metadata
                        .finalizers
                        .as_ref()
                        .is_some_and(|f| !f.is_empty());
                    if has_finalizers {
                        if workload.metadata.deletion_timestamp.is_none() {
                            workload.metadata.deletion_timestamp = Some(Time(Utc::now()));
                        }
                        Outcome::Marked(workload.clone())
                    } else {
                        let removed = state.workloads.remove(name).expect("present");
                        Outcome::Removed(removed)
                    }
                }
            }
        };
        match outcome {
            Outcome::Marked(w) => self.emit_workload(WatchEvent::Applied(w)),
            Outcome::Removed(w) => self.emit_workload(WatchEvent::Deleted(w)),
            Outcome::Absent => {}
        }
        Ok(())
    }

    async fn delete_by_label(&self, name: &str) -> Result<(), GatewayError> {
        let removed_jobs: Vec<Job> = {
            let mut state = self.state.lock().unwrap();
            state.extras.remove(name);
            let keys: Vec<(String, JobKind)> = state
                .jobs
                .keys()
                .filter(|(n, _)| n == name)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| state.jobs.remove(&k))
                .collect()
        };
        for job in removed_jobs {
            self.emit_job(WatchEvent::Deleted(job));
        }
        self.delete_workload(name).await
    }

    async fn delete_job(&self, name: &str, kind: JobKind) -> Result<(), GatewayError> {
        let removed = self
            .state
            .lock()
            .unwrap()
            .jobs
            .remove(&(name.to_string(), kind));
        if let Some(job) = removed {
            self.emit_job(WatchEvent::Deleted(job));
        }
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), GatewayError> {
        enum Outcome {
            Updated(Deployment),
            Removed(Deployment),
            Absent,
        }
        let outcome = {
            let mut state = self.state.lock().unwrap();
            match state.workloads.get_mut(name) {
                None => Outcome::Absent,
                Some(workload) => {
                    if let Some(finalizers) = workload.metadata.finalizers.as_mut() {
                        finalizers.retain(|f| f != finalizer);
                    }
                    let now_empty = workload
                        .metadata
                        .finalizers
                        .as_ref()
                        .is_none_or(|f| f.is_empty());
                    if workload.metadata.deletion_timestamp.is_some() && now_empty {
                        let removed = state.workloads.remove(name).expect("present");
                        Outcome::Removed(removed)
                    } else {
                        Outcome::Updated(state.workloads[name].clone())
                    }
                }
            }
        };
        match outcome {
            Outcome::Updated(w) => self.emit_workload(WatchEvent::Applied(w)),
            Outcome::Removed(w) => self.emit_workload(WatchEvent::Deleted(w)),
            Outcome::Absent => {}
        }
        Ok(())
    }

    async fn read_log(
        &self,
        name: &str,
        kind: Option<JobKind>,
        _tail_lines: Option<i64>,
    ) -> Result<Option<String>, GatewayError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(&(name.to_string(), kind))
            .cloned())
    }
}

fn live_events<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<WatchEvent<T>>,
) -> impl futures::Stream<Item = Result<WatchEvent<T>, GatewayError>> + Send {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Some((
                        Err(GatewayError::Watch("mock watch lagged".to_string())),
                        rx,
                    ))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}
