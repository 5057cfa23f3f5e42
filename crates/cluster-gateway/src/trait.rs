//! ClusterGateway trait for mocking
//!
//! This trait abstracts cluster access to enable mocking in unit tests.
//! The concrete [`crate::KubeGateway`] implements it against a real
//! cluster; [`crate::mock::MockCluster`] simulates one in memory.

use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use std::collections::BTreeMap;

use build_model::JobKind;

use crate::bundle::BundleRequest;
use crate::error::GatewayError;

/// One observed change on a watched resource kind.
///
/// `Restarted` carries the full current set after an initial list or a
/// stale-cursor re-list; consumers must replace their state atomically.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Restarted(Vec<T>),
    Applied(T),
    Deleted(T),
}

pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, GatewayError>>;

/// Everything the controller needs from the cluster.
///
/// All async methods must be `Send` to work with Tokio's work-stealing
/// runtime. Mutations are idempotent; concurrent writers are resolved by
/// the cluster's optimistic concurrency.
#[async_trait::async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Watches managed workloads in the build namespace. The stream ends
    /// only on unrecoverable errors; the caller re-establishes it.
    fn watch_workloads(&self) -> WatchStream<Deployment>;

    /// Watches managed jobs in the build namespace.
    fn watch_jobs(&self) -> WatchStream<Job>;

    /// Point read of a build's workload by label, for when job events
    /// outrun workload events.
    async fn get_workload(&self, name: &str) -> Result<Option<Deployment>, GatewayError>;

    /// Merge-patches annotations onto a build's workload.
    async fn patch_workload_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), GatewayError>;

    /// Sets the workload's desired replica count.
    async fn scale_workload(&self, name: &str, replicas: i32) -> Result<(), GatewayError>;

    /// Renders the requested bundle and server-side applies every
    /// resource in it. Each applied resource bears the build label.
    async fn apply_bundle(&self, request: &BundleRequest) -> Result<(), GatewayError>;

    /// Deletes the workload. The cleanup finalizer keeps it around (with
    /// a deletion timestamp) until cleanup has run.
    async fn delete_workload(&self, name: &str) -> Result<(), GatewayError>;

    /// Deletes every resource labelled with the build name.
    async fn delete_by_label(&self, name: &str) -> Result<(), GatewayError>;

    /// Deletes a build's init or cleanup job and its pods.
    async fn delete_job(&self, name: &str, kind: JobKind) -> Result<(), GatewayError>;

    /// Removes a finalizer from the build's workload.
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), GatewayError>;

    /// Tail of the most recent pod log for the build (`kind: None`) or
    /// one of its jobs. `None` when no matching pod exists.
    async fn read_log(
        &self,
        name: &str,
        kind: Option<JobKind>,
        tail_lines: Option<i64>,
    ) -> Result<Option<String>, GatewayError>;
}
