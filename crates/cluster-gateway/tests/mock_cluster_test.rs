//! Behavioral tests for the mock cluster.
//!
//! The mock stands in for the apiserver in controller tests, so its
//! lifecycle semantics (finalizers, label deletion, watch events) must
//! match what the real gateway observes from a cluster.

use futures::StreamExt;
use std::collections::BTreeMap;

use build_model::labels::FINALIZER_CLEANUP;
use build_model::{Build, BuildStatus, CommitInfo, InitStatus, JobKind};
use cluster_gateway::{
    BundleRequest, BundleVars, ClusterGateway, DeploymentMode, MockCluster, WatchEvent,
};

fn commit() -> CommitInfo {
    CommitInfo::new("acme/svc", "main", None, &"a".repeat(40))
}

fn request(mode: DeploymentMode) -> BundleRequest {
    BundleRequest {
        kubefiles_path: "/unused".into(),
        vars: BundleVars::new(
            "runboat-builds",
            mode,
            "acme-svc-main-aaaaaaaa",
            "builds.example.com",
            &commit(),
            "img:1",
            BTreeMap::new(),
            BTreeMap::new(),
            BTreeMap::new(),
        ),
    }
}

const NAME: &str = "acme-svc-main-aaaaaaaa";

#[tokio::test]
async fn deployment_bundle_creates_a_managed_workload() {
    let cluster = MockCluster::new();
    cluster
        .apply_bundle(&request(DeploymentMode::Deployment))
        .await
        .unwrap();

    let workload = cluster.workload(NAME).expect("workload created");
    let build = Build::from_workload(&workload).expect("parseable build");
    assert_eq!(build.name, NAME);
    assert_eq!(build.init_status, InitStatus::Todo);
    assert_eq!(build.desired_replicas, 0);
    assert_eq!(build.status(), BuildStatus::Todo);
    assert!(workload
        .metadata
        .finalizers
        .unwrap()
        .contains(&FINALIZER_CLEANUP.to_string()));
}

#[tokio::test]
async fn watch_starts_with_a_snapshot_and_streams_changes() {
    let cluster = MockCluster::new();
    cluster
        .apply_bundle(&request(DeploymentMode::Deployment))
        .await
        .unwrap();

    let mut watch = cluster.watch_workloads();
    match watch.next().await.unwrap().unwrap() {
        WatchEvent::Restarted(items) => assert_eq!(items.len(), 1),
        other => panic!("expected snapshot, got {other:?}"),
    }

    cluster.scale_workload(NAME, 1).await.unwrap();
    match watch.next().await.unwrap().unwrap() {
        WatchEvent::Applied(workload) => {
            assert_eq!(workload.spec.unwrap().replicas, Some(1));
        }
        other => panic!("expected applied event, got {other:?}"),
    }
}

#[tokio::test]
async fn scaling_does_not_converge_observed_replicas() {
    let cluster = MockCluster::new();
    cluster
        .apply_bundle(&request(DeploymentMode::Deployment))
        .await
        .unwrap();
    cluster.scale_workload(NAME, 1).await.unwrap();

    let build = Build::from_workload(&cluster.workload(NAME).unwrap()).unwrap();
    assert_eq!(build.desired_replicas, 1);
    assert_eq!(build.observed_replicas, 0);

    cluster.converge_workload(NAME);
    let build = Build::from_workload(&cluster.workload(NAME).unwrap()).unwrap();
    assert_eq!(build.observed_replicas, 1);
}

#[tokio::test]
async fn initialization_bundle_creates_a_labelled_job() {
    let cluster = MockCluster::new();
    cluster
        .apply_bundle(&request(DeploymentMode::Initialization))
        .await
        .unwrap();

    let job = cluster.job(NAME, JobKind::Initialize).expect("init job");
    assert_eq!(job.status.as_ref().unwrap().active, Some(1));

    cluster.complete_job(NAME, JobKind::Initialize, true);
    let job = cluster.job(NAME, JobKind::Initialize).unwrap();
    assert_eq!(job.status.as_ref().unwrap().succeeded, Some(1));
}

#[tokio::test]
async fn finalizer_blocks_workload_removal_until_removed() {
    let cluster = MockCluster::new();
    cluster
        .apply_bundle(&request(DeploymentMode::Deployment))
        .await
        .unwrap();

    cluster.delete_workload(NAME).await.unwrap();
    let workload = cluster.workload(NAME).expect("still present");
    assert!(workload.metadata.deletion_timestamp.is_some());

    cluster.remove_finalizer(NAME, FINALIZER_CLEANUP).await.unwrap();
    assert!(cluster.workload(NAME).is_none());
}

#[tokio::test]
async fn delete_by_label_removes_everything_but_respects_the_finalizer() {
    let cluster = MockCluster::new();
    cluster
        .apply_bundle(&request(DeploymentMode::Deployment))
        .await
        .unwrap();
    cluster
        .apply_bundle(&request(DeploymentMode::Start))
        .await
        .unwrap();
    cluster
        .apply_bundle(&request(DeploymentMode::Cleanup))
        .await
        .unwrap();
    assert!(cluster.labeled_resource_count(NAME) > 1);

    cluster.delete_by_label(NAME).await.unwrap();
    // Everything except the finalized workload is gone.
    assert_eq!(cluster.labeled_resource_count(NAME), 1);

    cluster.remove_finalizer(NAME, FINALIZER_CLEANUP).await.unwrap();
    assert_eq!(cluster.labeled_resource_count(NAME), 0);
}

#[tokio::test]
async fn commands_are_idempotent_on_absent_resources() {
    let cluster = MockCluster::new();
    // Deleting things that do not exist must not error.
    cluster.delete_workload(NAME).await.unwrap();
    cluster.delete_by_label(NAME).await.unwrap();
    cluster.delete_job(NAME, JobKind::Initialize).await.unwrap();
    cluster.remove_finalizer(NAME, FINALIZER_CLEANUP).await.unwrap();
    assert!(cluster.get_workload(NAME).await.unwrap().is_none());
}

#[tokio::test]
async fn logs_are_keyed_by_job_kind() {
    let cluster = MockCluster::new();
    cluster.set_log(NAME, Some(JobKind::Initialize), "init output");
    cluster.set_log(NAME, None, "app output");

    let init = cluster
        .read_log(NAME, Some(JobKind::Initialize), None)
        .await
        .unwrap();
    assert_eq!(init.as_deref(), Some("init output"));
    let app = cluster.read_log(NAME, None, None).await.unwrap();
    assert_eq!(app.as_deref(), Some("app output"));
    let cleanup = cluster.read_log(NAME, Some(JobKind::Cleanup), None).await.unwrap();
    assert!(cleanup.is_none());
}
