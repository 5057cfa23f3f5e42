//! Unit tests for lifecycle commands against the mock cluster.

use build_model::{BuildStatus, CommitInfo, InitStatus};

use crate::error::ControllerError;
use crate::index::{BuildFilter, BuildIndex};
use crate::test_utils::{sync_build as sync, test_harness};

fn commit(sha_char: char) -> CommitInfo {
    CommitInfo::new("acme/svc", "main", None, &sha_char.to_string().repeat(40))
}

fn mark_ready(index: &BuildIndex) {
    index.replace_all(Vec::new());
}

#[tokio::test]
async fn deploy_creates_a_todo_build() {
    let (cluster, index, lifecycle) = test_harness();
    mark_ready(&index);

    let name = lifecycle.deploy(commit('a')).await.unwrap();
    let build = sync(&cluster, &index, &name);
    assert_eq!(build.status(), BuildStatus::Todo);
    assert_eq!(build.desired_replicas, 0);
    assert_eq!(build.image, "img:1");
}

#[tokio::test]
async fn deploy_rejects_unknown_repo_and_bad_input() {
    let (_cluster, index, lifecycle) = test_harness();
    mark_ready(&index);

    let unknown = CommitInfo::new("other/repo", "main", None, &"a".repeat(40));
    assert!(matches!(
        lifecycle.deploy(unknown).await,
        Err(ControllerError::Rejected(_))
    ));

    let short_sha = CommitInfo::new("acme/svc", "main", None, "abc123");
    assert!(matches!(
        lifecycle.deploy(short_sha).await,
        Err(ControllerError::Rejected(_))
    ));

    let zero_pr = CommitInfo::new("acme/svc", "main", Some(0), &"a".repeat(40));
    assert!(matches!(
        lifecycle.deploy(zero_pr).await,
        Err(ControllerError::Rejected(_))
    ));
}

#[tokio::test]
async fn duplicate_deploy_conflicts_but_webhook_path_ignores_it() {
    let (cluster, index, lifecycle) = test_harness();
    mark_ready(&index);

    let name = lifecycle.deploy(commit('a')).await.unwrap();
    sync(&cluster, &index, &name);
    assert!(matches!(
        lifecycle.deploy(commit('a')).await,
        Err(ControllerError::Conflict(_))
    ));
    lifecycle.deploy_or_ignore(commit('a')).await.unwrap();
}

#[tokio::test]
async fn commands_before_initial_list_report_unavailable() {
    let (_cluster, _index, lifecycle) = test_harness();
    assert!(matches!(
        lifecycle.deploy(commit('a')).await,
        Err(ControllerError::Unavailable)
    ));
    assert!(matches!(
        lifecycle.start("whatever").await,
        Err(ControllerError::Unavailable)
    ));
}

#[tokio::test]
async fn commands_on_missing_builds_are_not_found() {
    let (_cluster, index, lifecycle) = test_harness();
    mark_ready(&index);
    for result in [
        lifecycle.start("nope").await,
        lifecycle.stop("nope").await,
        lifecycle.reset("nope").await,
        lifecycle.undeploy("nope").await,
    ] {
        assert!(matches!(result, Err(ControllerError::NotFound(_))));
    }
}

#[tokio::test]
async fn start_scales_a_stopped_build_and_requeues_a_failed_one() {
    let (cluster, index, lifecycle) = test_harness();
    mark_ready(&index);
    let name = lifecycle.deploy(commit('a')).await.unwrap();

    // Stopped: init succeeded, replicas 0.
    lifecycle
        .set_init_status(&name, InitStatus::Succeeded)
        .await
        .unwrap();
    let build = sync(&cluster, &index, &name);
    assert_eq!(build.status(), BuildStatus::Stopped);
    lifecycle.start(&name).await.unwrap();
    let build = sync(&cluster, &index, &name);
    assert_eq!(build.desired_replicas, 1);
    assert_eq!(build.status(), BuildStatus::Starting);

    // Failed: start re-queues initialization instead of scaling.
    lifecycle
        .set_init_status(&name, InitStatus::Failed)
        .await
        .unwrap();
    cluster.converge_workload(&name);
    lifecycle.stop(&name).await.unwrap();
    sync(&cluster, &index, &name);
    lifecycle.start(&name).await.unwrap();
    let build = sync(&cluster, &index, &name);
    assert_eq!(build.init_status, InitStatus::Todo);
    assert_eq!(build.status(), BuildStatus::Todo);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (cluster, index, lifecycle) = test_harness();
    mark_ready(&index);
    let name = lifecycle.deploy(commit('a')).await.unwrap();
    lifecycle
        .set_init_status(&name, InitStatus::Succeeded)
        .await
        .unwrap();
    sync(&cluster, &index, &name);
    lifecycle.start(&name).await.unwrap();
    let started = sync(&cluster, &index, &name);

    lifecycle.stop(&name).await.unwrap();
    let stopped = sync(&cluster, &index, &name);
    assert_eq!(stopped.desired_replicas, 0);
    assert!(stopped.last_scaled_at > started.created_at);

    // A second stop changes nothing, including the scaling timestamp.
    lifecycle.stop(&name).await.unwrap();
    let again = sync(&cluster, &index, &name);
    assert_eq!(again, stopped);
}

#[tokio::test]
async fn undeploy_marks_for_deletion_and_repeats_harmlessly() {
    let (cluster, index, lifecycle) = test_harness();
    mark_ready(&index);
    let name = lifecycle.deploy(commit('a')).await.unwrap();
    sync(&cluster, &index, &name);

    lifecycle.undeploy(&name).await.unwrap();
    let build = sync(&cluster, &index, &name);
    assert!(build.deleted);
    assert_eq!(build.status(), BuildStatus::Cleaning);

    lifecycle.undeploy(&name).await.unwrap();
    assert_eq!(sync(&cluster, &index, &name), build);

    // Further user commands are refused while cleaning.
    assert!(matches!(
        lifecycle.start(&name).await,
        Err(ControllerError::Conflict(_))
    ));
    assert!(matches!(
        lifecycle.reset(&name).await,
        Err(ControllerError::Conflict(_))
    ));
}

#[tokio::test]
async fn undeploy_all_matches_the_filter() {
    let (cluster, index, lifecycle) = test_harness();
    mark_ready(&index);
    let branch_name = lifecycle.deploy(commit('a')).await.unwrap();
    let pr_commit = CommitInfo::new("acme/svc", "main", Some(7), &"b".repeat(40));
    let pr_name = lifecycle.deploy(pr_commit).await.unwrap();
    sync(&cluster, &index, &branch_name);
    sync(&cluster, &index, &pr_name);

    lifecycle
        .undeploy_all(&BuildFilter {
            repo: Some("acme/svc".to_string()),
            pr: Some(7),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(sync(&cluster, &index, &pr_name).deleted);
    assert!(!sync(&cluster, &index, &branch_name).deleted);
}

#[tokio::test]
async fn reset_requeues_initialization() {
    let (cluster, index, lifecycle) = test_harness();
    mark_ready(&index);
    let name = lifecycle.deploy(commit('a')).await.unwrap();
    lifecycle
        .set_init_status(&name, InitStatus::Succeeded)
        .await
        .unwrap();
    sync(&cluster, &index, &name);
    lifecycle.start(&name).await.unwrap();
    sync(&cluster, &index, &name);

    lifecycle.reset(&name).await.unwrap();
    let build = sync(&cluster, &index, &name);
    assert_eq!(build.init_status, InitStatus::Todo);
    assert_eq!(build.desired_replicas, 0);
}
