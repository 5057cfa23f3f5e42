//! Test utilities shared by the controller's unit tests.

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use chrono::Utc;

#[cfg(test)]
use build_model::{Build, CommitInfo, InitStatus};
#[cfg(test)]
use cluster_gateway::MockCluster;

#[cfg(test)]
use crate::index::BuildIndex;
#[cfg(test)]
use crate::lifecycle::Lifecycle;
#[cfg(test)]
use crate::settings::Settings;

/// A build with fixed identity and configurable state.
#[cfg(test)]
pub fn test_build(name: &str, init_status: InitStatus, desired: i32, observed: i32) -> Build {
    let now = Utc::now();
    Build {
        name: name.to_string(),
        commit: CommitInfo::new("acme/svc", "main", None, &"a".repeat(40)),
        image: "img:1".to_string(),
        init_status,
        init_status_at: now,
        desired_replicas: desired,
        observed_replicas: observed,
        deleted: false,
        created_at: now,
        last_scaled_at: now,
    }
}

/// Settings accepting `acme/svc` on any branch, with small capacity
/// limits so eviction is easy to trigger.
#[cfg(test)]
pub fn test_settings() -> Settings {
    test_settings_with(|_| {})
}

#[cfg(test)]
pub fn test_settings_with(adjust: impl FnOnce(&mut HashMap<String, String>)) -> Settings {
    let mut vars = HashMap::new();
    vars.insert(
        "RUNBOAT_REPOS".to_string(),
        r#"[{"repo": "acme/.*", "branch": ".*", "builds": [{"image": "img:1"}]}]"#.to_string(),
    );
    vars.insert("RUNBOAT_BUILD_NAMESPACE".to_string(), "runboat-builds".to_string());
    vars.insert("RUNBOAT_BUILD_DOMAIN".to_string(), "builds.example.com".to_string());
    vars.insert("RUNBOAT_API_ADMIN_USER".to_string(), "admin".to_string());
    vars.insert("RUNBOAT_API_ADMIN_PASSWD".to_string(), "secret".to_string());
    vars.insert(
        "RUNBOAT_DISABLE_COMMIT_STATUSES".to_string(),
        "true".to_string(),
    );
    adjust(&mut vars);
    Settings::from_vars(&vars).expect("test settings are valid")
}

/// A mock cluster with an index and lifecycle wired to it. Watchers are
/// not running; tests either pump events by hand or spawn the
/// controller tasks.
#[cfg(test)]
pub fn test_harness() -> (Arc<MockCluster>, Arc<BuildIndex>, Arc<Lifecycle>) {
    test_harness_with(test_settings())
}

#[cfg(test)]
pub fn test_harness_with(
    settings: Settings,
) -> (Arc<MockCluster>, Arc<BuildIndex>, Arc<Lifecycle>) {
    let cluster = Arc::new(MockCluster::new());
    let index = Arc::new(BuildIndex::new());
    let lifecycle = Arc::new(
        Lifecycle::new(Arc::new(settings), cluster.clone(), index.clone(), None)
            .expect("test settings compile"),
    );
    (cluster, index, lifecycle)
}

/// Mirrors what the workload watcher would do: read the workload back
/// from the cluster into the index. For tests that do not run watchers.
#[cfg(test)]
pub fn sync_build(cluster: &MockCluster, index: &BuildIndex, name: &str) -> Build {
    let workload = cluster.workload(name).expect("workload exists");
    let build = Build::from_workload(&workload).expect("managed workload");
    index.upsert(build.clone());
    build
}

/// Polls until the condition holds. Panics after the timeout; intended
/// for paused-clock tests where sleeps auto-advance.
#[cfg(test)]
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {what}");
}
