//! In-memory index of builds.
//!
//! Maintained up to date from the cluster watch streams; this is the
//! only shared mutable structure in the process. Only the watch
//! demultiplexer writes; everything else reads snapshots, so a race
//! against the cluster merely delays a decision to the next pass.
//!
//! Every change that alters a build is published on a broadcast channel
//! for the reconcilers and SSE subscribers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use build_model::{Build, BuildStatus, InitStatus, JobKind};

use crate::events::{BuildChange, BuildEventKind, EVENT_CHANNEL_CAPACITY};

/// Observed phase of an init or cleanup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Active,
    Succeeded,
    Failed,
}

/// Filter for list and stream queries.
#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    pub repo: Option<String>,
    pub target_branch: Option<String>,
    /// Like `target_branch`, but excludes pull request builds.
    pub branch: Option<String>,
    pub pr: Option<u64>,
    pub name: Option<String>,
    pub status: Option<BuildStatus>,
}

impl BuildFilter {
    pub fn matches(&self, build: &Build) -> bool {
        if let Some(repo) = &self.repo {
            if !build.commit.repo.eq_ignore_ascii_case(repo) {
                return false;
            }
        }
        if let Some(target_branch) = &self.target_branch {
            if &build.commit.target_branch != target_branch {
                return false;
            }
        }
        if let Some(branch) = &self.branch {
            if &build.commit.target_branch != branch || build.commit.pr.is_some() {
                return false;
            }
        }
        if let Some(pr) = self.pr {
            if build.commit.pr != Some(pr) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &build.name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if build.status() != status {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct Inner {
    builds: BTreeMap<String, Build>,
    jobs: BTreeMap<(String, JobKind), JobPhase>,
}

/// The build index.
pub struct BuildIndex {
    inner: RwLock<Inner>,
    /// False until the first workload list has been applied; reads
    /// before that report the controller as warming.
    ready: AtomicBool,
    events: broadcast::Sender<BuildChange>,
}

impl Default for BuildIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildIndex {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            ready: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildChange> {
        self.events.subscribe()
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn publish(&self, kind: BuildEventKind, build: Build) {
        let _ = self.events.send(BuildChange { kind, build });
    }

    // ---- writes (watch demultiplexer only) ----

    /// Inserts or updates a build. No event is published when nothing
    /// changed, so watch echoes of our own writes stay quiet.
    pub fn upsert(&self, build: Build) {
        let changed = {
            let mut inner = self.inner.write();
            match inner.builds.get(&build.name) {
                Some(existing) if existing == &build => false,
                _ => {
                    inner.builds.insert(build.name.clone(), build.clone());
                    true
                }
            }
        };
        if changed {
            info!(
                build = %build.name,
                status = %build.status(),
                init_status = %build.init_status,
                desired_replicas = build.desired_replicas,
                "noticed build update"
            );
            self.publish(BuildEventKind::Upd, build);
        }
    }

    pub fn remove(&self, name: &str) {
        let removed = self.inner.write().builds.remove(name);
        if let Some(build) = removed {
            info!(build = %name, "noticed build removal");
            self.publish(BuildEventKind::Del, build);
        }
    }

    /// Replaces the whole build set atomically (initial list or
    /// re-list after a dropped watch) and publishes the delta.
    pub fn replace_all(&self, builds: Vec<Build>) {
        let mut fresh: BTreeMap<String, Build> =
            builds.into_iter().map(|b| (b.name.clone(), b)).collect();
        let (removed, changed) = {
            let mut inner = self.inner.write();
            let removed: Vec<Build> = inner
                .builds
                .values()
                .filter(|b| !fresh.contains_key(&b.name))
                .cloned()
                .collect();
            let changed: Vec<Build> = fresh
                .values()
                .filter(|b| inner.builds.get(&b.name) != Some(b))
                .cloned()
                .collect();
            std::mem::swap(&mut inner.builds, &mut fresh);
            (removed, changed)
        };
        self.ready.store(true, Ordering::Release);
        for build in removed {
            self.publish(BuildEventKind::Del, build);
        }
        for build in changed {
            self.publish(BuildEventKind::Upd, build);
        }
    }

    pub fn set_job(&self, name: &str, kind: JobKind, phase: JobPhase) {
        self.inner.write().jobs.insert((name.to_string(), kind), phase);
    }

    pub fn remove_job(&self, name: &str, kind: JobKind) {
        self.inner.write().jobs.remove(&(name.to_string(), kind));
    }

    /// Replaces the whole job table (job watch re-list).
    pub fn replace_jobs(&self, jobs: Vec<(String, JobKind, JobPhase)>) {
        let fresh = jobs.into_iter().map(|(n, k, p)| ((n, k), p)).collect();
        self.inner.write().jobs = fresh;
    }

    // ---- reads (snapshots) ----

    pub fn get(&self, name: &str) -> Option<Build> {
        self.inner.read().builds.get(name).cloned()
    }

    /// All builds matching the filter, newest first, branch builds
    /// before pull request builds of the same repo.
    pub fn list(&self, filter: &BuildFilter) -> Vec<Build> {
        let mut builds: Vec<Build> = self
            .inner
            .read()
            .builds
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        builds.sort_by(|a, b| {
            let key = |x: &Build| {
                (
                    x.commit.repo.clone(),
                    x.commit.pr.unwrap_or(u64::MAX),
                    x.commit.target_branch.clone(),
                    x.created_at,
                )
            };
            key(b).cmp(&key(a))
        });
        builds
    }

    pub fn count_started(&self) -> usize {
        self.count_by(|b| b.status() == BuildStatus::Started)
    }

    pub fn count_initializing(&self) -> usize {
        self.count_by(|b| !b.deleted && b.init_status == InitStatus::Started)
    }

    pub fn count_todo(&self) -> usize {
        self.count_by(|b| !b.deleted && b.init_status == InitStatus::Todo)
    }

    /// Deployed builds: everything not being cleaned up.
    pub fn count_deployed(&self) -> usize {
        self.count_by(|b| b.status() != BuildStatus::Cleaning)
    }

    pub fn count_by(&self, pred: impl Fn(&Build) -> bool) -> usize {
        self.inner.read().builds.values().filter(|b| pred(b)).count()
    }

    /// The initializer queue: oldest `todo` builds first, by init-status
    /// timestamp.
    pub fn to_initialize(&self, limit: usize) -> Vec<Build> {
        self.select_sorted(limit, |b| !b.deleted && b.init_status == InitStatus::Todo, |b| {
            (b.init_status_at, b.name.clone())
        })
    }

    /// The stopper queue: oldest started builds first, by last scaling.
    pub fn oldest_started(&self, limit: usize) -> Vec<Build> {
        self.select_sorted(limit, |b| b.status() == BuildStatus::Started, |b| {
            (b.last_scaled_at, b.name.clone())
        })
    }

    /// The undeployer queue: oldest stopped or failed builds first, by
    /// creation time. Never contains initializing or started builds.
    pub fn oldest_evictable(&self, limit: usize) -> Vec<Build> {
        self.select_sorted(
            limit,
            |b| matches!(b.status(), BuildStatus::Stopped | BuildStatus::Failed),
            |b| (b.created_at, b.name.clone()),
        )
    }

    /// Deleted builds whose cleanup job has not been created yet.
    pub fn to_cleanup(&self) -> Vec<Build> {
        let inner = self.inner.read();
        inner
            .builds
            .values()
            .filter(|b| b.deleted && !inner.jobs.contains_key(&(b.name.clone(), JobKind::Cleanup)))
            .cloned()
            .collect()
    }

    fn select_sorted<K: Ord>(
        &self,
        limit: usize,
        pred: impl Fn(&Build) -> bool,
        key: impl Fn(&Build) -> K,
    ) -> Vec<Build> {
        let mut selected: Vec<Build> = self
            .inner
            .read()
            .builds
            .values()
            .filter(|b| pred(b))
            .cloned()
            .collect();
        selected.sort_by_key(|b| key(b));
        selected.truncate(limit);
        selected
    }
}
