//! The build entity and its state machine.
//!
//! A `Build` is a pure projection of one managed workload: every field is
//! read back from labels, annotations and spec/status of the deployment,
//! so the in-memory picture can always be rebuilt from the cluster. The
//! user-facing status is a total function over those fields, not stored
//! anywhere.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::commit::CommitInfo;
use crate::labels::{
    ANNOTATION_GIT_COMMIT, ANNOTATION_INIT_STATUS, ANNOTATION_INIT_STATUS_TIMESTAMP,
    ANNOTATION_LAST_SCALED, ANNOTATION_PR, ANNOTATION_REPO, ANNOTATION_TARGET_BRANCH, LABEL_BUILD,
};

/// Progress of the one-shot initialization job, as recorded in the
/// `runboat/init-status` annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitStatus {
    Todo,
    Started,
    Succeeded,
    Failed,
}

impl InitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitStatus::Todo => "todo",
            InitStatus::Started => "started",
            InitStatus::Succeeded => "succeeded",
            InitStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InitStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(InitStatus::Todo),
            "started" => Ok(InitStatus::Started),
            "succeeded" => Ok(InitStatus::Succeeded),
            "failed" => Ok(InitStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Derived, user-facing build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Todo,
    Initializing,
    Failed,
    Stopped,
    Starting,
    Started,
    Cleaning,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Todo => "todo",
            BuildStatus::Initializing => "initializing",
            BuildStatus::Failed => "failed",
            BuildStatus::Stopped => "stopped",
            BuildStatus::Starting => "starting",
            BuildStatus::Started => "started",
            BuildStatus::Cleaning => "cleaning",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(BuildStatus::Todo),
            "initializing" => Ok(BuildStatus::Initializing),
            "failed" => Ok(BuildStatus::Failed),
            "stopped" => Ok(BuildStatus::Stopped),
            "starting" => Ok(BuildStatus::Starting),
            "started" => Ok(BuildStatus::Started),
            "cleaning" => Ok(BuildStatus::Cleaning),
            _ => Err(()),
        }
    }
}

/// Total derivation of the build status from raw cluster facts.
pub fn derive_status(
    deleted: bool,
    init_status: InitStatus,
    desired_replicas: i32,
    observed_replicas: i32,
) -> BuildStatus {
    if deleted {
        return BuildStatus::Cleaning;
    }
    match init_status {
        InitStatus::Todo => BuildStatus::Todo,
        InitStatus::Started => BuildStatus::Initializing,
        InitStatus::Failed => BuildStatus::Failed,
        InitStatus::Succeeded => {
            if desired_replicas == 0 {
                BuildStatus::Stopped
            } else if observed_replicas >= 1 {
                BuildStatus::Started
            } else {
                BuildStatus::Starting
            }
        }
    }
}

/// One managed build, as read from its workload.
#[derive(Debug, Clone, PartialEq)]
pub struct Build {
    pub name: String,
    pub commit: CommitInfo,
    pub image: String,
    pub init_status: InitStatus,
    pub init_status_at: DateTime<Utc>,
    pub desired_replicas: i32,
    pub observed_replicas: i32,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub last_scaled_at: DateTime<Utc>,
}

impl Build {
    pub fn status(&self) -> BuildStatus {
        derive_status(
            self.deleted,
            self.init_status,
            self.desired_replicas,
            self.observed_replicas,
        )
    }

    /// Hostname label under the build domain. Same as the name, which is
    /// already a DNS label.
    pub fn slug(&self) -> &str {
        &self.name
    }

    /// Reads a build back from its workload. Returns `None` when the
    /// deployment does not carry the build label or the identity
    /// annotations, i.e. it is not (or no longer) a managed build.
    pub fn from_workload(workload: &Deployment) -> Option<Build> {
        let meta = &workload.metadata;
        let name = meta.labels.as_ref()?.get(LABEL_BUILD)?.clone();
        let annotations = meta.annotations.as_ref()?;
        let repo = annotations.get(ANNOTATION_REPO)?;
        let target_branch = annotations.get(ANNOTATION_TARGET_BRANCH)?;
        let git_commit = annotations.get(ANNOTATION_GIT_COMMIT)?;
        let pr = annotations
            .get(ANNOTATION_PR)
            .and_then(|v| v.parse::<u64>().ok());
        let commit = CommitInfo::new(repo, target_branch, pr, git_commit);

        let created_at = meta
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let init_status = annotations
            .get(ANNOTATION_INIT_STATUS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(InitStatus::Todo);
        let init_status_at = parse_timestamp(annotations.get(ANNOTATION_INIT_STATUS_TIMESTAMP))
            .unwrap_or(created_at);
        let last_scaled_at =
            parse_timestamp(annotations.get(ANNOTATION_LAST_SCALED)).unwrap_or(created_at);

        let spec = workload.spec.as_ref();
        let desired_replicas = spec.and_then(|s| s.replicas).unwrap_or(0);
        let observed_replicas = workload
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0);
        let image = spec
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();

        Some(Build {
            name,
            commit,
            image,
            init_status,
            init_status_at,
            desired_replicas,
            observed_replicas,
            deleted: meta.deletion_timestamp.is_some(),
            created_at,
            last_scaled_at,
        })
    }
}

fn parse_timestamp(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}
