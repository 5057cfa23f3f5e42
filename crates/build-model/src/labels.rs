//! Labels, annotations and finalizers carried by managed resources.
//!
//! These keys are the persistence contract: every build attribute except
//! the derived status is recoverable from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label selecting every resource belonging to a build.
pub const LABEL_BUILD: &str = "runboat/build";
/// Label distinguishing initialization jobs from cleanup jobs.
pub const LABEL_JOB_KIND: &str = "runboat/job-kind";

pub const ANNOTATION_REPO: &str = "runboat/repo";
pub const ANNOTATION_TARGET_BRANCH: &str = "runboat/target-branch";
pub const ANNOTATION_PR: &str = "runboat/pr";
pub const ANNOTATION_GIT_COMMIT: &str = "runboat/git-commit";
pub const ANNOTATION_INIT_STATUS: &str = "runboat/init-status";
pub const ANNOTATION_INIT_STATUS_TIMESTAMP: &str = "runboat/init-status-timestamp";
pub const ANNOTATION_LAST_SCALED: &str = "runboat/last-scaled";

/// Finalizer that blocks workload deletion until the cleanup job has run.
pub const FINALIZER_CLEANUP: &str = "runboat/cleanup";

/// The kind of one-shot job a build may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Initialize,
    Cleanup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Initialize => "initialize",
            JobKind::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialize" => Ok(JobKind::Initialize),
            "cleanup" => Ok(JobKind::Cleanup),
            _ => Err(()),
        }
    }
}
