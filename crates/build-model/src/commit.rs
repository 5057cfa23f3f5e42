//! Commit identity: the `(repo, target_branch, pr?, commit)` tuple.

use serde::{Deserialize, Serialize};

/// Identifies one commit of one branch or pull request of one repository.
///
/// The repo is normalized to lowercase `owner/name` so that lookups and
/// build names are case-insensitive with respect to GitHub's naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub repo: String,
    pub target_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    pub git_commit: String,
}

impl CommitInfo {
    pub fn new(repo: &str, target_branch: &str, pr: Option<u64>, git_commit: &str) -> Self {
        Self {
            repo: repo.to_lowercase(),
            target_branch: target_branch.to_string(),
            pr,
            git_commit: git_commit.to_string(),
        }
    }

    /// Git reference to check out: the PR head ref when this is a pull
    /// request, the branch otherwise.
    pub fn git_ref(&self) -> String {
        match self.pr {
            Some(pr) => format!("refs/pull/{pr}/head"),
            None => format!("refs/heads/{}", self.target_branch),
        }
    }

    /// Short commit identifier used in build names and display.
    pub fn short_commit(&self) -> &str {
        let n = self.git_commit.len().min(8);
        &self.git_commit[..n]
    }
}
