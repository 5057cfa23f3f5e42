//! Bundle requests: which template to render, in which mode, with which
//! variables.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use build_model::{CommitInfo, JobKind};

/// Which slice of a build's resources a bundle materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// The workload, volume and everything created up front (replicas 0).
    Deployment,
    /// The one-shot initialization job.
    Initialization,
    /// Resources that only exist while the build runs (service, ingress).
    Start,
    /// Teardown of start-time resources.
    Stop,
    /// The one-shot cleanup job.
    Cleanup,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Deployment => "deployment",
            DeploymentMode::Initialization => "initialization",
            DeploymentMode::Start => "start",
            DeploymentMode::Stop => "stop",
            DeploymentMode::Cleanup => "cleanup",
        }
    }

    /// The job kind a bundle of this mode creates, if any.
    pub fn job_kind(&self) -> Option<JobKind> {
        match self {
            DeploymentMode::Initialization => Some(JobKind::Initialize),
            DeploymentMode::Cleanup => Some(JobKind::Cleanup),
            _ => None,
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits `name:tag`, defaulting the tag to `latest`.
pub fn split_image(image: &str) -> (String, String) {
    match image.split_once(':') {
        Some((name, tag)) if !tag.is_empty() => (name.to_string(), tag.to_string()),
        _ => (image.trim_end_matches(':').to_string(), "latest".to_string()),
    }
}

/// The variables bag handed to template rendering. Field names are the
/// template-visible variable names.
#[derive(Debug, Clone, Serialize)]
pub struct BundleVars {
    pub namespace: String,
    pub mode: DeploymentMode,
    pub build_name: String,
    pub build_slug: String,
    pub build_domain: String,
    pub repo: String,
    pub target_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    pub git_commit: String,
    pub git_ref: String,
    pub image_name: String,
    pub image_tag: String,
    pub build_env: BTreeMap<String, String>,
    pub build_secret_env: BTreeMap<String, String>,
    pub build_template_vars: BTreeMap<String, String>,
}

impl BundleVars {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: &str,
        mode: DeploymentMode,
        build_name: &str,
        build_domain: &str,
        commit: &CommitInfo,
        image: &str,
        build_env: BTreeMap<String, String>,
        build_secret_env: BTreeMap<String, String>,
        build_template_vars: BTreeMap<String, String>,
    ) -> Self {
        let (image_name, image_tag) = split_image(image);
        Self {
            namespace: namespace.to_string(),
            mode,
            build_name: build_name.to_string(),
            build_slug: build_name.to_string(),
            build_domain: build_domain.to_string(),
            repo: commit.repo.clone(),
            target_branch: commit.target_branch.clone(),
            pr: commit.pr,
            git_commit: commit.git_commit.clone(),
            git_ref: commit.git_ref(),
            image_name,
            image_tag,
            build_env,
            build_secret_env,
            build_template_vars,
        }
    }

}

/// A fully specified bundle application.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub kubefiles_path: PathBuf,
    pub vars: BundleVars,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_image_with_and_without_tag() {
        assert_eq!(
            split_image("ghcr.io/acme/app:16.0"),
            ("ghcr.io/acme/app".to_string(), "16.0".to_string())
        );
        assert_eq!(
            split_image("ghcr.io/acme/app"),
            ("ghcr.io/acme/app".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn job_kind_per_mode() {
        assert_eq!(
            DeploymentMode::Initialization.job_kind(),
            Some(JobKind::Initialize)
        );
        assert_eq!(DeploymentMode::Cleanup.job_kind(), Some(JobKind::Cleanup));
        assert_eq!(DeploymentMode::Deployment.job_kind(), None);
        assert_eq!(DeploymentMode::Start.job_kind(), None);
    }
}
