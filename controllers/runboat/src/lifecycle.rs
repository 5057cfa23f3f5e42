//! Build lifecycle commands and transitions.
//!
//! Everything here mutates the cluster, never the index: the index
//! catches up through the watch stream. Commands are idempotent and
//! guard on the derived status, so repeating one after it has applied
//! changes nothing.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use build_model::labels::{
    ANNOTATION_INIT_STATUS, ANNOTATION_INIT_STATUS_TIMESTAMP, ANNOTATION_LAST_SCALED,
    FINALIZER_CLEANUP,
};
use build_model::{
    build_name, Build, BuildRecipe, BuildStatus, CommitInfo, InitStatus, JobKind, RepoMatcher,
};
use cluster_gateway::{BundleRequest, BundleVars, ClusterGateway, DeploymentMode};

use crate::error::ControllerError;
use crate::github::{CommitState, GithubClient};
use crate::index::{BuildFilter, BuildIndex};
use crate::settings::Settings;

pub struct Lifecycle {
    settings: Arc<Settings>,
    matcher: RepoMatcher,
    gateway: Arc<dyn ClusterGateway>,
    index: Arc<BuildIndex>,
    github: Option<Arc<GithubClient>>,
}

impl Lifecycle {
    pub fn new(
        settings: Arc<Settings>,
        gateway: Arc<dyn ClusterGateway>,
        index: Arc<BuildIndex>,
        github: Option<Arc<GithubClient>>,
    ) -> Result<Self, ControllerError> {
        let matcher = RepoMatcher::new(&settings.repos)
            .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            settings,
            matcher,
            gateway,
            index,
            github,
        })
    }

    pub fn matcher(&self) -> &RepoMatcher {
        &self.matcher
    }

    /// Deploys a build for a commit. Rejects unsupported repo/branch
    /// pairs and duplicate names.
    pub async fn deploy(&self, commit: CommitInfo) -> Result<String, ControllerError> {
        validate_commit(&commit)?;
        let recipe = self
            .matcher
            .recipe_for(&commit.repo, &commit.target_branch)
            .ok_or_else(|| {
                ControllerError::Rejected(format!(
                    "branch {} of {} matches no rule",
                    commit.target_branch, commit.repo
                ))
            })?;
        if !self.index.ready() {
            return Err(ControllerError::Unavailable);
        }
        let name = build_name(&commit);
        if self.index.get(&name).is_some() {
            return Err(ControllerError::Conflict(format!(
                "build {name} already exists"
            )));
        }
        let request =
            self.bundle_request(&commit, &recipe.image, Some(recipe), DeploymentMode::Deployment);
        self.gateway.apply_bundle(&request).await?;
        info!(build = %name, repo = %commit.repo, commit = %commit.short_commit(), "deployed");
        self.notify(&commit, CommitState::Pending, Some(self.build_link(&name)));
        Ok(name)
    }

    /// Deploys unless a build for the commit already exists. Used by
    /// the webhook path, where duplicate events are routine.
    pub async fn deploy_or_ignore(&self, commit: CommitInfo) -> Result<(), ControllerError> {
        match self.deploy(commit).await {
            Ok(_) => Ok(()),
            Err(ControllerError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn start(&self, name: &str) -> Result<(), ControllerError> {
        let build = self.get(name)?;
        match build.status() {
            BuildStatus::Stopped => {
                self.apply_for_build(&build, DeploymentMode::Start).await?;
                self.scale(name, 1).await
            }
            // A failed build is re-queued for initialization; the
            // initializer picks it up when capacity allows.
            BuildStatus::Failed => self.set_init_status(name, InitStatus::Todo).await,
            BuildStatus::Todo
            | BuildStatus::Initializing
            | BuildStatus::Starting
            | BuildStatus::Started => Ok(()),
            BuildStatus::Cleaning => Err(ControllerError::Conflict(format!(
                "build {name} is being cleaned up"
            ))),
        }
    }

    pub async fn stop(&self, name: &str) -> Result<(), ControllerError> {
        let build = self.get(name)?;
        if build.status() == BuildStatus::Cleaning {
            return Err(ControllerError::Conflict(format!(
                "build {name} is being cleaned up"
            )));
        }
        if build.desired_replicas == 0 {
            return Ok(());
        }
        self.apply_for_build(&build, DeploymentMode::Stop).await?;
        self.scale(name, 0).await
    }

    /// Forces re-initialization: back to the todo queue, scaled down.
    pub async fn reset(&self, name: &str) -> Result<(), ControllerError> {
        let build = self.get(name)?;
        if build.status() == BuildStatus::Cleaning {
            return Err(ControllerError::Conflict(format!(
                "build {name} is being cleaned up"
            )));
        }
        self.set_init_status(name, InitStatus::Todo).await?;
        if build.desired_replicas != 0 {
            self.scale(name, 0).await?;
        }
        Ok(())
    }

    /// Marks the build for deletion. The cleanup finalizer keeps the
    /// workload around until the cleanup job has run.
    pub async fn undeploy(&self, name: &str) -> Result<(), ControllerError> {
        let build = self.get(name)?;
        if build.deleted {
            return Ok(());
        }
        self.gateway.delete_workload(name).await?;
        info!(build = %name, "undeploy requested");
        Ok(())
    }

    pub async fn undeploy_all(&self, filter: &BuildFilter) -> Result<(), ControllerError> {
        if !self.index.ready() {
            return Err(ControllerError::Unavailable);
        }
        for build in self.index.list(filter) {
            if build.deleted {
                continue;
            }
            if let Err(e) = self.gateway.delete_workload(&build.name).await {
                warn!(build = %build.name, "undeploy failed: {e}");
            }
        }
        Ok(())
    }

    // ---- transitions driven by the reconcilers ----

    /// Admits a build for initialization. The init-status patch acts as
    /// a lease: when another writer got there first, the resulting
    /// conflict makes us yield.
    pub(crate) async fn initialize(&self, build: &Build) -> Result<(), ControllerError> {
        if build.deleted {
            return Ok(());
        }
        match self.set_init_status(&build.name, InitStatus::Started).await {
            Ok(()) => {}
            Err(ControllerError::Gateway(e)) if e.is_conflict() => {
                debug!(build = %build.name, "init admission lost the lease, yielding");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        // A stale job from a failed or reset attempt would make the
        // bundle apply bounce on the immutable job spec.
        self.gateway
            .delete_job(&build.name, JobKind::Initialize)
            .await?;
        self.apply_for_build(build, DeploymentMode::Initialization)
            .await?;
        info!(build = %build.name, "initialization job launched");
        Ok(())
    }

    pub(crate) async fn on_initialize_succeeded(&self, build: &Build) -> Result<(), ControllerError> {
        if build.deleted {
            return Ok(());
        }
        self.set_init_status(&build.name, InitStatus::Succeeded).await?;
        // Fresh builds auto-start once; the rest of their lifecycle is
        // user-driven.
        self.apply_for_build(build, DeploymentMode::Start).await?;
        self.scale(&build.name, 1).await?;
        self.notify(
            &build.commit,
            CommitState::Success,
            Some(self.build_link(&build.name)),
        );
        Ok(())
    }

    pub(crate) async fn on_initialize_failed(&self, build: &Build) -> Result<(), ControllerError> {
        if build.deleted {
            return Ok(());
        }
        self.set_init_status(&build.name, InitStatus::Failed).await?;
        self.scale(&build.name, 0).await?;
        self.notify(
            &build.commit,
            CommitState::Failure,
            Some(self.build_link(&build.name)),
        );
        Ok(())
    }

    /// Launches the cleanup job for a deleted build.
    pub(crate) async fn cleanup(&self, build: &Build) -> Result<(), ControllerError> {
        self.apply_for_build(build, DeploymentMode::Cleanup).await?;
        info!(build = %build.name, "cleanup job launched");
        Ok(())
    }

    /// Cleanup succeeded: drop every labelled resource, then release
    /// the finalizer so the workload can go away.
    pub(crate) async fn on_cleanup_succeeded(&self, name: &str) -> Result<(), ControllerError> {
        self.gateway.delete_by_label(name).await?;
        self.gateway.remove_finalizer(name, FINALIZER_CLEANUP).await?;
        info!(build = %name, "cleanup complete, resources deleted");
        Ok(())
    }

    pub(crate) async fn set_init_status(
        &self,
        name: &str,
        status: InitStatus,
    ) -> Result<(), ControllerError> {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_INIT_STATUS.to_string(), status.to_string());
        annotations.insert(
            ANNOTATION_INIT_STATUS_TIMESTAMP.to_string(),
            Utc::now().to_rfc3339(),
        );
        self.gateway
            .patch_workload_annotations(name, annotations)
            .await?;
        Ok(())
    }

    async fn scale(&self, name: &str, replicas: i32) -> Result<(), ControllerError> {
        self.gateway.scale_workload(name, replicas).await?;
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_LAST_SCALED.to_string(), Utc::now().to_rfc3339());
        self.gateway
            .patch_workload_annotations(name, annotations)
            .await?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Build, ControllerError> {
        if !self.index.ready() {
            return Err(ControllerError::Unavailable);
        }
        self.index
            .get(name)
            .ok_or_else(|| ControllerError::NotFound(name.to_string()))
    }

    /// Bundle request for an existing build. The image stays the one
    /// the build was created with; the recipe only contributes the
    /// kubefiles path and env, falling back to the defaults when the
    /// rules no longer match (cleanup must keep working either way).
    async fn apply_for_build(
        &self,
        build: &Build,
        mode: DeploymentMode,
    ) -> Result<(), ControllerError> {
        let recipe = self
            .matcher
            .recipe_for(&build.commit.repo, &build.commit.target_branch);
        let request = self.bundle_request(&build.commit, &build.image, recipe, mode);
        self.gateway.apply_bundle(&request).await?;
        Ok(())
    }

    fn bundle_request(
        &self,
        commit: &CommitInfo,
        image: &str,
        recipe: Option<&BuildRecipe>,
        mode: DeploymentMode,
    ) -> BundleRequest {
        BundleRequest {
            kubefiles_path: self.settings.kubefiles_path_for(recipe).to_path_buf(),
            vars: BundleVars::new(
                &self.settings.build_namespace,
                mode,
                &build_name(commit),
                &self.settings.build_domain,
                commit,
                image,
                self.settings.merged_env(recipe),
                self.settings.merged_secret_env(recipe),
                self.settings.merged_template_vars(recipe),
            ),
        }
    }

    fn build_link(&self, name: &str) -> String {
        format!(
            "{}/builds/{name}",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    /// Posts a commit status in the background; failures are logged,
    /// never propagated into the command path.
    fn notify(&self, commit: &CommitInfo, state: CommitState, target_url: Option<String>) {
        if self.settings.disable_commit_statuses {
            return;
        }
        let Some(github) = self.github.clone() else {
            return;
        };
        let repo = commit.repo.clone();
        let sha = commit.git_commit.clone();
        tokio::spawn(async move {
            if let Err(e) = github
                .notify_commit_status(&repo, &sha, state, target_url.as_deref())
                .await
            {
                warn!("failed to post commit status for {repo}@{sha}: {e}");
            }
        });
    }
}

fn validate_commit(commit: &CommitInfo) -> Result<(), ControllerError> {
    if commit.repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
        return Err(ControllerError::Rejected(
            "repo must be of the form owner/name".to_string(),
        ));
    }
    if commit.git_commit.len() != 40
        || !commit.git_commit.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(ControllerError::Rejected(
            "git_commit must be a 40 character hex sha".to_string(),
        ));
    }
    if commit.pr == Some(0) {
        return Err(ControllerError::Rejected(
            "pr must be a positive integer".to_string(),
        ));
    }
    Ok(())
}
