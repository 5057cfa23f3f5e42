//! Build routes: list, inspect, deploy, commands, logs, triggers.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use build_model::{Build, BuildStatus, CommitInfo, InitStatus, JobKind};

use crate::api::auth::require_admin;
use crate::api::error::{ApiError, ApiResult};
use crate::api::AppState;
use crate::github::GithubError;
use crate::index::BuildFilter;
use crate::settings::Settings;

/// Controller counters against their caps.
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub deployed: usize,
    pub max_deployed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub started: usize,
    pub max_started: usize,
    pub to_initialize: usize,
    pub initializing: usize,
    pub max_initializing: usize,
    pub cleaning: usize,
}

#[derive(Debug, Serialize)]
pub struct BuildView {
    pub name: String,
    pub repo: String,
    pub target_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    pub git_commit: String,
    pub image: String,
    pub status: BuildStatus,
    pub init_status: InitStatus,
    pub created_at: DateTime<Utc>,
    pub last_scaled_at: DateTime<Utc>,
    /// Where the running build is reachable.
    pub web_link: String,
}

impl BuildView {
    pub fn from_build(build: &Build, settings: &Settings) -> Self {
        Self {
            name: build.name.clone(),
            repo: build.commit.repo.clone(),
            target_branch: build.commit.target_branch.clone(),
            pr: build.commit.pr,
            git_commit: build.commit.git_commit.clone(),
            image: build.image.clone(),
            status: build.status(),
            init_status: build.init_status,
            created_at: build.created_at,
            last_scaled_at: build.last_scaled_at,
            web_link: format!("http://{}.{}", build.slug(), settings.build_domain),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub repo: Option<String>,
    pub target_branch: Option<String>,
    pub branch: Option<String>,
    pub pr: Option<u64>,
    pub name: Option<String>,
    pub status: Option<String>,
}

impl ListQuery {
    pub fn to_filter(&self) -> ApiResult<BuildFilter> {
        let status = self
            .status
            .as_deref()
            .map(|s| {
                BuildStatus::from_str(s)
                    .map_err(|()| ApiError::Rejected(format!("unknown status {s:?}")))
            })
            .transpose()?;
        Ok(BuildFilter {
            repo: self.repo.clone(),
            target_branch: self.target_branch.clone(),
            branch: self.branch.clone(),
            pr: self.pr,
            name: self.name.clone(),
            status,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub repo: String,
    pub target_branch: String,
    #[serde(default)]
    pub pr: Option<u64>,
    pub git_commit: String,
}

#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub name: String,
}

pub async fn controller_status(State(state): State<AppState>) -> Json<StatusView> {
    let index = &state.index;
    let settings = &state.settings;
    Json(StatusView {
        deployed: index.count_deployed(),
        max_deployed: settings.max_deployed,
        failed: index.count_by(|b| b.status() == BuildStatus::Failed),
        stopped: index.count_by(|b| b.status() == BuildStatus::Stopped),
        started: index.count_started(),
        max_started: settings.max_started,
        to_initialize: index.count_todo(),
        initializing: index.count_initializing(),
        max_initializing: settings.max_initializing,
        cleaning: index.count_by(|b| b.status() == BuildStatus::Cleaning),
    })
}

pub async fn list_builds(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<BuildView>>> {
    if !state.index.ready() {
        return Err(ApiError::Unavailable);
    }
    let filter = query.to_filter()?;
    let builds = state
        .index
        .list(&filter)
        .iter()
        .map(|b| BuildView::from_build(b, &state.settings))
        .collect();
    Ok(Json(builds))
}

pub async fn get_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<BuildView>> {
    if !state.index.ready() {
        return Err(ApiError::Unavailable);
    }
    let build = state
        .index
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(name))?;
    Ok(Json(BuildView::from_build(&build, &state.settings)))
}

pub async fn deploy_build(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeployRequest>,
) -> ApiResult<(StatusCode, Json<DeployResponse>)> {
    require_admin(&state.settings, &headers)?;
    let commit = CommitInfo::new(
        &request.repo,
        &request.target_branch,
        request.pr,
        &request.git_commit,
    );
    let name = state.lifecycle.deploy(commit).await?;
    Ok((StatusCode::ACCEPTED, Json(DeployResponse { name })))
}

pub async fn undeploy_builds(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<StatusCode> {
    require_admin(&state.settings, &headers)?;
    let filter = query.to_filter()?;
    state.lifecycle.undeploy_all(&filter).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn start_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_admin(&state.settings, &headers)?;
    state.lifecycle.start(&name).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn stop_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_admin(&state.settings, &headers)?;
    state.lifecycle.stop(&name).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn reset_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_admin(&state.settings, &headers)?;
    state.lifecycle.reset(&name).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn undeploy_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_admin(&state.settings, &headers)?;
    state.lifecycle.undeploy(&name).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Resolve a branch head on GitHub and deploy it.
pub async fn trigger_branch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TriggerBranchQuery>,
) -> ApiResult<StatusCode> {
    require_admin(&state.settings, &headers)?;
    let commit = state
        .github
        .branch_head(&query.repo, &query.branch)
        .await
        .map_err(github_error)?;
    state.lifecycle.deploy_or_ignore(commit).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Resolve a pull request head on GitHub and deploy it.
pub async fn trigger_pr(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TriggerPrQuery>,
) -> ApiResult<StatusCode> {
    require_admin(&state.settings, &headers)?;
    let commit = state
        .github
        .pull_head(&query.repo, query.pr)
        .await
        .map_err(github_error)?;
    state.lifecycle.deploy_or_ignore(commit).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct TriggerBranchQuery {
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Deserialize)]
pub struct TriggerPrQuery {
    pub repo: String,
    pub pr: u64,
}

fn github_error(e: GithubError) -> ApiError {
    match e {
        GithubError::NotFound(msg) => ApiError::Rejected(msg),
        other => ApiError::Upstream(other.to_string()),
    }
}

pub async fn init_log(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<String> {
    read_log(&state, &name, Some(JobKind::Initialize)).await
}

pub async fn log(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<String> {
    read_log(&state, &name, None).await
}

const LOG_TAIL_LINES: i64 = 1000;

async fn read_log(state: &AppState, name: &str, kind: Option<JobKind>) -> ApiResult<String> {
    if !state.index.ready() {
        return Err(ApiError::Unavailable);
    }
    if state.index.get(name).is_none() {
        return Err(ApiError::NotFound(name.to_string()));
    }
    let log = state
        .gateway
        .read_log(name, kind, Some(LOG_TAIL_LINES))
        .await
        .map_err(|e| ApiError::from(crate::error::ControllerError::from(e)))?;
    log.ok_or_else(|| ApiError::NotFound("no log found".to_string()))
}
