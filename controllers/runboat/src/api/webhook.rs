//! GitHub webhook ingest.
//!
//! Translates push and pull request events into a `(repo, branch, pr?,
//! commit)` tuple and deploys it. When a webhook secret is configured
//! the HMAC signature is verified; without one the endpoint is open,
//! which the deployment documentation flags as a risk.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use build_model::CommitInfo;

use crate::api::auth::constant_time_eq;
use crate::api::error::{ApiError, ApiResult};
use crate::api::AppState;

pub async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    if let Some(secret) = &state.settings.github_webhook_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            return Err(ApiError::Unauthorized);
        }
    }
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Rejected("missing X-GitHub-Event header".to_string()))?;
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Rejected(format!("invalid JSON payload: {e}")))?;

    let Some(commit) = parse_event(event, &payload) else {
        debug!(event, "ignoring webhook event");
        return Ok(StatusCode::ACCEPTED);
    };
    // Filter unsupported repos without any cluster access.
    if !state
        .lifecycle
        .matcher()
        .is_supported(&commit.repo, &commit.target_branch)
    {
        debug!(repo = %commit.repo, branch = %commit.target_branch, "webhook for unsupported repo/branch");
        return Ok(StatusCode::ACCEPTED);
    }
    // Deploy in the background; webhook delivery never waits for the
    // cluster, and duplicate deliveries are routine.
    let lifecycle = state.lifecycle.clone();
    tokio::spawn(async move {
        if let Err(e) = lifecycle.deploy_or_ignore(commit).await {
            warn!("webhook deploy failed: {e}");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

/// Maps a GitHub event to the commit to deploy, or `None` for events
/// the controller does not care about.
pub fn parse_event(event: &str, payload: &Value) -> Option<CommitInfo> {
    let repo = payload
        .pointer("/repository/full_name")
        .and_then(Value::as_str)?;
    match event {
        "pull_request" => {
            let action = payload.get("action").and_then(Value::as_str)?;
            if !matches!(action, "opened" | "synchronize") {
                return None;
            }
            let pr = payload.pointer("/pull_request/number").and_then(Value::as_u64)?;
            let base = payload
                .pointer("/pull_request/base/ref")
                .and_then(Value::as_str)?;
            let sha = payload
                .pointer("/pull_request/head/sha")
                .and_then(Value::as_str)?;
            Some(CommitInfo::new(repo, base, Some(pr), sha))
        }
        "push" => {
            let branch = payload
                .get("ref")
                .and_then(Value::as_str)?
                .strip_prefix("refs/heads/")?;
            // A branch deletion push carries no commit to deploy.
            if payload.get("deleted").and_then(Value::as_bool) == Some(true) {
                return None;
            }
            let sha = payload.get("after").and_then(Value::as_str)?;
            Some(CommitInfo::new(repo, branch, None, sha))
        }
        _ => None,
    }
}

/// Computes the `sha256=<hex>` signature GitHub sends for a payload.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(digest.len() * 2 + 7);
    hex.push_str("sha256=");
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let expected = sign(secret, body);
    !expected.is_empty() && constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_event_deploys_the_branch_head() {
        let payload = json!({
            "repository": {"full_name": "Acme/Svc"},
            "ref": "refs/heads/main",
            "after": "a".repeat(40),
        });
        let commit = parse_event("push", &payload).unwrap();
        assert_eq!(
            commit,
            CommitInfo::new("acme/svc", "main", None, &"a".repeat(40))
        );
    }

    #[test]
    fn pull_request_updates_deploy_the_head_commit() {
        for action in ["opened", "synchronize"] {
            let payload = json!({
                "repository": {"full_name": "acme/svc"},
                "action": action,
                "pull_request": {
                    "number": 42,
                    "base": {"ref": "main"},
                    "head": {"sha": "b".repeat(40)},
                },
            });
            assert_eq!(
                parse_event("pull_request", &payload).unwrap(),
                CommitInfo::new("acme/svc", "main", Some(42), &"b".repeat(40))
            );
        }
    }

    #[test]
    fn irrelevant_events_are_ignored() {
        let payload = json!({"repository": {"full_name": "acme/svc"}});
        assert!(parse_event("issues", &payload).is_none());
        for action in ["closed", "reopened", "labeled"] {
            let pr_event = json!({
                "repository": {"full_name": "acme/svc"},
                "action": action,
                "pull_request": {
                    "number": 1,
                    "base": {"ref": "main"},
                    "head": {"sha": "c".repeat(40)},
                },
            });
            assert!(parse_event("pull_request", &pr_event).is_none());
        }
        // Tag pushes have a non-branch ref.
        let tag = json!({
            "repository": {"full_name": "acme/svc"},
            "ref": "refs/tags/v1.0",
            "after": "c".repeat(40),
        });
        assert!(parse_event("push", &tag).is_none());
        // Branch deletion pushes carry no commit to deploy.
        let deleted = json!({
            "repository": {"full_name": "acme/svc"},
            "ref": "refs/heads/old-feature",
            "deleted": true,
            "after": "0".repeat(40),
        });
        assert!(parse_event("push", &deleted).is_none());
    }

    #[test]
    fn signatures_round_trip_and_reject_tampering() {
        let body = br#"{"zen": "Keep it logically awesome."}"#;
        let signature = sign("s3cret", body);
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature("s3cret", body, Some(&signature)));
        assert!(!verify_signature("other", body, Some(&signature)));
        assert!(!verify_signature("s3cret", b"tampered", Some(&signature)));
        assert!(!verify_signature("s3cret", body, None));
    }
}
