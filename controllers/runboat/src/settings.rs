//! Controller configuration, loaded from `RUNBOAT_`-prefixed
//! environment variables. Structured values (repo rules, env maps) are
//! JSON. Invalid configuration is fatal at startup.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

use build_model::{BuildRecipe, RepoRule};

const ENV_PREFIX: &str = "RUNBOAT_";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required setting {0}")]
    Missing(String),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Ordered repo/branch rules.
    pub repos: Vec<RepoRule>,
    /// Namespace where builds are deployed.
    pub build_namespace: String,
    /// Wildcard domain under which builds are reachable.
    pub build_domain: String,
    /// Environment for build containers and jobs.
    pub build_env: BTreeMap<String, String>,
    /// Secret environment for build containers and jobs.
    pub build_secret_env: BTreeMap<String, String>,
    /// Extra variables for template rendering.
    pub build_template_vars: BTreeMap<String, String>,
    /// Default kubefiles directory, overridable per rule.
    pub build_default_kubefiles_path: PathBuf,
    /// Maximum concurrent initialization jobs.
    pub max_initializing: usize,
    /// Maximum started builds.
    pub max_started: usize,
    /// Maximum deployed builds.
    pub max_deployed: usize,
    /// Credential protecting mutating API routes.
    pub api_admin_user: String,
    pub api_admin_passwd: String,
    /// Token for GitHub API calls.
    pub github_token: Option<String>,
    /// Secret for webhook signature verification. Without it the
    /// endpoint is open.
    pub github_webhook_secret: Option<String>,
    /// Tracing filter directives used when `RUST_LOG` is not set.
    pub log_config: Option<String>,
    /// Public base URL, used in GitHub status backlinks.
    pub base_url: String,
    /// HTML fragment appended to the UI footer. Recognized for
    /// deployments that front this API with the web UI.
    #[allow(dead_code)]
    pub additional_footer_html: String,
    /// Disable posting commit statuses to GitHub.
    pub disable_commit_statuses: bool,
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// How long shutdown may take before outstanding work is abandoned.
    pub shutdown_deadline: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, SettingsError> {
        let lookup = Lookup { vars };
        let settings = Settings {
            repos: lookup.required_json("REPOS")?,
            build_namespace: lookup.required("BUILD_NAMESPACE")?,
            build_domain: lookup.required("BUILD_DOMAIN")?,
            build_env: lookup.optional_json("BUILD_ENV")?.unwrap_or_default(),
            build_secret_env: lookup.optional_json("BUILD_SECRET_ENV")?.unwrap_or_default(),
            build_template_vars: lookup
                .optional_json("BUILD_TEMPLATE_VARS")?
                .unwrap_or_default(),
            build_default_kubefiles_path: lookup
                .optional("BUILD_DEFAULT_KUBEFILES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("kubefiles")),
            max_initializing: lookup.parsed("MAX_INITIALIZING")?.unwrap_or(2),
            max_started: lookup.parsed("MAX_STARTED")?.unwrap_or(6),
            max_deployed: lookup.parsed("MAX_DEPLOYED")?.unwrap_or(10),
            api_admin_user: lookup.required("API_ADMIN_USER")?,
            api_admin_passwd: lookup.required("API_ADMIN_PASSWD")?,
            github_token: lookup.optional("GITHUB_TOKEN"),
            github_webhook_secret: lookup.optional("GITHUB_WEBHOOK_SECRET"),
            log_config: lookup.optional("LOG_CONFIG"),
            base_url: lookup
                .optional("BASE_URL")
                .unwrap_or_else(|| "http://localhost:8000".to_string()),
            additional_footer_html: lookup.optional("ADDITIONAL_FOOTER_HTML").unwrap_or_default(),
            disable_commit_statuses: lookup.parsed("DISABLE_COMMIT_STATUSES")?.unwrap_or(false),
            listen_addr: lookup
                .parsed("LISTEN_ADDR")?
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000))),
            shutdown_deadline: Duration::from_secs(lookup.parsed("SHUTDOWN_DEADLINE")?.unwrap_or(10)),
        };
        if settings.repos.is_empty() {
            return Err(SettingsError::Invalid {
                key: "REPOS".to_string(),
                reason: "at least one repo rule is required".to_string(),
            });
        }
        for limit in [
            ("MAX_INITIALIZING", settings.max_initializing),
            ("MAX_STARTED", settings.max_started),
            ("MAX_DEPLOYED", settings.max_deployed),
        ] {
            if limit.1 == 0 {
                return Err(SettingsError::Invalid {
                    key: limit.0.to_string(),
                    reason: "must be a positive integer".to_string(),
                });
            }
        }
        Ok(settings)
    }

    /// Kubefiles directory for a recipe: its own path, or the default.
    pub fn kubefiles_path_for<'a>(&'a self, recipe: Option<&'a BuildRecipe>) -> &'a Path {
        recipe
            .and_then(|r| r.kubefiles_path.as_deref())
            .unwrap_or(&self.build_default_kubefiles_path)
    }

    /// Global env merged with a recipe's extras (recipe wins).
    pub fn merged_env(&self, recipe: Option<&BuildRecipe>) -> BTreeMap<String, String> {
        merge(&self.build_env, recipe.map(|r| &r.env))
    }

    pub fn merged_secret_env(&self, recipe: Option<&BuildRecipe>) -> BTreeMap<String, String> {
        merge(&self.build_secret_env, recipe.map(|r| &r.secret_env))
    }

    pub fn merged_template_vars(&self, recipe: Option<&BuildRecipe>) -> BTreeMap<String, String> {
        merge(&self.build_template_vars, recipe.map(|r| &r.template_vars))
    }
}

fn merge(
    base: &BTreeMap<String, String>,
    extra: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    if let Some(extra) = extra {
        merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

struct Lookup<'a> {
    vars: &'a HashMap<String, String>,
}

impl Lookup<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        self.vars
            .get(&format!("{ENV_PREFIX}{key}"))
            .filter(|v| !v.is_empty())
            .cloned()
    }

    fn required(&self, key: &str) -> Result<String, SettingsError> {
        self.optional(key)
            .ok_or_else(|| SettingsError::Missing(format!("{ENV_PREFIX}{key}")))
    }

    fn optional_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SettingsError> {
        self.optional(key)
            .map(|v| {
                serde_json::from_str(&v).map_err(|e| SettingsError::Invalid {
                    key: format!("{ENV_PREFIX}{key}"),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn required_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, SettingsError> {
        let raw = self.required(key)?;
        serde_json::from_str(&raw).map_err(|e| SettingsError::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            reason: e.to_string(),
        })
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, SettingsError>
    where
        T::Err: std::fmt::Display,
    {
        self.optional(key)
            .map(|v| {
                v.parse().map_err(|e: T::Err| SettingsError::Invalid {
                    key: format!("{ENV_PREFIX}{key}"),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(
            "RUNBOAT_REPOS".to_string(),
            r#"[{"repo": "acme/svc", "branch": "main|16\\.0", "builds": [{"image": "img:1"}]}]"#
                .to_string(),
        );
        vars.insert("RUNBOAT_BUILD_NAMESPACE".to_string(), "runboat-builds".to_string());
        vars.insert("RUNBOAT_BUILD_DOMAIN".to_string(), "builds.example.com".to_string());
        vars.insert("RUNBOAT_API_ADMIN_USER".to_string(), "admin".to_string());
        vars.insert("RUNBOAT_API_ADMIN_PASSWD".to_string(), "secret".to_string());
        vars
    }

    #[test]
    fn minimal_configuration_with_defaults() {
        let settings = Settings::from_vars(&base_vars()).unwrap();
        assert_eq!(settings.repos.len(), 1);
        assert_eq!(settings.max_initializing, 2);
        assert_eq!(settings.max_started, 6);
        assert_eq!(settings.max_deployed, 10);
        assert_eq!(settings.shutdown_deadline, Duration::from_secs(10));
        assert!(settings.github_token.is_none());
    }

    #[test]
    fn missing_required_setting_is_an_error() {
        let mut vars = base_vars();
        vars.remove("RUNBOAT_BUILD_NAMESPACE");
        let err = Settings::from_vars(&vars).unwrap_err();
        assert!(matches!(err, SettingsError::Missing(key) if key == "RUNBOAT_BUILD_NAMESPACE"));
    }

    #[test]
    fn malformed_repo_rules_are_an_error() {
        let mut vars = base_vars();
        vars.insert("RUNBOAT_REPOS".to_string(), "not json".to_string());
        assert!(matches!(
            Settings::from_vars(&vars),
            Err(SettingsError::Invalid { .. })
        ));
    }

    #[test]
    fn zero_capacity_limits_are_rejected() {
        let mut vars = base_vars();
        vars.insert("RUNBOAT_MAX_STARTED".to_string(), "0".to_string());
        assert!(matches!(
            Settings::from_vars(&vars),
            Err(SettingsError::Invalid { .. })
        ));
    }

    #[test]
    fn env_maps_parse_from_json() {
        let mut vars = base_vars();
        vars.insert(
            "RUNBOAT_BUILD_ENV".to_string(),
            r#"{"PGHOST": "db", "PGPORT": "5432"}"#.to_string(),
        );
        let settings = Settings::from_vars(&vars).unwrap();
        assert_eq!(settings.build_env.get("PGHOST").unwrap(), "db");
        // Recipe extras override globals.
        let mut recipe = BuildRecipe {
            image: "img:1".to_string(),
            ..Default::default()
        };
        recipe.env.insert("PGHOST".to_string(), "other".to_string());
        assert_eq!(settings.merged_env(Some(&recipe)).get("PGHOST").unwrap(), "other");
    }
}
