//! Maps `(repo, branch)` pairs to build recipes.
//!
//! Rules are an ordered list; the first rule whose repo and branch
//! regexes both match wins. Patterns are fully anchored here so a rule
//! written as `acme/.*` cannot accidentally match `evil-acme/x`.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// How to build a matched repo/branch: image plus rendering extras.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecipe {
    /// Container image (`name:tag`).
    pub image: String,
    /// Template directory overriding the default kubefiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubefiles_path: Option<PathBuf>,
    /// Extra environment for the build container and jobs.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra secret environment.
    #[serde(default)]
    pub secret_env: BTreeMap<String, String>,
    /// Extra variables for template rendering.
    #[serde(default)]
    pub template_vars: BTreeMap<String, String>,
}

/// One configured rule: which repos and branches it covers, and the
/// recipe to build them with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRule {
    /// Regex on `owner/name` (matched case-insensitively).
    pub repo: String,
    /// Regex on the target branch.
    pub branch: String,
    /// The recipe for matched builds. Exactly one per rule.
    pub builds: Vec<BuildRecipe>,
}

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("rule for {repo:?} must have exactly one build recipe")]
    BadRecipeCount { repo: String },
}

#[derive(Debug)]
struct CompiledRule {
    repo: Regex,
    branch: Regex,
    recipe: BuildRecipe,
}

/// Compiled, ordered rule set. Pure and side-effect free: matching never
/// touches the cluster, so the webhook path can use it to discard
/// irrelevant events cheaply.
#[derive(Debug)]
pub struct RepoMatcher {
    rules: Vec<CompiledRule>,
}

impl RepoMatcher {
    pub fn new(rules: &[RepoRule]) -> Result<Self, MatcherError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.builds.len() != 1 {
                return Err(MatcherError::BadRecipeCount {
                    repo: rule.repo.clone(),
                });
            }
            compiled.push(CompiledRule {
                repo: compile(&rule.repo, true)?,
                branch: compile(&rule.branch, false)?,
                recipe: rule.builds[0].clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Returns the recipe of the first matching rule, or `None` when the
    /// repo/branch pair is not supported.
    pub fn recipe_for(&self, repo: &str, target_branch: &str) -> Option<&BuildRecipe> {
        self.rules
            .iter()
            .find(|r| r.repo.is_match(repo) && r.branch.is_match(target_branch))
            .map(|r| &r.recipe)
    }

    pub fn is_supported(&self, repo: &str, target_branch: &str) -> bool {
        self.recipe_for(repo, target_branch).is_some()
    }
}

fn compile(pattern: &str, case_insensitive: bool) -> Result<Regex, MatcherError> {
    RegexBuilder::new(&format!("^(?:{pattern})$"))
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|source| MatcherError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(repo: &str, branch: &str, image: &str) -> RepoRule {
        RepoRule {
            repo: repo.to_string(),
            branch: branch.to_string(),
            builds: vec![BuildRecipe {
                image: image.to_string(),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn first_match_wins() {
        let matcher = RepoMatcher::new(&[
            rule("acme/svc", "main", "img:main"),
            rule("acme/.*", ".*", "img:any"),
        ])
        .unwrap();
        assert_eq!(matcher.recipe_for("acme/svc", "main").unwrap().image, "img:main");
        assert_eq!(matcher.recipe_for("acme/svc", "dev").unwrap().image, "img:any");
        assert_eq!(matcher.recipe_for("acme/other", "main").unwrap().image, "img:any");
    }

    #[test]
    fn no_match_is_rejected() {
        let matcher = RepoMatcher::new(&[rule("acme/svc", "main", "img:1")]).unwrap();
        assert!(matcher.recipe_for("other/repo", "main").is_none());
        assert!(!matcher.is_supported("acme/svc", "feature"));
    }

    #[test]
    fn patterns_are_anchored() {
        let matcher = RepoMatcher::new(&[rule("acme/svc", "15.0", "img:1")]).unwrap();
        assert!(!matcher.is_supported("evil-acme/svc", "15.0"));
        assert!(!matcher.is_supported("acme/svc", "15.0-extra"));
    }

    #[test]
    fn repo_match_is_case_insensitive() {
        let matcher = RepoMatcher::new(&[rule("acme/svc", "main", "img:1")]).unwrap();
        assert!(matcher.is_supported("Acme/Svc", "main"));
        assert!(!matcher.is_supported("acme/svc", "Main"));
    }

    #[test]
    fn invalid_regex_is_reported() {
        let err = RepoMatcher::new(&[rule("acme/(", "main", "img:1")]).unwrap_err();
        assert!(matches!(err, MatcherError::InvalidRegex { .. }));
    }

    #[test]
    fn exactly_one_recipe_per_rule() {
        let mut r = rule("acme/svc", "main", "img:1");
        r.builds.push(BuildRecipe::default());
        assert!(matches!(
            RepoMatcher::new(&[r]),
            Err(MatcherError::BadRecipeCount { .. })
        ));
    }
}
