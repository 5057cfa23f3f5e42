//! Deterministic build names.
//!
//! A build name is a DNS label derived from the commit tuple. The same
//! tuple always yields the same name, and the tuple is recoverable from
//! the annotations on the workload, so names never need to be stored
//! anywhere but the cluster.

use crate::commit::CommitInfo;

/// Maximum length of a DNS label, which build names must fit.
pub const MAX_NAME_LEN: usize = 63;

/// Lowercases and replaces every character outside `[a-z0-9]` with `-`.
pub fn slugify(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect()
}

/// Derives the deterministic build name for a commit.
///
/// Shape: `<repo>-<target_branch>[-pr<pr>]-<commit[:8]>`, slugified.
/// When the result would exceed a DNS label, the branch segment is
/// shortened first, then the repo segment; the pr and commit suffix are
/// always preserved so distinct commits never collide.
pub fn build_name(commit: &CommitInfo) -> String {
    let repo = slugify(&commit.repo);
    let branch = slugify(&commit.target_branch);
    let suffix = match commit.pr {
        Some(pr) => format!("-pr{pr}-{}", commit.short_commit()),
        None => format!("-{}", commit.short_commit()),
    };
    let room = MAX_NAME_LEN - suffix.len();
    let mut stem = format!("{repo}-{branch}");
    if stem.len() > room {
        // Shorten the branch before touching the repo segment.
        let keep_branch = branch.len().saturating_sub(stem.len() - room);
        stem = if keep_branch > 0 {
            format!("{repo}-{}", &branch[..keep_branch])
        } else {
            repo[..repo.len().min(room)].to_string()
        };
    }
    let name = format!("{}{suffix}", stem.trim_end_matches('-'));
    debug_assert!(name.len() <= MAX_NAME_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(repo: &str, branch: &str, pr: Option<u64>) -> CommitInfo {
        CommitInfo::new(repo, branch, pr, &"a".repeat(40))
    }

    #[test]
    fn slugify_replaces_non_alphanumerics() {
        assert_eq!(slugify("OCA/mis-builder"), "oca-mis-builder");
        assert_eq!(slugify("feature/foo_bar"), "feature-foo-bar");
    }

    #[test]
    fn name_shape_for_branch() {
        let name = build_name(&commit("acme/svc", "main", None));
        assert_eq!(name, "acme-svc-main-aaaaaaaa");
    }

    #[test]
    fn name_shape_for_pr() {
        let name = build_name(&commit("acme/svc", "16.0", Some(42)));
        assert_eq!(name, "acme-svc-16-0-pr42-aaaaaaaa");
    }

    #[test]
    fn name_is_deterministic() {
        let a = build_name(&commit("Acme/Svc", "main", None));
        let b = build_name(&commit("acme/svc", "main", None));
        assert_eq!(a, b);
    }

    #[test]
    fn long_names_fit_a_dns_label_and_keep_the_commit() {
        let long_branch = "this-is-a-very-long-feature-branch-name-that-keeps-going";
        let name = build_name(&commit("some-org/some-repository-name", long_branch, Some(12345)));
        assert!(name.len() <= MAX_NAME_LEN, "{name} is too long");
        assert!(name.ends_with("-pr12345-aaaaaaaa"));
    }

    #[test]
    fn distinct_commits_never_collide() {
        let c1 = CommitInfo::new("acme/svc", "main", None, &"a".repeat(40));
        let c2 = CommitInfo::new("acme/svc", "main", None, &"b".repeat(40));
        assert_ne!(build_name(&c1), build_name(&c2));
    }
}
