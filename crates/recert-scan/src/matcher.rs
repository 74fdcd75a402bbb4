//! Policy matching over repository-relative paths.
//!
//! Every include and exclude glob is compiled once when the set is built, so a
//! malformed glob surfaces as a configuration error before any file is matched.

use glob::{MatchOptions, Pattern};
use recert_core::{Policy, RecertError};

/// Glob options shared by policies and assignment rules: `*` stops at `/`,
/// `**` spans directories.
pub const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compile a single glob.
///
/// # Errors
///
/// Returns [`RecertError::Pattern`] if the glob is malformed.
///
/// # Examples
///
/// ```
/// use recert_scan::matcher::{compile_glob, glob_matches};
///
/// let glob = compile_glob("modules/*.tf").unwrap();
/// assert!(glob_matches(&glob, "modules/vpc.tf"));
/// assert!(!glob_matches(&glob, "modules/net/vpc.tf"));
/// assert!(compile_glob("[unclosed").is_err());
/// ```
pub fn compile_glob(glob: &str) -> Result<Pattern, RecertError> {
    Pattern::new(glob).map_err(|e| RecertError::Pattern {
        pattern: glob.to_string(),
        reason: e.msg.to_string(),
    })
}

/// Match a `/`-normalized path against a compiled glob.
pub fn glob_matches(pattern: &Pattern, path: &str) -> bool {
    pattern.matches_with(path, MATCH_OPTIONS)
}

#[derive(Debug)]
struct CompiledPolicy {
    policy: Policy,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl CompiledPolicy {
    fn matches(&self, path: &str) -> bool {
        self.include.iter().any(|p| glob_matches(p, path))
            && !self.exclude.iter().any(|p| glob_matches(p, path))
    }
}

/// Ordered, precompiled recertification policies.
///
/// # Examples
///
/// ```
/// use recert_core::Policy;
/// use recert_scan::PolicySet;
///
/// let set = PolicySet::compile(&[
///     Policy::new("prod", vec!["prod/**/*.tf".into()], 30),
///     Policy::new("terraform", vec!["**/*.tf".into()], 90),
/// ])
/// .unwrap();
///
/// assert_eq!(set.find("prod/net/vpc.tf").unwrap().name, "prod");
/// assert_eq!(set.find("dev/vpc.tf").unwrap().name, "terraform");
/// assert!(set.find("README.md").is_none());
/// ```
#[derive(Debug, Default)]
pub struct PolicySet {
    policies: Vec<CompiledPolicy>,
}

impl PolicySet {
    /// Compile every policy, preserving configured order.
    ///
    /// Disabled policies are compiled too, so their globs are validated.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Pattern`] for the first malformed glob.
    pub fn compile(policies: &[Policy]) -> Result<Self, RecertError> {
        let policies = policies
            .iter()
            .map(|policy| {
                Ok(CompiledPolicy {
                    policy: policy.clone(),
                    include: policy
                        .include
                        .iter()
                        .map(|g| compile_glob(g))
                        .collect::<Result<_, _>>()?,
                    exclude: policy
                        .exclude
                        .iter()
                        .map(|g| compile_glob(g))
                        .collect::<Result<_, _>>()?,
                })
            })
            .collect::<Result<Vec<_>, RecertError>>()?;
        Ok(Self { policies })
    }

    /// First enabled policy matching `path`, in configured order.
    ///
    /// Backslashes are treated as separators.
    pub fn find(&self, path: &str) -> Option<&Policy> {
        let normalized = path.replace('\\', "/");
        self.policies
            .iter()
            .filter(|c| c.policy.enabled)
            .find(|c| c.matches(&normalized))
            .map(|c| &c.policy)
    }

    /// Policy by name, enabled or not.
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies
            .iter()
            .map(|c| &c.policy)
            .find(|p| p.name == name)
    }

    /// Number of compiled policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the set holds no policies.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(name: &str, include: &[&str], exclude: &[&str]) -> Policy {
        let mut p = Policy::new(name, include.iter().map(|s| s.to_string()).collect(), 90);
        p.exclude = exclude.iter().map(|s| s.to_string()).collect();
        p
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let set = PolicySet::compile(&[policy("top", &["*.tf"], &[])]).unwrap();
        assert!(set.find("main.tf").is_some());
        assert!(set.find("modules/main.tf").is_none());
    }

    #[test]
    fn double_star_spans_directories() {
        let set = PolicySet::compile(&[policy("all", &["**/*.tf"], &[])]).unwrap();
        assert!(set.find("main.tf").is_some());
        assert!(set.find("a/b/c/main.tf").is_some());
        assert!(set.find("a/b/c/main.tfvars").is_none());
    }

    #[test]
    fn first_matching_policy_wins() {
        let set = PolicySet::compile(&[
            policy("broad", &["**/*.tf"], &[]),
            policy("narrow", &["prod/*.tf"], &[]),
        ])
        .unwrap();
        assert_eq!(set.find("prod/main.tf").unwrap().name, "broad");

        let set = PolicySet::compile(&[
            policy("narrow", &["prod/*.tf"], &[]),
            policy("broad", &["**/*.tf"], &[]),
        ])
        .unwrap();
        assert_eq!(set.find("prod/main.tf").unwrap().name, "narrow");
    }

    #[test]
    fn exclude_vetoes_include() {
        let set = PolicySet::compile(&[
            policy("tf", &["**/*.tf"], &["**/generated/**"]),
            policy("fallback", &["**"], &[]),
        ])
        .unwrap();
        assert_eq!(set.find("net/main.tf").unwrap().name, "tf");
        assert_eq!(set.find("net/generated/main.tf").unwrap().name, "fallback");
    }

    #[test]
    fn disabled_policies_are_skipped() {
        let mut off = policy("off", &["**/*.tf"], &[]);
        off.enabled = false;
        let set = PolicySet::compile(&[off, policy("on", &["**/*.tf"], &[])]).unwrap();
        assert_eq!(set.find("main.tf").unwrap().name, "on");
        assert!(set.get("off").is_some());
    }

    #[test]
    fn windows_separators_are_normalized() {
        let set = PolicySet::compile(&[policy("tf", &["infra/*.tf"], &[])]).unwrap();
        assert!(set.find("infra\\main.tf").is_some());
    }

    #[test]
    fn malformed_glob_is_rejected_at_compile_time() {
        let err = PolicySet::compile(&[policy("bad", &["infra/[*.tf"], &[])]).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("infra/[*.tf"));
    }

    #[test]
    fn malformed_exclude_in_disabled_policy_is_still_rejected() {
        let mut p = policy("bad", &["*.tf"], &["***"]);
        p.enabled = false;
        assert!(PolicySet::compile(&[p]).is_err());
    }
}
