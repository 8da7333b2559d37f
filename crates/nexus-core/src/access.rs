//! Access Evaluator (C4): matches `(spiffe_id, path, required permissions)`
//! against a policy set. Replaces the teacher's `glob_match`-based path
//! matcher (`vaultrs-core/src/policy.rs::check`) with anchored `regex`
//! full-string matching, as spec.md 4.4 requires over SPIFFE identity
//! strings rather than glob path segments — grounded on the `regex` usage in
//! `calimero-network-core/crates/auth`, the identity/auth-adjacent crate in
//! the retrieval pack.

use std::collections::HashSet;

use regex::Regex;
use tracing::warn;

use crate::policy::{Permission, Policy};

/// Wrap a user-supplied pattern so that matching is always a full-string
/// match, regardless of whether the caller already anchored it themselves.
fn full_match(pattern: &str, input: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(input),
        Err(e) => {
            warn!(pattern, error = %e, "policy pattern failed to compile; skipping policy");
            false
        }
    }
}

/// `true` iff the union of permissions granted by every policy matching
/// `(spiffe_id, path)` is a superset of `required`. `Permission::Super`
/// satisfies every requirement. An empty policy set denies everything.
/// A regex that fails to compile inside a policy is non-fatal: that policy
/// is simply skipped.
#[must_use]
pub fn check_access(
    policies: &[Policy],
    spiffe_id: &str,
    path: &str,
    required: &HashSet<Permission>,
) -> bool {
    let mut granted: HashSet<Permission> = HashSet::new();

    for policy in policies {
        if full_match(&policy.spiffe_id_pattern, spiffe_id) && full_match(&policy.path_pattern, path) {
            granted.extend(policy.permissions.iter().copied());
        }
    }

    if granted.contains(&Permission::Super) {
        return true;
    }
    granted.is_superset(required)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn policy(spiffe: &str, path: &str, perms: &[Permission]) -> Policy {
        Policy {
            id: "p1".into(),
            name: "p1".into(),
            spiffe_id_pattern: spiffe.into(),
            path_pattern: path.into(),
            permissions: perms.iter().copied().collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn matching_policy_grants_its_permissions() {
        let policies = vec![policy("^spiffe://t/app/.*$", "^app/.*$", &[Permission::Read])];
        let required = HashSet::from([Permission::Read]);
        assert!(check_access(&policies, "spiffe://t/app/web", "app/db", &required));
    }

    #[test]
    fn missing_permission_is_denied() {
        let policies = vec![policy("^spiffe://t/app/.*$", "^app/.*$", &[Permission::Read])];
        let required = HashSet::from([Permission::Write]);
        assert!(!check_access(&policies, "spiffe://t/app/web", "app/db", &required));
    }

    #[test]
    fn super_satisfies_everything() {
        let policies = vec![policy("^spiffe://t/app/.*$", "^app/.*$", &[Permission::Super])];
        let required = HashSet::from([Permission::Write, Permission::List]);
        assert!(check_access(&policies, "spiffe://t/app/web", "app/db", &required));
    }

    #[test]
    fn empty_policy_set_denies_everything() {
        let required = HashSet::from([Permission::Read]);
        assert!(!check_access(&[], "spiffe://t/app/web", "app/db", &required));
    }

    #[test]
    fn non_matching_identity_is_skipped() {
        let policies = vec![policy("^spiffe://t/other/.*$", "^app/.*$", &[Permission::Read])];
        let required = HashSet::from([Permission::Read]);
        assert!(!check_access(&policies, "spiffe://t/app/web", "app/db", &required));
    }

    #[test]
    fn uncompilable_pattern_is_skipped_not_fatal() {
        let policies = vec![policy("(unclosed", "^app/.*$", &[Permission::Read])];
        let required = HashSet::from([Permission::Read]);
        assert!(!check_access(&policies, "spiffe://t/app/web", "app/db", &required));
    }

    #[test]
    fn wildcard_path_matches_accepting_policy() {
        let policies = vec![policy("^spiffe://t/app/.*$", r"^\*$", &[Permission::List])];
        let required = HashSet::from([Permission::List]);
        assert!(check_access(&policies, "spiffe://t/app/web", "*", &required));
    }
}
