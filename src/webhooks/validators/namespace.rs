//! Namespace and hierarchy admission
//!
//! This validator fails closed: if the webhook is down, namespace changes
//! are forbidden. Excluded namespaces (kube-system and friends) can neither
//! gain a parent nor become one.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::webhooks::forest::Forest;
use crate::webhooks::validators::{allow, deny, AdmissionVerdict};

pub struct NamespaceValidator {
    pub forest: Arc<Forest>,
    pub excluded: BTreeSet<String>,
    pub service_account: String,
}

impl NamespaceValidator {
    pub fn new(forest: Arc<Forest>, excluded: BTreeSet<String>, service_account: &str) -> Self {
        Self {
            forest,
            excluded,
            service_account: service_account.to_string(),
        }
    }

    /// Validate a hierarchy change that sets `namespace`'s parent.
    pub fn validate_parent_change(
        &self,
        username: &str,
        namespace: &str,
        new_parent: Option<&str>,
    ) -> AdmissionVerdict {
        if username == self.service_account {
            return allow("service account");
        }
        if self.excluded.contains(namespace) {
            return deny(
                "Forbidden",
                format!(
                    "Cannot set the excluded namespace {:?} as a child of another namespace",
                    namespace
                ),
            );
        }
        let Some(parent) = new_parent else {
            return allow("cleared parent");
        };
        if self.excluded.contains(parent) {
            return deny(
                "Forbidden",
                format!("Cannot set the parent to the excluded namespace {:?}", parent),
            );
        }
        if self.forest.would_cycle(namespace, parent) {
            return deny(
                "Conflict",
                format!(
                    "Setting the parent of {:?} to {:?} would create a cycle",
                    namespace, parent
                ),
            );
        }
        allow("")
    }

    /// Validate a namespace deletion against the hierarchy.
    pub fn validate_delete(&self, username: &str, namespace: &str) -> AdmissionVerdict {
        if username == self.service_account {
            return allow("service account");
        }
        let entry = self.forest.get(namespace);
        if entry.children().is_empty() || entry.allows_cascading_deletion() {
            return allow("no child namespaces");
        }
        deny(
            "Forbidden",
            format!(
                "Namespace {:?} has child namespaces. Remove them first, or set allowCascadingDeletion to delete them automatically",
                namespace
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> NamespaceValidator {
        let forest = Arc::new(Forest::new());
        forest.set_parent("b", Some("a"));
        forest.set_parent("c", Some("b"));
        NamespaceValidator::new(
            forest,
            BTreeSet::from(["kube-system".to_string()]),
            "system:serviceaccount:vc-manager:vc-syncer",
        )
    }

    #[test]
    fn test_excluded_parent_is_denied() {
        let v = validator();
        let verdict = v.validate_parent_change("alice", "a", Some("kube-system"));
        assert!(!verdict.allowed);
        assert!(verdict
            .message
            .contains("Cannot set the parent to the excluded namespace"));
    }

    #[test]
    fn test_excluded_child_is_denied() {
        let v = validator();
        let verdict = v.validate_parent_change("alice", "kube-system", Some("a"));
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("Cannot set the excluded namespace"));
    }

    #[test]
    fn test_cycle_is_denied() {
        let v = validator();
        let verdict = v.validate_parent_change("alice", "a", Some("c"));
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("cycle"));
        assert_eq!(verdict.code, 409);
    }

    #[test]
    fn test_valid_parent_is_allowed() {
        let v = validator();
        assert!(v.validate_parent_change("alice", "c", Some("a")).allowed);
        assert!(v.validate_parent_change("alice", "a", None).allowed);
    }

    #[test]
    fn test_service_account_bypasses_checks() {
        let v = validator();
        let verdict = v.validate_parent_change(
            "system:serviceaccount:vc-manager:vc-syncer",
            "a",
            Some("kube-system"),
        );
        assert!(verdict.allowed);
    }

    #[test]
    fn test_delete_with_children_is_denied() {
        let v = validator();
        assert!(!v.validate_delete("alice", "a").allowed);
        assert!(v.validate_delete("alice", "c").allowed);
        v.forest.set_allow_cascading_deletion("a", true);
        assert!(v.validate_delete("alice", "a").allowed);
    }
}
