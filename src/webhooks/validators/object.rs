//! Propagated-object admission
//!
//! This validator fails open: if the webhook is down, object changes are
//! allowed. An object carrying the `LABEL_INHERITED_FROM` marker was
//! propagated into its namespace by the hierarchy adjunct; only the service
//! account may modify or delete it, unless the namespace is terminating.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::SyncerConfiguration;
use crate::constants::LABEL_INHERITED_FROM;
use crate::webhooks::validators::{allow, deny, AdmissionVerdict, Operation};

/// The decoded aspects of an object admission request the rules care about.
pub struct ObjectReview<'a> {
    pub operation: Operation,
    pub namespace: &'a str,
    pub username: &'a str,
    pub group: &'a str,
    pub resource: &'a str,
    pub old_labels: Option<&'a BTreeMap<String, String>>,
    pub new_labels: Option<&'a BTreeMap<String, String>>,
    pub namespace_terminating: bool,
}

pub struct ObjectValidator {
    pub config: Arc<SyncerConfiguration>,
    pub excluded: BTreeSet<String>,
    pub service_account: String,
}

impl ObjectValidator {
    pub fn new(
        config: Arc<SyncerConfiguration>,
        excluded: BTreeSet<String>,
        service_account: &str,
    ) -> Self {
        Self {
            config,
            excluded,
            service_account: service_account.to_string(),
        }
    }

    pub fn validate(&self, review: &ObjectReview<'_>) -> AdmissionVerdict {
        if self.excluded.contains(review.namespace) {
            return allow(&format!("excluded namespace {}", review.namespace));
        }
        if !self.config.is_propagated(review.group, review.resource) {
            return allow("resource kind is not in Propagate mode");
        }
        if review.username == self.service_account {
            return allow("service account");
        }

        let source =
            |labels: Option<&BTreeMap<String, String>>| -> Option<String> {
                labels.and_then(|l| l.get(LABEL_INHERITED_FROM)).cloned()
            };
        let old_source = source(review.old_labels);
        let new_source = source(review.new_labels);

        if old_source.is_none() && new_source.is_none() {
            return allow("source object");
        }
        if review.namespace_terminating {
            return allow("namespace is terminating");
        }
        let origin = old_source.or(new_source).unwrap_or_default();
        let action = match review.operation {
            Operation::Create => "create",
            Operation::Update => "modify",
            Operation::Delete => "delete",
        };
        deny(
            "Forbidden",
            format!(
                "Cannot {} an object propagated from namespace {:?}; make the change in the source namespace instead",
                action, origin
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ObjectValidator {
        ObjectValidator::new(
            Arc::new(SyncerConfiguration::default()),
            BTreeSet::from(["kube-system".to_string()]),
            "system:serviceaccount:vc-manager:vc-syncer",
        )
    }

    fn inherited_labels() -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_INHERITED_FROM.to_string(), "parent-ns".to_string())])
    }

    fn review<'a>(
        operation: Operation,
        namespace: &'a str,
        username: &'a str,
        old_labels: Option<&'a BTreeMap<String, String>>,
        terminating: bool,
    ) -> ObjectReview<'a> {
        ObjectReview {
            operation,
            namespace,
            username,
            group: "",
            resource: "configmaps",
            old_labels,
            new_labels: old_labels,
            namespace_terminating: terminating,
        }
    }

    #[test]
    fn test_non_service_account_cannot_touch_propagated_object() {
        let v = validator();
        let labels = inherited_labels();
        let verdict = v.validate(&review(
            Operation::Delete,
            "child-ns",
            "alice",
            Some(&labels),
            false,
        ));
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("propagated from namespace"));
    }

    #[test]
    fn test_service_account_is_allowed() {
        let v = validator();
        let labels = inherited_labels();
        let verdict = v.validate(&review(
            Operation::Update,
            "child-ns",
            "system:serviceaccount:vc-manager:vc-syncer",
            Some(&labels),
            false,
        ));
        assert!(verdict.allowed);
    }

    #[test]
    fn test_terminating_namespace_is_allowed() {
        let v = validator();
        let labels = inherited_labels();
        let verdict = v.validate(&review(
            Operation::Delete,
            "child-ns",
            "alice",
            Some(&labels),
            true,
        ));
        assert!(verdict.allowed);
    }

    #[test]
    fn test_source_objects_are_unrestricted() {
        let v = validator();
        let verdict = v.validate(&review(Operation::Update, "child-ns", "alice", None, false));
        assert!(verdict.allowed);
    }

    #[test]
    fn test_excluded_namespace_and_non_propagate_kind_skip_checks() {
        let v = validator();
        let labels = inherited_labels();
        assert!(v
            .validate(&review(
                Operation::Delete,
                "kube-system",
                "alice",
                Some(&labels),
                false,
            ))
            .allowed);

        let mut other = review(Operation::Delete, "child-ns", "alice", Some(&labels), false);
        other.resource = "deployments";
        other.group = "apps";
        assert!(v.validate(&other).allowed);
    }
}
