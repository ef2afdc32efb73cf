//! Forest of namespaces
//!
//! The in-memory hierarchy the admission validators consult. One lock
//! guards the whole structure; holders do structural reads and writes only,
//! never API calls.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Default, Clone)]
pub struct ForestNamespace {
    parent: Option<String>,
    children: BTreeSet<String>,
    allow_cascading_deletion: bool,
}

impl ForestNamespace {
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &BTreeSet<String> {
        &self.children
    }

    pub fn allows_cascading_deletion(&self) -> bool {
        self.allow_cascading_deletion
    }
}

#[derive(Default)]
struct ForestState {
    namespaces: BTreeMap<String, ForestNamespace>,
}

/// Forest of namespaces behind a single lock.
#[derive(Default)]
pub struct Forest {
    state: Mutex<ForestState>,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> ForestNamespace {
        self.state
            .lock()
            .expect("forest lock poisoned")
            .namespaces
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("forest lock poisoned")
            .namespaces
            .keys()
            .cloned()
            .collect()
    }

    /// Rewire a namespace under a new parent (or to a root with `None`).
    pub fn set_parent(&self, name: &str, parent: Option<&str>) {
        let mut state = self.state.lock().expect("forest lock poisoned");
        let old_parent = state
            .namespaces
            .entry(name.to_string())
            .or_default()
            .parent
            .take();
        if let Some(old_parent) = old_parent {
            if let Some(entry) = state.namespaces.get_mut(&old_parent) {
                entry.children.remove(name);
            }
        }
        if let Some(parent) = parent {
            state
                .namespaces
                .entry(parent.to_string())
                .or_default()
                .children
                .insert(name.to_string());
        }
        state
            .namespaces
            .entry(name.to_string())
            .or_default()
            .parent = parent.map(String::from);
    }

    pub fn set_allow_cascading_deletion(&self, name: &str, allow: bool) {
        let mut state = self.state.lock().expect("forest lock poisoned");
        state
            .namespaces
            .entry(name.to_string())
            .or_default()
            .allow_cascading_deletion = allow;
    }

    pub fn remove(&self, name: &str) {
        self.set_parent(name, None);
        let mut state = self.state.lock().expect("forest lock poisoned");
        state.namespaces.remove(name);
    }

    /// All transitive descendants of a namespace.
    pub fn descendant_names(&self, name: &str) -> Vec<String> {
        let state = self.state.lock().expect("forest lock poisoned");
        let mut result = Vec::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            if let Some(entry) = state.namespaces.get(&current) {
                for child in &entry.children {
                    result.push(child.clone());
                    frontier.push(child.clone());
                }
            }
        }
        result
    }

    /// Whether `candidate` is `name` itself or one of its descendants.
    /// Setting such a namespace as `name`'s parent would create a cycle.
    pub fn would_cycle(&self, name: &str, candidate: &str) -> bool {
        name == candidate || self.descendant_names(name).iter().any(|d| d == candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Forest {
        // a ─ b ─ c, plus root d
        let forest = Forest::new();
        forest.set_parent("b", Some("a"));
        forest.set_parent("c", Some("b"));
        forest.set_parent("d", None);
        forest
    }

    #[test]
    fn test_descendants() {
        let forest = tree();
        let mut descendants = forest.descendant_names("a");
        descendants.sort();
        assert_eq!(descendants, ["b", "c"]);
        assert!(forest.descendant_names("d").is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let forest = tree();
        assert!(forest.would_cycle("a", "a"));
        assert!(forest.would_cycle("a", "c"));
        assert!(!forest.would_cycle("c", "d"));
    }

    #[test]
    fn test_reparent_moves_child_links() {
        let forest = tree();
        forest.set_parent("c", Some("a"));
        assert_eq!(forest.get("c").parent(), Some("a"));
        assert!(!forest.get("b").children().contains("c"));
        assert!(forest.get("a").children().contains("c"));
    }
}
