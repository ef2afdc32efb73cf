//! Per-cluster slice accounting
//!
//! A [`Cluster`] tracks its capacity, the slices allocated on it per
//! namespace, and pod placements. Slices are the quota currency: `alloc` is
//! always the componentwise sum of every allocated slice, and never exceeds
//! capacity. All mutations are atomic: a failed operation leaves the
//! cluster untouched.

use std::collections::BTreeMap;

use crate::scheduler::namespace::Slice;
use crate::scheduler::quantity::{self, ResourceList};
use crate::scheduler::SchedulerError;

/// A pod as tracked by the scheduler cache, for observability only; pods do
/// not alter slice accounting.
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerPod {
    owner: String,
    namespace: String,
    name: String,
    cluster: String,
    request: ResourceList,
}

impl SchedulerPod {
    pub fn new(
        owner: &str,
        namespace: &str,
        name: &str,
        cluster: &str,
        request: ResourceList,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            cluster: cluster.to_string(),
            request,
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.owner, self.namespace, self.name)
    }

    /// Key of the namespace this pod belongs to.
    pub fn namespace_key(&self) -> String {
        format!("{}/{}", self.owner, self.namespace)
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn request(&self) -> &ResourceList {
        &self.request
    }
}

#[derive(Clone, Debug)]
pub struct Cluster {
    name: String,
    labels: BTreeMap<String, String>,
    capacity: ResourceList,
    /// Milli-unit running total per resource; keys mirror capacity.
    alloc: BTreeMap<String, i128>,
    alloc_items: BTreeMap<String, Vec<Slice>>,
    pods: BTreeMap<String, SchedulerPod>,
}

impl Cluster {
    pub fn new(name: &str, labels: Option<BTreeMap<String, String>>, capacity: ResourceList) -> Self {
        let alloc = capacity.keys().map(|k| (k.clone(), 0i128)).collect();
        Self {
            name: name.to_string(),
            labels: labels.unwrap_or_default(),
            capacity,
            alloc,
            alloc_items: BTreeMap::new(),
            pods: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn capacity(&self) -> &ResourceList {
        &self.capacity
    }

    /// Current allocation in wire form.
    pub fn alloc(&self) -> ResourceList {
        quantity::format_list(&self.alloc)
    }

    pub fn slices_of(&self, namespace: &str) -> Option<&[Slice]> {
        self.alloc_items.get(namespace).map(Vec::as_slice)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.alloc_items.keys().cloned().collect()
    }

    pub fn pods(&self) -> &BTreeMap<String, SchedulerPod> {
        &self.pods
    }

    /// Allocate a namespace's slices on this cluster.
    ///
    /// Every slice must name this cluster, every resource in every slice
    /// must exist in capacity, and the resulting allocation must stay within
    /// capacity componentwise. A namespace already present fails. On any
    /// violation the cluster state is unchanged.
    pub fn add_namespace(&mut self, namespace: &str, slices: Vec<Slice>) -> Result<(), SchedulerError> {
        if self.alloc_items.contains_key(namespace) {
            return Err(SchedulerError::DuplicateNamespace(namespace.to_string()));
        }

        let capacity = quantity::parse_list(&self.capacity)?;
        let mut delta: BTreeMap<String, i128> = BTreeMap::new();
        for slice in &slices {
            if slice.cluster() != self.name {
                return Err(SchedulerError::WrongCluster {
                    slice_cluster: slice.cluster().to_string(),
                    cluster: self.name.clone(),
                });
            }
            for (resource, value) in quantity::parse_list(slice.unit())? {
                if !capacity.contains_key(&resource) {
                    return Err(SchedulerError::UnknownResource {
                        resource,
                        cluster: self.name.clone(),
                    });
                }
                *delta.entry(resource).or_insert(0) += value;
            }
        }

        for (resource, added) in &delta {
            let current = self.alloc.get(resource).copied().unwrap_or(0);
            let limit = capacity.get(resource).copied().unwrap_or(0);
            if current + added > limit {
                return Err(SchedulerError::CapacityExceeded {
                    resource: resource.clone(),
                    cluster: self.name.clone(),
                });
            }
        }

        for (resource, added) in delta {
            *self.alloc.entry(resource).or_insert(0) += added;
        }
        self.alloc_items.insert(namespace.to_string(), slices);
        Ok(())
    }

    /// Release every slice of a namespace. A missing namespace or an
    /// allocation that would go negative indicates cache corruption and
    /// fails without mutation.
    pub fn remove_namespace(&mut self, namespace: &str) -> Result<(), SchedulerError> {
        let slices = self
            .alloc_items
            .get(namespace)
            .ok_or_else(|| SchedulerError::NamespaceNotFound(namespace.to_string()))?;

        let mut delta: BTreeMap<String, i128> = BTreeMap::new();
        for slice in slices {
            for (resource, value) in quantity::parse_list(slice.unit())? {
                *delta.entry(resource).or_insert(0) += value;
            }
        }
        for (resource, removed) in &delta {
            let current = self.alloc.get(resource).copied().unwrap_or(0);
            if current - removed < 0 {
                return Err(SchedulerError::NegativeAlloc {
                    resource: resource.clone(),
                    cluster: self.name.clone(),
                });
            }
        }

        for (resource, removed) in delta {
            *self.alloc.entry(resource).or_insert(0) -= removed;
        }
        self.alloc_items.remove(namespace);
        Ok(())
    }

    /// Record a pod placement. Does not alter slice accounting.
    pub fn add_pod(&mut self, pod: SchedulerPod) {
        self.pods.insert(pod.key(), pod);
    }

    pub fn remove_pod(&mut self, pod: &SchedulerPod) {
        self.pods.remove(&pod.key());
    }

    /// Independent snapshot, used for scheduling plan simulation.
    pub fn deep_copy(&self) -> Cluster {
        self.clone()
    }
}
