//! Scheduler view of tenant namespaces and their slices

use std::collections::BTreeMap;

use crate::scheduler::quantity::{self, ResourceList};
use crate::scheduler::SchedulerError;

/// Assignment of a number of slices of one namespace to one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    cluster: String,
    num: usize,
}

impl Placement {
    pub fn new(cluster: &str, num: usize) -> Self {
        Self {
            cluster: cluster.to_string(),
            num,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn num(&self) -> usize {
        self.num
    }
}

/// A fixed resource quantum of one namespace, pinned to one cluster.
/// Immutable after creation.
#[derive(Clone, Debug, PartialEq)]
pub struct Slice {
    owner: String,
    unit: ResourceList,
    cluster: String,
}

impl Slice {
    pub fn new(owner: &str, unit: ResourceList, cluster: &str) -> Self {
        Self {
            owner: owner.to_string(),
            unit,
            cluster: cluster.to_string(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn unit(&self) -> &ResourceList {
        &self.unit
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }
}

/// A tenant namespace with a quota divided into fixed-size slices.
#[derive(Clone, Debug)]
pub struct Namespace {
    owner: String,
    name: String,
    labels: BTreeMap<String, String>,
    quota: ResourceList,
    quota_slice: ResourceList,
    schedule: Vec<Placement>,
}

impl Namespace {
    pub fn new(
        owner: &str,
        name: &str,
        labels: BTreeMap<String, String>,
        quota: ResourceList,
        quota_slice: ResourceList,
        schedule: Vec<Placement>,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            labels,
            quota,
            quota_slice,
            schedule,
        }
    }

    /// `owner/name`, the namespace's identity throughout the cache.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn quota(&self) -> &ResourceList {
        &self.quota
    }

    pub fn quota_slice(&self) -> &ResourceList {
        &self.quota_slice
    }

    pub fn schedule(&self) -> &[Placement] {
        &self.schedule
    }

    pub fn placement_map(&self) -> BTreeMap<String, usize> {
        self.schedule
            .iter()
            .map(|p| (p.cluster.clone(), p.num))
            .collect()
    }

    pub fn set_new_placements(&mut self, placements: BTreeMap<String, usize>) {
        self.schedule = placements
            .into_iter()
            .map(|(cluster, num)| Placement { cluster, num })
            .collect();
    }

    /// Number of slices the quota divides into: the max over all resources
    /// of `ceil(quota / quotaSlice)`.
    pub fn total_slices(&self) -> Result<usize, SchedulerError> {
        least_fit_slice_num(&self.quota, &self.quota_slice)
    }

    /// Two namespaces can be swapped in a plan only when their slice sizes
    /// are componentwise equal.
    pub fn comparable(&self, other: &Namespace) -> bool {
        quantity::equals(&self.quota_slice, &other.quota_slice)
    }
}

/// The least number of equally-sized slices covering a quota.
pub fn least_fit_slice_num(
    quota: &ResourceList,
    quota_slice: &ResourceList,
) -> Result<usize, SchedulerError> {
    let mut uncovered: BTreeMap<&str, ()> = quota.keys().map(|k| (k.as_str(), ())).collect();
    let mut num = 0usize;
    for (resource, slice_quantity) in quota_slice {
        let quota_quantity = quota
            .get(resource)
            .ok_or_else(|| SchedulerError::MissingQuotaResource(resource.clone()))?;
        let slice_value = quantity::parse_milli(slice_quantity)?;
        let quota_value = quantity::parse_milli(quota_quantity)?;
        if slice_value == 0 {
            return Err(SchedulerError::ZeroSliceResource(resource.clone()));
        }
        uncovered.remove(resource.as_str());
        if quota_value < slice_value {
            return Err(SchedulerError::SliceLargerThanQuota(resource.clone()));
        }
        let n = ((quota_value + slice_value - 1) / slice_value) as usize;
        num = num.max(n);
    }
    if let Some((resource, _)) = uncovered.into_iter().next() {
        return Err(SchedulerError::MissingSliceResource(resource.to_string()));
    }
    Ok(num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn list(pairs: &[(&str, &str)]) -> ResourceList {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    #[test]
    fn test_least_fit_takes_max_over_resources() {
        let quota = list(&[("cpu", "2000m"), ("memory", "4Gi")]);
        let slice = list(&[("cpu", "500m"), ("memory", "1Gi")]);
        assert_eq!(least_fit_slice_num(&quota, &slice).unwrap(), 4);

        let lopsided = list(&[("cpu", "250m"), ("memory", "1Gi")]);
        assert_eq!(least_fit_slice_num(&quota, &lopsided).unwrap(), 8);
    }

    #[test]
    fn test_least_fit_rounds_up() {
        let quota = list(&[("cpu", "900m")]);
        let slice = list(&[("cpu", "400m")]);
        assert_eq!(least_fit_slice_num(&quota, &slice).unwrap(), 3);
    }

    #[test]
    fn test_least_fit_failure_modes() {
        let quota = list(&[("cpu", "2000m")]);
        assert!(matches!(
            least_fit_slice_num(&quota, &list(&[("memory", "1Gi")])),
            Err(SchedulerError::MissingQuotaResource(_))
        ));
        assert!(matches!(
            least_fit_slice_num(&quota, &list(&[("cpu", "0")])),
            Err(SchedulerError::ZeroSliceResource(_))
        ));
        assert!(matches!(
            least_fit_slice_num(&quota, &list(&[("cpu", "3000m")])),
            Err(SchedulerError::SliceLargerThanQuota(_))
        ));
        let quota2 = list(&[("cpu", "2000m"), ("memory", "4Gi")]);
        assert!(matches!(
            least_fit_slice_num(&quota2, &list(&[("cpu", "500m")])),
            Err(SchedulerError::MissingSliceResource(_))
        ));
    }

    #[test]
    fn test_comparable_requires_equal_slice() {
        let a = Namespace::new(
            "tenant",
            "ns-a",
            BTreeMap::new(),
            list(&[("cpu", "2000m")]),
            list(&[("cpu", "500m")]),
            Vec::new(),
        );
        let b = Namespace::new(
            "tenant",
            "ns-b",
            BTreeMap::new(),
            list(&[("cpu", "1000m")]),
            list(&[("cpu", "0.5")]),
            Vec::new(),
        );
        let c = Namespace::new(
            "tenant",
            "ns-c",
            BTreeMap::new(),
            list(&[("cpu", "1000m")]),
            list(&[("cpu", "250m")]),
            Vec::new(),
        );
        assert!(a.comparable(&b));
        assert!(!a.comparable(&c));
        assert_eq!(a.key(), "tenant/ns-a");
    }
}
