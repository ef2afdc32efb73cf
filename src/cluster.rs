//! Tenant cluster handles and in-memory object stores
//!
//! A [`TenantCluster`] bundles the identity of one tenant control plane with
//! its client handle and the per-kind caches the watchers feed. Stores are
//! created lazily per type, so every controller watching the same cluster
//! shares one cache per kind.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use kube::api::Api;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;

use crate::conversion::{self, OwnerInfo};
use crate::syncer::error::{Result, SyncerError};

/// Lifecycle of a tenant cluster. The listener bus joins a cluster when it
/// transitions to `Running` and unjoins it on `Deleted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    Pending,
    Running,
    Error,
    Deleted,
}

/// Key of a namespaced object; cluster-scoped objects use an empty
/// namespace component.
pub type ObjectKey = (String, String);

/// A read-through cache of one resource kind, fed by a watcher (or by tests
/// directly).
pub struct ObjectStore<K> {
    objects: RwLock<HashMap<ObjectKey, Arc<K>>>,
}

impl<K> Default for ObjectStore<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl<K> ObjectStore<K> {
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .read()
            .expect("object store lock poisoned")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects
            .read()
            .expect("object store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn insert(&self, namespace: &str, name: &str, object: K) {
        self.objects
            .write()
            .expect("object store lock poisoned")
            .insert((namespace.to_string(), name.to_string()), Arc::new(object));
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.objects
            .write()
            .expect("object store lock poisoned")
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn clear(&self) {
        self.objects
            .write()
            .expect("object store lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .expect("object store lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> ObjectStore<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Insert an object under its own coordinates.
    pub fn apply(&self, object: K) {
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let name = object.meta().name.clone().unwrap_or_default();
        self.insert(&namespace, &name, object);
    }

    /// Remove an object by its own coordinates.
    pub fn delete(&self, object: &K) {
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let name = object.meta().name.clone().unwrap_or_default();
        self.remove(&namespace, &name);
    }

    /// Replace the full contents, as a watcher does on re-list.
    pub fn replace_all(&self, objects: Vec<K>) {
        let mut map = HashMap::with_capacity(objects.len());
        for object in objects {
            let namespace = object.meta().namespace.clone().unwrap_or_default();
            let name = object.meta().name.clone().unwrap_or_default();
            map.insert((namespace, name), Arc::new(object));
        }
        *self.objects.write().expect("object store lock poisoned") = map;
    }
}

pub type Store<K> = Arc<ObjectStore<K>>;

/// One tenant control plane as seen by the syncer.
pub struct TenantCluster {
    name: String,
    namespace: String,
    uid: String,
    cluster_key: String,
    client: Option<Client>,
    state: RwLock<ClusterState>,
    stores: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl TenantCluster {
    pub fn new(name: &str, namespace: &str, uid: &str, client: Client) -> Arc<Self> {
        Arc::new(Self {
            cluster_key: conversion::to_cluster_key(namespace, name, uid),
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: uid.to_string(),
            client: Some(client),
            state: RwLock::new(ClusterState::Pending),
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// A cluster without a client handle: its caches are fed directly.
    /// Used by tests and by dry-run tooling.
    pub fn detached(name: &str, namespace: &str, uid: &str) -> Arc<Self> {
        Arc::new(Self {
            cluster_key: conversion::to_cluster_key(namespace, name, uid),
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: uid.to_string(),
            client: None,
            state: RwLock::new(ClusterState::Running),
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The opaque, stable key identifying this cluster everywhere in the
    /// syncer and on super-side labels.
    pub fn cluster_key(&self) -> &str {
        &self.cluster_key
    }

    pub fn owner_info(&self) -> OwnerInfo {
        OwnerInfo {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            uid: self.uid.clone(),
        }
    }

    pub fn state(&self) -> ClusterState {
        *self.state.read().expect("cluster state lock poisoned")
    }

    pub fn set_state(&self, state: ClusterState) {
        *self.state.write().expect("cluster state lock poisoned") = state;
    }

    pub fn client(&self) -> Option<Client> {
        self.client.clone()
    }

    /// The shared cache of kind `K` for this cluster, created on first use.
    pub fn store<K: Send + Sync + 'static>(&self) -> Store<K> {
        let mut stores = self.stores.lock().expect("cluster stores lock poisoned");
        let entry = stores
            .entry(TypeId::of::<K>())
            .or_insert_with(|| Box::new(Store::<K>::default()));
        entry
            .downcast_ref::<Store<K>>()
            .expect("store type registry corrupted")
            .clone()
    }

    /// Namespaced API handle on the tenant control plane.
    pub fn api_namespaced<K>(&self, namespace: &str) -> Result<Api<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + DeserializeOwned,
    {
        let client = self
            .client
            .clone()
            .ok_or_else(|| SyncerError::NoClusterClient(self.cluster_key.clone()))?;
        Ok(Api::namespaced(client, namespace))
    }

    /// Cluster-scoped API handle on the tenant control plane.
    pub fn api_cluster<K>(&self) -> Result<Api<K>>
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope, DynamicType = ()> + DeserializeOwned,
    {
        let client = self
            .client
            .clone()
            .ok_or_else(|| SyncerError::NoClusterClient(self.cluster_key.clone()))?;
        Ok(Api::all(client))
    }
}
