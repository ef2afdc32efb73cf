//! Super-cluster write path
//!
//! Syncers decide *what* to do against the super cluster; executors carry it
//! out. The kube-backed executors encode the failure semantics of the
//! reconciliation contract: `NotFound` on delete and `AlreadyExists` on
//! create are success. The recording executor captures the same operations
//! for scenario tests and dry runs.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, PostParams, Preconditions, PropagationPolicy};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::syncer::error::{is_already_exists, is_not_found, Result};

/// Options for a super-side delete. Deletes always carry the UID
/// precondition of the object the syncer observed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SuperDeleteOptions {
    pub uid: Option<String>,
    /// Namespace deletes propagate with the default policy.
    pub background: bool,
}

impl SuperDeleteOptions {
    fn to_params(&self) -> DeleteParams {
        DeleteParams {
            preconditions: self.uid.clone().map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            propagation_policy: self.background.then_some(PropagationPolicy::Background),
            ..Default::default()
        }
    }
}

/// Executes mutations of one kind on the super cluster.
#[async_trait]
pub trait SuperExecutor<K>: Send + Sync {
    async fn create(&self, namespace: &str, object: &K) -> Result<()>;
    async fn update(&self, namespace: &str, name: &str, object: &K) -> Result<()>;
    async fn delete(&self, namespace: &str, name: &str, options: SuperDeleteOptions) -> Result<()>;
}

/// Kube-backed executor for namespaced kinds.
pub struct KubeExecutor<K> {
    client: Client,
    kind: &'static str,
    _marker: std::marker::PhantomData<fn() -> K>,
}

impl<K> KubeExecutor<K> {
    pub fn new(client: Client, kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            client,
            kind,
            _marker: std::marker::PhantomData,
        })
    }
}

#[async_trait]
impl<K> SuperExecutor<K> for KubeExecutor<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn create(&self, namespace: &str, object: &K) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(()),
            Err(err) if is_already_exists(&err) => {
                debug!(kind = self.kind, namespace, "object already exists in super master");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, namespace: &str, name: &str, object: &K) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), object).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, options: SuperDeleteOptions) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &options.to_params()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                debug!(kind = self.kind, namespace, name, "object already gone from super master");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Kube-backed executor for cluster-scoped kinds; the namespace argument is
/// ignored.
pub struct KubeClusterExecutor<K> {
    client: Client,
    kind: &'static str,
    _marker: std::marker::PhantomData<fn() -> K>,
}

impl<K> KubeClusterExecutor<K> {
    pub fn new(client: Client, kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            client,
            kind,
            _marker: std::marker::PhantomData,
        })
    }
}

#[async_trait]
impl<K> SuperExecutor<K> for KubeClusterExecutor<K>
where
    K: Resource<Scope = k8s_openapi::ClusterResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn create(&self, _namespace: &str, object: &K) -> Result<()> {
        let api: Api<K> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(()),
            Err(err) if is_already_exists(&err) => {
                debug!(kind = self.kind, "object already exists in super master");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, _namespace: &str, name: &str, object: &K) -> Result<()> {
        let api: Api<K> = Api::all(self.client.clone());
        api.replace(name, &PostParams::default(), object).await?;
        Ok(())
    }

    async fn delete(&self, _namespace: &str, name: &str, options: SuperDeleteOptions) -> Result<()> {
        let api: Api<K> = Api::all(self.client.clone());
        match api.delete(name, &options.to_params()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                debug!(kind = self.kind, name, "object already gone from super master");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// One recorded super-cluster mutation.
#[derive(Clone, Debug)]
pub enum SuperAction<K> {
    Create {
        namespace: String,
        object: K,
    },
    Update {
        namespace: String,
        name: String,
        object: K,
    },
    Delete {
        namespace: String,
        name: String,
        options: SuperDeleteOptions,
    },
}

/// Records mutations instead of performing them. Scenario tests assert on
/// the captured action list.
pub struct RecordingExecutor<K> {
    actions: Mutex<Vec<SuperAction<K>>>,
}

impl<K> Default for RecordingExecutor<K> {
    fn default() -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
        }
    }
}

impl<K: Clone> RecordingExecutor<K> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn actions(&self) -> Vec<SuperAction<K>> {
        self.actions.lock().expect("recorder lock poisoned").clone()
    }
}

#[async_trait]
impl<K> SuperExecutor<K> for RecordingExecutor<K>
where
    K: Clone + Send + Sync + 'static,
{
    async fn create(&self, namespace: &str, object: &K) -> Result<()> {
        self.actions
            .lock()
            .expect("recorder lock poisoned")
            .push(SuperAction::Create {
                namespace: namespace.to_string(),
                object: object.clone(),
            });
        Ok(())
    }

    async fn update(&self, namespace: &str, name: &str, object: &K) -> Result<()> {
        self.actions
            .lock()
            .expect("recorder lock poisoned")
            .push(SuperAction::Update {
                namespace: namespace.to_string(),
                name: name.to_string(),
                object: object.clone(),
            });
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, options: SuperDeleteOptions) -> Result<()> {
        self.actions
            .lock()
            .expect("recorder lock poisoned")
            .push(SuperAction::Delete {
                namespace: namespace.to_string(),
                name: name.to_string(),
                options,
            });
        Ok(())
    }
}
