//! Multi-cluster controller
//!
//! One logical controller watches N tenant clusters' caches for a single
//! resource kind and funnels every observed change into one keyed work
//! queue. Work items are `(cluster, namespace, name)` keys; workers run the
//! kind's downward reconciler.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cluster::{Store, TenantCluster};
use crate::conversion::OwnerInfo;
use crate::syncer::error::{BackoffConfig, Result, SyncerError};
use crate::syncer::queue::{WorkItem, WorkQueue};
use crate::syncer::reconcile::{DwReconciler, Request};

#[derive(Clone, Debug)]
pub struct McOptions {
    pub workers: usize,
    pub backoff: BackoffConfig,
}

impl Default for McOptions {
    fn default() -> Self {
        Self {
            workers: crate::config::VIRTUAL_CLUSTER_WORKER,
            backoff: BackoffConfig::default(),
        }
    }
}

struct JoinedCluster<K> {
    cluster: Arc<TenantCluster>,
    store: Store<K>,
    watch_cancel: CancellationToken,
}

pub struct MultiClusterController<K> {
    kind: &'static str,
    clusters: RwLock<HashMap<String, JoinedCluster<K>>>,
    queue: Arc<WorkQueue<Request>>,
    workers: usize,
}

impl<K> MultiClusterController<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    pub fn new(kind: &'static str, options: McOptions) -> Arc<Self> {
        Arc::new(Self {
            kind,
            clusters: RwLock::new(HashMap::new()),
            queue: WorkQueue::new(options.backoff),
            workers: options.workers,
        })
    }

    /// Subscribe to a tenant cluster's informer for this kind. Idempotent.
    /// Detached clusters (no client) get a cache that is fed externally.
    pub fn watch(&self, cluster: Arc<TenantCluster>) {
        let key = cluster.cluster_key().to_string();
        let mut clusters = self.clusters.write().expect("mc clusters lock poisoned");
        if clusters.contains_key(&key) {
            return;
        }
        let store = cluster.store::<K>();
        let watch_cancel = CancellationToken::new();
        if let Some(client) = cluster.client() {
            let api: Api<K> = Api::all(client);
            tokio::spawn(run_watcher(
                self.kind,
                api,
                store.clone(),
                key.clone(),
                Arc::clone(&self.queue),
                watch_cancel.clone(),
            ));
        }
        debug!(kind = self.kind, cluster = %key, "watching tenant cluster");
        clusters.insert(
            key,
            JoinedCluster {
                cluster,
                store,
                watch_cancel,
            },
        );
    }

    /// Stop watching a tenant cluster and drop its pending work items.
    pub fn unwatch(&self, cluster_key: &str) {
        let removed = self
            .clusters
            .write()
            .expect("mc clusters lock poisoned")
            .remove(cluster_key);
        if let Some(joined) = removed {
            joined.watch_cancel.cancel();
            joined.store.clear();
            self.queue
                .retain(|request| request.cluster_name != cluster_key);
            debug!(kind = self.kind, cluster = %cluster_key, "unwatched tenant cluster");
        }
    }

    fn enqueue_object(&self, cluster_key: &str, object: &K) {
        enqueue_into(&self.queue, cluster_key, object);
    }

    /// Explicit enqueue, used by tests and the patroller.
    pub fn enqueue(&self, request: Request) {
        self.queue.add(request);
    }

    /// Re-enqueue a tenant object observed out of sync.
    pub fn requeue_object(&self, cluster_key: &str, object: &K) -> Result<()> {
        if !self
            .clusters
            .read()
            .expect("mc clusters lock poisoned")
            .contains_key(cluster_key)
        {
            return Err(SyncerError::ClusterNotJoined(cluster_key.to_string()));
        }
        self.enqueue_object(cluster_key, object);
        Ok(())
    }

    /// Read-through to the cluster's cache.
    pub fn get(&self, cluster_key: &str, namespace: &str, name: &str) -> Result<Option<Arc<K>>> {
        let clusters = self.clusters.read().expect("mc clusters lock poisoned");
        let joined = clusters
            .get(cluster_key)
            .ok_or_else(|| SyncerError::ClusterNotJoined(cluster_key.to_string()))?;
        Ok(joined.store.get(namespace, name))
    }

    pub fn list(&self, cluster_key: &str) -> Result<Vec<Arc<K>>> {
        let clusters = self.clusters.read().expect("mc clusters lock poisoned");
        let joined = clusters
            .get(cluster_key)
            .ok_or_else(|| SyncerError::ClusterNotJoined(cluster_key.to_string()))?;
        Ok(joined.store.list())
    }

    /// Snapshot of currently-joined cluster keys.
    pub fn get_cluster_names(&self) -> Vec<String> {
        self.clusters
            .read()
            .expect("mc clusters lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn get_cluster(&self, cluster_key: &str) -> Option<Arc<TenantCluster>> {
        self.clusters
            .read()
            .expect("mc clusters lock poisoned")
            .get(cluster_key)
            .map(|joined| Arc::clone(&joined.cluster))
    }

    /// Tenant CR coordinates for a joined cluster.
    pub fn get_owner_info(&self, cluster_key: &str) -> Result<OwnerInfo> {
        self.clusters
            .read()
            .expect("mc clusters lock poisoned")
            .get(cluster_key)
            .map(|joined| joined.cluster.owner_info())
            .ok_or_else(|| SyncerError::ClusterNotJoined(cluster_key.to_string()))
    }

    /// Run the worker pool until `stop` fires. Items for clusters that were
    /// unjoined mid-flight are dropped after one pass.
    pub async fn start(
        &self,
        reconciler: Arc<dyn DwReconciler>,
        stop: CancellationToken,
    ) -> Result<()> {
        {
            let queue = Arc::clone(&self.queue);
            let stop = stop.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                queue.shutdown();
            });
        }

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&reconciler);
            let kind = self.kind;
            workers.spawn(async move {
                while let Some(request) = queue.next().await {
                    let key = request.work_key();
                    match reconciler.reconcile(request.clone()).await {
                        Ok(result) => {
                            if let Some(delay) = result.requeue_after {
                                queue.forget(&key);
                                Arc::clone(&queue).add_after(request, delay);
                            } else if result.requeue {
                                Arc::clone(&queue).add_rate_limited(request);
                            } else {
                                queue.forget(&key);
                            }
                        }
                        Err(SyncerError::ClusterNotJoined(cluster)) => {
                            debug!(kind, cluster = %cluster, "dropping item for unjoined cluster");
                            queue.forget(&key);
                        }
                        Err(err) if err.is_retryable() => {
                            warn!(kind, error = %err, "reconcile failed, backing off");
                            Arc::clone(&queue).add_rate_limited(request);
                        }
                        Err(err) => {
                            error!(kind, name = %request.name, error = %err, "dropping item after non-retryable error");
                            queue.forget(&key);
                        }
                    }
                    queue.done(&key);
                }
            });
        }
        while workers.join_next().await.is_some() {}
        Ok(())
    }
}

/// Watch one tenant cluster's objects of kind `K`, feeding the shared cache
/// and the controller's work queue.
async fn run_watcher<K>(
    kind: &'static str,
    api: Api<K>,
    store: Store<K>,
    cluster_key: String,
    queue: Arc<WorkQueue<Request>>,
    cancel: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
    let mut relist: Vec<K> = Vec::new();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Apply(object))) => {
                enqueue_into(&queue, &cluster_key, &object);
                store.apply(object);
            }
            Some(Ok(watcher::Event::Delete(object))) => {
                store.delete(&object);
                enqueue_into(&queue, &cluster_key, &object);
            }
            Some(Ok(watcher::Event::Init)) => relist = Vec::new(),
            Some(Ok(watcher::Event::InitApply(object))) => relist.push(object),
            Some(Ok(watcher::Event::InitDone)) => {
                for object in &relist {
                    enqueue_into(&queue, &cluster_key, object);
                }
                store.replace_all(std::mem::take(&mut relist));
            }
            Some(Err(err)) => {
                // The watcher re-establishes itself; log and keep going.
                warn!(kind, cluster = %cluster_key, error = %err, "tenant watch error");
            }
            None => return,
        }
    }
}

fn enqueue_into<K>(queue: &Arc<WorkQueue<Request>>, cluster_key: &str, object: &K)
where
    K: Resource<DynamicType = ()>,
{
    let meta = object.meta();
    queue.add(Request {
        cluster_name: cluster_key.to_string(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
    });
}
