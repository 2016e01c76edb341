//! In-memory object caches fed by the watch streams.
//!
//! Each kind gets one [`CacheWriter`] owned by its informer and any number of
//! [`ObjectCache`] readers. Reconcilers only ever hold readers, so the watch
//! ingestion path is the single writer of every cache.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use tokio::sync::watch;

use crate::domain::change::ChangeEvent;
use crate::domain::selector::Selector;

/// Event delivered by a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
    /// A full relist; replaces the cached contents.
    Restarted(Vec<K>),
}

struct Shared<K> {
    /// namespace -> name -> object; cluster scoped kinds live under "".
    objects: DashMap<String, BTreeMap<String, Arc<K>>>,
    synced: watch::Sender<bool>,
}

/// Read handle on a cache.
pub struct ObjectCache<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Write handle on a cache. Not cloneable.
pub struct CacheWriter<K> {
    shared: Arc<Shared<K>>,
}

/// Creates an empty cache and returns its writer and a reader.
pub fn new_cache<K>() -> (CacheWriter<K>, ObjectCache<K>) {
    let (synced, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        objects: DashMap::new(),
        synced,
    });
    (
        CacheWriter {
            shared: Arc::clone(&shared),
        },
        ObjectCache { shared },
    )
}

fn object_key<K: kube::Resource>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

impl<K> ObjectCache<K>
where
    K: kube::Resource,
{
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.shared
            .objects
            .get(namespace)
            .and_then(|partition| partition.get(name).cloned())
    }

    /// Objects of one namespace, ordered by name.
    pub fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.shared
            .objects
            .get(namespace)
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_all(&self) -> Vec<Arc<K>> {
        let mut namespaces: Vec<String> = self
            .shared
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        namespaces.sort();
        namespaces
            .iter()
            .flat_map(|namespace| self.list(namespace))
            .collect()
    }

    pub fn list_by_selector(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>> {
        self.shared
            .objects
            .get(namespace)
            .map(|partition| {
                partition
                    .values()
                    .filter(|obj| selector.matches(obj.labels()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.shared
            .objects
            .iter()
            .map(|partition| partition.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_synced(&self) -> bool {
        *self.shared.synced.borrow()
    }

    /// Resolves once the informer has delivered its first full list.
    pub async fn wait_synced(&self) {
        let mut rx = self.shared.synced.subscribe();
        // The sender lives as long as this reader, so this cannot fail.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

impl<K> CacheWriter<K>
where
    K: kube::Resource + Clone,
{
    pub fn reader(&self) -> ObjectCache<K> {
        ObjectCache {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn mark_synced(&self) {
        self.shared.synced.send_replace(true);
    }

    /// Stores an object. Returns `None` when the cached copy already has the
    /// same resource version.
    pub fn apply(&self, obj: K) -> Option<ChangeEvent<K>> {
        let (namespace, name) = object_key(&obj);
        let new = Arc::new(obj);
        let old = {
            let mut partition = self.shared.objects.entry(namespace).or_default();
            if let Some(existing) = partition.get(&name) {
                let unchanged = existing.resource_version().is_some()
                    && existing.resource_version() == new.resource_version();
                if unchanged {
                    return None;
                }
            }
            partition.insert(name, Arc::clone(&new))
        };
        Some(match old {
            Some(old) => ChangeEvent::Updated { old, new },
            None => ChangeEvent::Added(new),
        })
    }

    /// Removes an object. The event carries the final state reported by the
    /// watch, even if the object was never cached.
    pub fn delete(&self, obj: K) -> ChangeEvent<K> {
        let (namespace, name) = object_key(&obj);
        let emptied = match self.shared.objects.get_mut(&namespace) {
            Some(mut partition) => {
                partition.remove(&name);
                partition.is_empty()
            }
            None => false,
        };
        if emptied {
            self.shared
                .objects
                .remove_if(&namespace, |_, partition| partition.is_empty());
        }
        ChangeEvent::Deleted(Arc::new(obj))
    }

    /// Replaces the whole content, emitting the changes a relist implies.
    pub fn replace(&self, objects: Vec<K>) -> Vec<ChangeEvent<K>> {
        let seen: BTreeSet<(String, String)> = objects.iter().map(object_key).collect();
        let mut events: Vec<ChangeEvent<K>> =
            objects.into_iter().filter_map(|obj| self.apply(obj)).collect();

        let stale: Vec<Arc<K>> = self
            .reader()
            .list_all()
            .into_iter()
            .filter(|obj| !seen.contains(&object_key(obj.as_ref())))
            .collect();
        for obj in stale {
            events.push(self.delete(obj.as_ref().clone()));
        }
        events
    }

    pub fn ingest(&self, event: WatchEvent<K>) -> Vec<ChangeEvent<K>> {
        match event {
            WatchEvent::Applied(obj) => self.apply(obj).into_iter().collect(),
            WatchEvent::Deleted(obj) => vec![self.delete(obj)],
            WatchEvent::Restarted(objects) => self.replace(objects),
        }
    }
}

/// Read handles on every cache the controllers use.
#[derive(Clone)]
pub struct Caches {
    pub services: ObjectCache<Service>,
    pub pods: ObjectCache<Pod>,
    pub nodes: ObjectCache<Node>,
    pub endpoints: ObjectCache<Endpoints>,
    pub slices: ObjectCache<EndpointSlice>,
}

/// Write handles matching [`Caches`], one per informer.
pub struct CacheWriters {
    pub services: CacheWriter<Service>,
    pub pods: CacheWriter<Pod>,
    pub nodes: CacheWriter<Node>,
    pub endpoints: CacheWriter<Endpoints>,
    pub slices: CacheWriter<EndpointSlice>,
}

/// Creates one empty cache per watched kind.
pub fn new_caches() -> (CacheWriters, Caches) {
    let (services_writer, services) = new_cache();
    let (pods_writer, pods) = new_cache();
    let (nodes_writer, nodes) = new_cache();
    let (endpoints_writer, endpoints) = new_cache();
    let (slices_writer, slices) = new_cache();
    (
        CacheWriters {
            services: services_writer,
            pods: pods_writer,
            nodes: nodes_writer,
            endpoints: endpoints_writer,
            slices: slices_writer,
        },
        Caches {
            services,
            pods,
            nodes,
            endpoints,
            slices,
        },
    )
}

impl Caches {
    /// Resolves once every cache has seen its initial list.
    pub async fn wait_synced(&self) {
        tokio::join!(
            self.services.wait_synced(),
            self.pods.wait_synced(),
            self.nodes.wait_synced(),
            self.endpoints.wait_synced(),
            self.slices.wait_synced(),
        );
    }
}
