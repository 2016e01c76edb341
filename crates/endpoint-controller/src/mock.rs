//! Test adapters: object fixtures and an in-memory cluster store.
//!
//! [`FakeApi`] stands in for the API server behind [`ObjectApi`]. When built
//! with [`FakeApi::feeding`] every accepted write is also applied to a cache,
//! the way a watch stream would deliver it.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio::sync::mpsc;

use crate::domain::change::Change;
use crate::domain::change::Watched;
use crate::domain::write::ApiError;
use crate::domain::write::ObjectApi;
use crate::infrastructure::cache::CacheWriter;

/// Scripted misbehaviour of the next call.
#[derive(Debug, Clone)]
pub enum Failure {
    Api(ApiError),
    /// Sleeps before answering normally.
    Hang(Duration),
}

struct Store<K> {
    objects: BTreeMap<(String, String), K>,
    next_version: u64,
    next_suffix: u64,
    calls: usize,
    failures: VecDeque<Failure>,
}

pub struct FakeApi<K> {
    store: Mutex<Store<K>>,
    cache: Option<CacheWriter<K>>,
    changes: Option<mpsc::Sender<Change>>,
}

impl<K: Watched> FakeApi<K> {
    /// A store whose writes are not visible to any cache.
    pub fn detached() -> Self {
        Self {
            store: Mutex::new(Store {
                objects: BTreeMap::new(),
                next_version: 1000,
                next_suffix: 0,
                calls: 0,
                failures: VecDeque::new(),
            }),
            cache: None,
            changes: None,
        }
    }

    /// A store that applies every accepted write to `cache`.
    pub fn feeding(cache: CacheWriter<K>) -> Self {
        Self {
            cache: Some(cache),
            ..Self::detached()
        }
    }

    /// Also publishes the cache changes of accepted writes.
    pub fn with_changes(mut self, changes: mpsc::Sender<Change>) -> Self {
        self.changes = Some(changes);
        self
    }

    /// Cache fed by this store, for tests that need to make it lag.
    pub fn cache(&self) -> Option<&CacheWriter<K>> {
        self.cache.as_ref()
    }

    /// Number of calls received, failed ones included.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    pub fn fail_next(&self, failure: Failure) {
        self.lock().failures.push_back(failure);
    }

    /// Current stored copy of an object.
    pub fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store<K>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn begin(&self) -> Result<(), ApiError> {
        let failure = {
            let mut store = self.lock();
            store.calls += 1;
            store.failures.pop_front()
        };
        match failure {
            Some(Failure::Api(err)) => Err(err),
            Some(Failure::Hang(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn publish_applied(&self, obj: &K) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Some(event) = cache.apply(obj.clone()) {
            if let Some(changes) = self.changes.as_ref() {
                let _ = changes.send(K::into_change(event)).await;
            }
        }
    }

    async fn publish_deleted(&self, obj: &K) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let event = cache.delete(obj.clone());
        if let Some(changes) = self.changes.as_ref() {
            let _ = changes.send(K::into_change(event)).await;
        }
    }
}

fn object_key<K: kube::Resource>(obj: &K) -> (String, String) {
    (
        obj.namespace().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl<K: Watched> ObjectApi<K> for FakeApi<K> {
    async fn create(&self, obj: &K) -> Result<K, ApiError> {
        self.begin().await?;
        let created = {
            let mut store = self.lock();
            let mut created = obj.clone();
            let meta = created.meta_mut();
            if meta.name.is_none() {
                let prefix = meta.generate_name.clone().unwrap_or_default();
                store.next_suffix += 1;
                meta.name = Some(format!("{prefix}{:05}", store.next_suffix));
            }
            let key = object_key(&created);
            if store.objects.contains_key(&key) {
                return Err(ApiError::AlreadyExists(format!("{}/{}", key.0, key.1)));
            }
            store.next_version += 1;
            let version = store.next_version;
            let meta = created.meta_mut();
            meta.uid = Some(format!("uid-{version}"));
            meta.generation = Some(1);
            meta.resource_version = Some(version.to_string());
            meta.creation_timestamp = Some(fixtures::timestamp(version as i64));
            store.objects.insert(key, created.clone());
            created
        };
        self.publish_applied(&created).await;
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, ApiError> {
        self.begin().await?;
        let updated = {
            let mut store = self.lock();
            let key = object_key(obj);
            let Some(current) = store.objects.get(&key) else {
                return Err(ApiError::NotFound(format!("{}/{}", key.0, key.1)));
            };
            if obj.resource_version().is_some()
                && obj.resource_version() != current.resource_version()
            {
                return Err(ApiError::Conflict(format!(
                    "{}/{}: resource version {:?} is not current",
                    key.0,
                    key.1,
                    obj.resource_version()
                )));
            }
            let generation = current.meta().generation.unwrap_or(0) + 1;
            let uid = current.meta().uid.clone();
            let created_at = current.meta().creation_timestamp.clone();
            store.next_version += 1;
            let mut updated = obj.clone();
            let meta = updated.meta_mut();
            meta.uid = uid;
            meta.creation_timestamp = created_at;
            meta.generation = Some(generation);
            meta.resource_version = Some(store.next_version.to_string());
            store.objects.insert(key, updated.clone());
            updated
        };
        self.publish_applied(&updated).await;
        Ok(updated)
    }

    async fn delete(&self, obj: &K) -> Result<(), ApiError> {
        self.begin().await?;
        let removed = {
            let key = object_key(obj);
            match self.lock().objects.remove(&key) {
                Some(removed) => removed,
                None => return Err(ApiError::NotFound(format!("{}/{}", key.0, key.1))),
            }
        };
        self.publish_deleted(&removed).await;
        Ok(())
    }
}

/// Builders for the objects tests feed into caches.
pub mod fixtures {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::api::core::v1::Endpoints;
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::api::core::v1::NodeCondition;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::api::core::v1::PodCondition;
    use k8s_openapi::api::core::v1::PodIP;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::api::core::v1::ServicePort;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use crate::domain::service::LABEL_TOPOLOGY_ZONE;

    /// A fixed instant `offset_secs` after an arbitrary epoch.
    pub fn timestamp(offset_secs: i64) -> Time {
        Time(
            chrono::DateTime::from_timestamp(1_700_000_000 + offset_secs, 0)
                .unwrap_or_default(),
        )
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            resource_version: Some("1".to_string()),
            ..Default::default()
        }
    }

    /// A running pod with one container and no node assignment.
    pub fn pod(
        namespace: &str,
        name: &str,
        pod_labels: &[(&str, &str)],
        ip: Option<&str>,
        ready: bool,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                labels: (!pod_labels.is_empty()).then(|| labels(pod_labels)),
                ..meta(namespace, name)
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: ip.map(str::to_string),
                pod_ips: ip.map(|ip| {
                    vec![PodIP {
                        ip: Some(ip.to_string()),
                    }]
                }),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    /// The same pod after its deletion started.
    pub fn terminating(pod: Pod) -> Pod {
        let mut pod = bumped(pod);
        pod.metadata.deletion_timestamp = Some(timestamp(3600));
        pod
    }

    /// The object with its resource version moved forward, as the store does
    /// on every change.
    pub fn bumped<K: kube::Resource>(mut obj: K) -> K {
        let meta = obj.meta_mut();
        let next = meta
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        meta.resource_version = Some(next.to_string());
        obj
    }

    /// A ClusterIP service. A single port is unnamed; several ports are named
    /// `port-<number>`.
    pub fn service(
        namespace: &str,
        name: &str,
        selector: &[(&str, &str)],
        ports: &[i32],
    ) -> Service {
        let named = ports.len() > 1;
        Service {
            metadata: meta(namespace, name),
            spec: Some(ServiceSpec {
                selector: Some(labels(selector)),
                cluster_ip: Some("10.96.0.10".to_string()),
                ports: (!ports.is_empty()).then(|| {
                    ports
                        .iter()
                        .map(|&port| ServicePort {
                            name: named.then(|| format!("port-{port}")),
                            port,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// A ready node in `zone` with `cpu` allocatable.
    pub fn node(name: &str, zone: &str, cpu: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("uid-node-{name}")),
                resource_version: Some("1".to_string()),
                labels: Some(labels(&[(LABEL_TOPOLOGY_ZONE, zone)])),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                allocatable: Some(BTreeMap::from([(
                    "cpu".to_string(),
                    Quantity(cpu.to_string()),
                )])),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    pub fn endpoints(namespace: &str, name: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            subsets: None,
        }
    }
}

