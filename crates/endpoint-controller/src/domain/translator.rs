//! Maps watch changes to the Service keys whose membership may have changed,
//! and feeds them into the work queues of both pipelines.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::domain::change::Change;
use crate::domain::change::ChangeEvent;
use crate::domain::endpointslice::builder::node_zone;
use crate::domain::endpointslice::topology::node_cpu;
use crate::domain::keys::ServiceKey;
use crate::domain::pod::PodEndpointView;
use crate::domain::queue::WorkQueue;
use crate::domain::selector::Selector;
use crate::domain::service;
use crate::domain::service::CONTROLLER_NAME;
use crate::domain::service::LABEL_MANAGED_BY;
use crate::domain::tracker::slice_service_key;
use crate::domain::tracker::EndpointSliceTracker;
use crate::infrastructure::cache::ObjectCache;

/// Which pipelines a change concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipelines {
    Both,
    Endpoints,
    Slices,
}

impl Pipelines {
    fn endpoints(self) -> bool {
        matches!(self, Pipelines::Both | Pipelines::Endpoints)
    }

    fn slices(self) -> bool {
        matches!(self, Pipelines::Both | Pipelines::Slices)
    }
}

/// Keys to enqueue for one change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    pub keys: BTreeSet<ServiceKey>,
    pub pipelines: Pipelines,
    /// Delay by the batch period to coalesce bursts of pod updates.
    pub batched: bool,
}

impl Targets {
    fn new(keys: BTreeSet<ServiceKey>, pipelines: Pipelines) -> Self {
        Self {
            keys,
            pipelines,
            batched: false,
        }
    }

    fn none(pipelines: Pipelines) -> Self {
        Self::new(BTreeSet::new(), pipelines)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Pure mapping from observed changes to Service keys. Reads the caches and
/// the slice tracker but never changes them.
pub struct KeyTranslator {
    services: ObjectCache<Service>,
    slice_tracker: Arc<EndpointSliceTracker>,
    topology_aware_routing: bool,
}

impl KeyTranslator {
    pub fn new(
        services: ObjectCache<Service>,
        slice_tracker: Arc<EndpointSliceTracker>,
        topology_aware_routing: bool,
    ) -> Self {
        Self {
            services,
            slice_tracker,
            topology_aware_routing,
        }
    }

    pub fn translate(&self, change: &Change) -> Targets {
        match change {
            Change::Service(event) => {
                let key = ServiceKey::from_object(event.latest().as_ref());
                Targets::new(BTreeSet::from([key]), Pipelines::Both)
            }
            Change::Pod(event) => Targets {
                batched: true,
                ..Targets::new(self.pod_keys(event), Pipelines::Both)
            },
            Change::Node(event) => Targets::new(self.node_keys(event), Pipelines::Slices),
            Change::Endpoints(event) => {
                Targets::new(self.endpoints_keys(event), Pipelines::Endpoints)
            }
            Change::EndpointSlice(event) => {
                Targets::new(self.slice_keys(event), Pipelines::Slices)
            }
        }
    }

    /// Services in the pod's namespace whose selector matches its labels.
    /// Services without a selector, or with an invalid one, match nothing.
    fn services_selecting(&self, pod: &Pod) -> BTreeSet<ServiceKey> {
        let namespace = pod.namespace().unwrap_or_default();
        self.services
            .list(&namespace)
            .iter()
            .filter(|svc| {
                service::selector(svc)
                    .and_then(|raw| Selector::from_map(raw).ok())
                    .is_some_and(|selector| selector.matches(pod.labels()))
            })
            .map(|svc| ServiceKey::from_object(svc.as_ref()))
            .collect()
    }

    fn pod_keys(&self, event: &ChangeEvent<Pod>) -> BTreeSet<ServiceKey> {
        match event {
            ChangeEvent::Added(pod) | ChangeEvent::Deleted(pod) => self.services_selecting(pod),
            ChangeEvent::Updated { old, new } => {
                if old.labels() != new.labels() {
                    let mut keys = self.services_selecting(old);
                    keys.extend(self.services_selecting(new));
                    keys
                } else if PodEndpointView::of(old) != PodEndpointView::of(new) {
                    self.services_selecting(new)
                } else {
                    BTreeSet::new()
                }
            }
        }
    }

    fn topology_aware_services(&self) -> BTreeSet<ServiceKey> {
        if !self.topology_aware_routing {
            return BTreeSet::new();
        }
        self.services
            .list_all()
            .iter()
            .filter(|svc| service::wants_topology_hints(svc))
            .map(|svc| ServiceKey::from_object(svc.as_ref()))
            .collect()
    }

    fn node_keys(&self, event: &ChangeEvent<Node>) -> BTreeSet<ServiceKey> {
        let relevant = match event {
            ChangeEvent::Added(_) | ChangeEvent::Deleted(_) => true,
            ChangeEvent::Updated { old, new } => {
                node_zone(old) != node_zone(new)
                    || node_ready(old) != node_ready(new)
                    || node_cpu(old) != node_cpu(new)
            }
        };
        if relevant {
            self.topology_aware_services()
        } else {
            BTreeSet::new()
        }
    }

    /// The owning Service, only if it is still known.
    fn known_service(&self, key: ServiceKey) -> BTreeSet<ServiceKey> {
        if self.services.get(&key.namespace, &key.name).is_some() {
            BTreeSet::from([key])
        } else {
            BTreeSet::new()
        }
    }

    fn endpoints_keys(&self, event: &ChangeEvent<Endpoints>) -> BTreeSet<ServiceKey> {
        self.known_service(ServiceKey::from_object(event.latest().as_ref()))
    }

    fn slice_keys(&self, event: &ChangeEvent<EndpointSlice>) -> BTreeSet<ServiceKey> {
        let owner = |slice: &EndpointSlice| {
            slice_service_key(slice)
                .map(|key| self.known_service(key))
                .unwrap_or_default()
        };
        match event {
            ChangeEvent::Added(slice) => {
                if is_managed_here(slice) && self.slice_tracker.should_sync(slice) {
                    owner(slice)
                } else {
                    BTreeSet::new()
                }
            }
            ChangeEvent::Updated { old, new } => {
                if is_managed_here(old) && !is_managed_here(new) {
                    owner(old)
                } else if is_managed_here(new) && self.slice_tracker.should_sync(new) {
                    owner(new)
                } else {
                    BTreeSet::new()
                }
            }
            ChangeEvent::Deleted(slice) => {
                if self.slice_tracker.has(slice) && !self.slice_tracker.deletion_expected(slice) {
                    owner(slice)
                } else {
                    BTreeSet::new()
                }
            }
        }
    }
}

fn is_managed_here(slice: &EndpointSlice) -> bool {
    slice.labels().get(LABEL_MANAGED_BY).map(String::as_str) == Some(CONTROLLER_NAME)
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Routes translated keys into the queues of both pipelines.
pub struct Dispatcher {
    translator: KeyTranslator,
    slice_tracker: Arc<EndpointSliceTracker>,
    endpoints_queue: Arc<WorkQueue<ServiceKey>>,
    slices_queue: Arc<WorkQueue<ServiceKey>>,
    batch_period: Duration,
}

impl Dispatcher {
    pub fn new(
        translator: KeyTranslator,
        slice_tracker: Arc<EndpointSliceTracker>,
        endpoints_queue: Arc<WorkQueue<ServiceKey>>,
        slices_queue: Arc<WorkQueue<ServiceKey>>,
        batch_period: Duration,
    ) -> Self {
        Self {
            translator,
            slice_tracker,
            endpoints_queue,
            slices_queue,
            batch_period,
        }
    }

    /// Consumes changes until the channel closes or the token is cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, mut changes: mpsc::Receiver<Change>, cancellation_token: CancellationToken) {
        info!("Starting change dispatcher");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                change = changes.recv() => match change {
                    Some(change) => self.dispatch(&change),
                    None => break,
                },
            }
        }
        info!("Change dispatcher stopped");
    }

    pub fn dispatch(&self, change: &Change) {
        let targets = self.translator.translate(change);
        if let Change::EndpointSlice(ChangeEvent::Deleted(slice)) = change {
            self.slice_tracker.handle_deletion(slice);
        }
        if targets.is_empty() {
            return;
        }
        debug!(keys = targets.keys.len(), pipelines = ?targets.pipelines, "Enqueueing services");
        for key in targets.keys {
            if targets.pipelines.endpoints() {
                self.enqueue(&self.endpoints_queue, key.clone(), targets.batched);
            }
            if targets.pipelines.slices() {
                self.enqueue(&self.slices_queue, key, targets.batched);
            }
        }
    }

    fn enqueue(&self, queue: &WorkQueue<ServiceKey>, key: ServiceKey, batched: bool) {
        if batched && !self.batch_period.is_zero() {
            queue.add_after(key, self.batch_period);
        } else {
            queue.add(key);
        }
    }
}
