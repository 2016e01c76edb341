//! An in-memory cluster running both pipelines against fake stores.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use endpoint_controller::domain::change::Change;
use endpoint_controller::domain::change::ChangeEvent;
use endpoint_controller::domain::change::Watched;
use endpoint_controller::domain::controller::Controller;
use endpoint_controller::domain::controller::RetryPolicy;
use endpoint_controller::domain::endpoints::EndpointsReconciler;
use endpoint_controller::domain::endpoints::EndpointsSettings;
use endpoint_controller::domain::endpointslice::EndpointSliceReconciler;
use endpoint_controller::domain::endpointslice::EndpointSliceSettings;
use endpoint_controller::domain::keys::ServiceKey;
use endpoint_controller::domain::queue::ItemExponentialBackoff;
use endpoint_controller::domain::queue::WorkQueue;
use endpoint_controller::domain::service::LABEL_SERVICE_NAME;
use endpoint_controller::domain::tracker::EndpointSliceTracker;
use endpoint_controller::domain::tracker::StaleEndpointsTracker;
use endpoint_controller::domain::translator::Dispatcher;
use endpoint_controller::domain::translator::KeyTranslator;
use endpoint_controller::domain::write::WriteCoordinator;
use endpoint_controller::infrastructure::cache::new_caches;
use endpoint_controller::infrastructure::cache::CacheWriter;
use endpoint_controller::infrastructure::cache::CacheWriters;
use endpoint_controller::infrastructure::cache::Caches;
use endpoint_controller::infrastructure::metrics::ControllerMetrics;
use endpoint_controller::mock::FakeApi;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use tokio::sync::mpsc;

pub const NAMESPACE: &str = "default";

pub struct Cluster {
    pub services: CacheWriter<Service>,
    pub pods: CacheWriter<Pod>,
    pub nodes: CacheWriter<Node>,
    pub caches: Caches,
    pub endpoints_api: Arc<FakeApi<Endpoints>>,
    pub slices_api: Arc<FakeApi<EndpointSlice>>,
    pub endpoints: Controller<EndpointsReconciler>,
    pub slices: Controller<EndpointSliceReconciler>,
    dispatcher: Dispatcher,
    changes: mpsc::Receiver<Change>,
}

fn queue(name: &'static str) -> Arc<WorkQueue<ServiceKey>> {
    WorkQueue::new(
        name,
        ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1)),
    )
}

impl Cluster {
    pub fn new(max_endpoints_per_slice: usize) -> Self {
        let (writers, caches) = new_caches();
        let CacheWriters {
            services,
            pods,
            nodes,
            endpoints,
            slices,
        } = writers;
        let (changes_tx, changes) = mpsc::channel(4096);

        let endpoints_api = Arc::new(FakeApi::feeding(endpoints).with_changes(changes_tx.clone()));
        let slices_api = Arc::new(FakeApi::feeding(slices).with_changes(changes_tx));

        let endpoints_tracker = Arc::new(StaleEndpointsTracker::new());
        let endpoints_metrics = Arc::new(ControllerMetrics::new("endpoints"));
        let endpoints_queue = queue("endpoints");
        let endpoints_controller = Controller::new(
            Arc::new(EndpointsReconciler::new(
                caches.clone(),
                WriteCoordinator::new(
                    Arc::clone(&endpoints_api) as _,
                    Arc::clone(&endpoints_tracker) as _,
                    Duration::from_secs(1),
                ),
                endpoints_tracker,
                Arc::clone(&endpoints_metrics),
                EndpointsSettings {
                    max_endpoints_capacity: 1000,
                },
            )),
            Arc::clone(&endpoints_queue),
            RetryPolicy::default(),
            endpoints_metrics,
        );

        let slice_tracker = Arc::new(EndpointSliceTracker::new());
        let slices_metrics = Arc::new(ControllerMetrics::new("endpointslice"));
        let slices_queue = queue("endpointslice");
        let slices_controller = Controller::new(
            Arc::new(EndpointSliceReconciler::new(
                caches.clone(),
                WriteCoordinator::new(
                    Arc::clone(&slices_api) as _,
                    Arc::clone(&slice_tracker) as _,
                    Duration::from_secs(1),
                ),
                Arc::clone(&slice_tracker),
                Arc::clone(&slices_metrics),
                EndpointSliceSettings {
                    max_endpoints_per_slice,
                    topology_aware_routing: true,
                },
            )),
            Arc::clone(&slices_queue),
            RetryPolicy::default(),
            slices_metrics,
        );

        let translator = KeyTranslator::new(caches.services.clone(), Arc::clone(&slice_tracker), true);
        let dispatcher = Dispatcher::new(
            translator,
            slice_tracker,
            endpoints_queue,
            slices_queue,
            Duration::ZERO,
        );

        Self {
            services,
            pods,
            nodes,
            caches,
            endpoints_api,
            slices_api,
            endpoints: endpoints_controller,
            slices: slices_controller,
            dispatcher,
            changes,
        }
    }

    fn observe<K: Watched>(&self, event: Option<ChangeEvent<K>>) {
        if let Some(event) = event {
            self.dispatcher.dispatch(&K::into_change(event));
        }
    }

    pub fn apply_service(&self, service: Service) {
        self.observe(self.services.apply(service));
    }

    pub fn delete_service(&self, service: Service) {
        self.observe(Some(self.services.delete(service)));
    }

    pub fn apply_pod(&self, pod: Pod) {
        self.observe(self.pods.apply(pod));
    }

    pub fn delete_pod(&self, pod: Pod) {
        self.observe(Some(self.pods.delete(pod)));
    }

    pub fn apply_node(&self, node: Node) {
        self.observe(self.nodes.apply(node));
    }

    /// Dispatches the changes produced by accepted writes. Returns whether
    /// there were any.
    pub fn pump(&mut self) -> bool {
        let mut delivered = false;
        while let Ok(change) = self.changes.try_recv() {
            self.dispatcher.dispatch(&change);
            delivered = true;
        }
        delivered
    }

    /// Delivers pending changes and processes queued keys until nothing is
    /// left to do.
    pub async fn settle(&mut self) {
        for _ in 0..1000 {
            let mut progressed = self.pump();
            while !self.endpoints.queue().is_empty() {
                self.endpoints.process_next().await;
                progressed = true;
            }
            while !self.slices.queue().is_empty() {
                self.slices.process_next().await;
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
        panic!("cluster did not settle");
    }

    /// Enqueues a Service into both pipelines, as a resync would.
    pub fn resync(&self, name: &str) {
        let key = ServiceKey::new(NAMESPACE, name);
        self.endpoints.queue().add(key.clone());
        self.slices.queue().add(key);
    }

    pub fn writes(&self) -> usize {
        self.endpoints_api.calls() + self.slices_api.calls()
    }

    pub fn endpoints_of(&self, name: &str) -> Option<Arc<Endpoints>> {
        self.caches.endpoints.get(NAMESPACE, name)
    }

    pub fn slices_of(&self, name: &str) -> Vec<Arc<EndpointSlice>> {
        self.caches
            .slices
            .list(NAMESPACE)
            .into_iter()
            .filter(|slice| {
                slice
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(LABEL_SERVICE_NAME))
                    .is_some_and(|service| service == name)
            })
            .collect()
    }

    /// (address, ready) of every slice endpoint of a Service.
    pub fn slice_members(&self, name: &str) -> BTreeSet<(String, bool)> {
        self.slices_of(name)
            .iter()
            .flat_map(|slice| slice.endpoints.clone())
            .flat_map(|endpoint| {
                let ready = endpoint
                    .conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(false);
                endpoint
                    .addresses
                    .into_iter()
                    .map(move |address| (address, ready))
            })
            .collect()
    }

    /// (address, ready) of every Endpoints address of a Service.
    pub fn endpoints_members(&self, name: &str) -> BTreeSet<(String, bool)> {
        let Some(endpoints) = self.endpoints_of(name) else {
            return BTreeSet::new();
        };
        endpoints
            .subsets
            .iter()
            .flatten()
            .flat_map(|subset| {
                let ready = subset
                    .addresses
                    .iter()
                    .flatten()
                    .map(|a| (a.ip.clone(), true));
                let not_ready = subset
                    .not_ready_addresses
                    .iter()
                    .flatten()
                    .map(|a| (a.ip.clone(), false));
                ready.chain(not_ready).collect::<Vec<_>>()
            })
            .collect()
    }
}
