use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::NamespaceResourceScope;
use kube::Api;
use kube::Client;
use tokio::sync::mpsc;

use crate::app::services::ApplicationServices;
use crate::app::services::Informers;
use crate::app::Application;
use crate::config::ControllerConfig;
use crate::config::RunArgs;
use crate::domain::controller::Controller;
use crate::domain::controller::RetryPolicy;
use crate::domain::endpoints::EndpointsReconciler;
use crate::domain::endpoints::EndpointsSettings;
use crate::domain::endpointslice::EndpointSliceReconciler;
use crate::domain::endpointslice::EndpointSliceSettings;
use crate::domain::keys::ServiceKey;
use crate::domain::queue::ItemExponentialBackoff;
use crate::domain::queue::WorkQueue;
use crate::domain::service::CONTROLLER_NAME;
use crate::domain::service::LABEL_MANAGED_BY;
use crate::domain::tracker::EndpointSliceTracker;
use crate::domain::tracker::StaleEndpointsTracker;
use crate::domain::translator::Dispatcher;
use crate::domain::translator::KeyTranslator;
use crate::domain::write::WriteCoordinator;
use crate::infrastructure::cache::new_caches;
use crate::infrastructure::cache::CacheWriters;
use crate::infrastructure::informer::Informer;
use crate::infrastructure::kube_api::KubeObjectApi;
use crate::infrastructure::kube_client;
use crate::infrastructure::metrics::ControllerMetrics;

/// Capacity of the channel between the informers and the dispatcher.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Application builder
pub struct ApplicationBuilder {
    args: RunArgs,
}

impl ApplicationBuilder {
    pub fn new(args: RunArgs) -> Self {
        Self { args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let config = self
            .args
            .resolve()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {e:?}"))?;
        tracing::info!(?config, "Resolved controller configuration");

        let client = kube_client::init_kube_client(self.args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;

        let services = assemble(client, &config);
        Ok(Application::new(services, config))
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

fn informers(client: &Client, namespace: Option<&str>, writers: CacheWriters) -> Informers {
    Informers {
        services: Arc::new(Informer::new(
            scoped_api::<Service>(client, namespace),
            writers.services,
        )),
        pods: Arc::new(Informer::new(scoped_api::<Pod>(client, namespace), writers.pods)),
        nodes: Arc::new(Informer::new(Api::<Node>::all(client.clone()), writers.nodes)),
        endpoints: Arc::new(Informer::new(
            scoped_api::<Endpoints>(client, namespace),
            writers.endpoints,
        )),
        slices: Arc::new(
            Informer::new(
                scoped_api::<EndpointSlice>(client, namespace),
                writers.slices,
            )
            .with_label_selector(format!("{LABEL_MANAGED_BY}={CONTROLLER_NAME}")),
        ),
    }
}

fn work_queue(name: &'static str, config: &ControllerConfig) -> Arc<WorkQueue<ServiceKey>> {
    WorkQueue::new(
        name,
        ItemExponentialBackoff::new(config.min_retry_delay(), config.max_retry_delay()),
    )
}

/// Connects caches, trackers, reconcilers, queues and the dispatcher. Must run
/// inside a tokio runtime since the queues spawn their timers.
fn assemble(client: Client, config: &ControllerConfig) -> ApplicationServices {
    let (writers, caches) = new_caches();
    let informers = informers(&client, config.namespace.as_deref(), writers);
    let (changes_tx, changes_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);

    let policy = RetryPolicy {
        structural_retry_delay: config.structural_retry_delay(),
        ..RetryPolicy::default()
    };

    let endpoints_tracker = Arc::new(StaleEndpointsTracker::new());
    let endpoints_metrics = Arc::new(ControllerMetrics::new("endpoints"));
    let endpoints_reconciler = EndpointsReconciler::new(
        caches.clone(),
        WriteCoordinator::new(
            Arc::new(KubeObjectApi::<Endpoints>::new(client.clone())),
            endpoints_tracker.clone(),
            config.write_timeout(),
        ),
        endpoints_tracker,
        endpoints_metrics.clone(),
        EndpointsSettings {
            max_endpoints_capacity: config.max_endpoints_capacity,
        },
    );
    let endpoints_queue = work_queue("endpoints", config);
    let endpoints_controller = Controller::new(
        Arc::new(endpoints_reconciler),
        endpoints_queue.clone(),
        policy,
        endpoints_metrics,
    );

    let slice_tracker = Arc::new(EndpointSliceTracker::new());
    let slices_metrics = Arc::new(ControllerMetrics::new("endpointslice"));
    let slices_reconciler = EndpointSliceReconciler::new(
        caches.clone(),
        WriteCoordinator::new(
            Arc::new(KubeObjectApi::<EndpointSlice>::new(client)),
            slice_tracker.clone(),
            config.write_timeout(),
        ),
        slice_tracker.clone(),
        slices_metrics.clone(),
        EndpointSliceSettings {
            max_endpoints_per_slice: config.max_endpoints_per_slice,
            topology_aware_routing: config.enable_topology_aware_routing,
        },
    );
    let slices_queue = work_queue("endpointslice", config);
    let slices_controller = Controller::new(
        Arc::new(slices_reconciler),
        slices_queue.clone(),
        policy,
        slices_metrics,
    );

    let translator = KeyTranslator::new(
        caches.services.clone(),
        slice_tracker.clone(),
        config.enable_topology_aware_routing,
    );
    let dispatcher = Dispatcher::new(
        translator,
        slice_tracker,
        endpoints_queue,
        slices_queue,
        config.batch_period(),
    );

    ApplicationServices {
        caches,
        informers,
        changes_tx,
        changes_rx,
        dispatcher,
        endpoints_controller,
        slices_controller,
    }
}
