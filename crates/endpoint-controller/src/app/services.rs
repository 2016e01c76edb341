use std::sync::Arc;

use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use tokio::sync::mpsc;

use crate::domain::change::Change;
use crate::domain::controller::Controller;
use crate::domain::endpoints::EndpointsReconciler;
use crate::domain::endpointslice::EndpointSliceReconciler;
use crate::domain::translator::Dispatcher;
use crate::infrastructure::cache::Caches;
use crate::infrastructure::informer::Informer;

/// One informer per watched kind.
pub struct Informers {
    pub services: Arc<Informer<Service>>,
    pub pods: Arc<Informer<Pod>>,
    pub nodes: Arc<Informer<Node>>,
    pub endpoints: Arc<Informer<Endpoints>>,
    pub slices: Arc<Informer<EndpointSlice>>,
}

/// Application dependencies
pub struct ApplicationServices {
    pub caches: Caches,
    pub informers: Informers,
    pub changes_tx: mpsc::Sender<Change>,
    pub changes_rx: mpsc::Receiver<Change>,
    pub dispatcher: Dispatcher,
    pub endpoints_controller: Controller<EndpointsReconciler>,
    pub slices_controller: Controller<EndpointSliceReconciler>,
}
