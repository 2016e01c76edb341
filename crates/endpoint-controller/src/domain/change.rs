use std::sync::Arc;

use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;

/// A single observed change of one object.
#[derive(Debug, Clone)]
pub enum ChangeEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> ChangeEvent<K> {
    /// The most recent state of the object.
    pub fn latest(&self) -> &Arc<K> {
        match self {
            ChangeEvent::Added(obj) | ChangeEvent::Deleted(obj) => obj,
            ChangeEvent::Updated { new, .. } => new,
        }
    }
}

/// Change notification for any kind the controller watches.
#[derive(Debug, Clone)]
pub enum Change {
    Pod(ChangeEvent<Pod>),
    Service(ChangeEvent<Service>),
    Node(ChangeEvent<Node>),
    Endpoints(ChangeEvent<Endpoints>),
    EndpointSlice(ChangeEvent<EndpointSlice>),
}

/// Kinds that can be watched and cached.
pub trait Watched:
    kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + 'static
{
    const KIND: &'static str;

    fn into_change(event: ChangeEvent<Self>) -> Change;
}

impl Watched for Pod {
    const KIND: &'static str = "Pod";

    fn into_change(event: ChangeEvent<Self>) -> Change {
        Change::Pod(event)
    }
}

impl Watched for Service {
    const KIND: &'static str = "Service";

    fn into_change(event: ChangeEvent<Self>) -> Change {
        Change::Service(event)
    }
}

impl Watched for Node {
    const KIND: &'static str = "Node";

    fn into_change(event: ChangeEvent<Self>) -> Change {
        Change::Node(event)
    }
}

impl Watched for Endpoints {
    const KIND: &'static str = "Endpoints";

    fn into_change(event: ChangeEvent<Self>) -> Change {
        Change::Endpoints(event)
    }
}

impl Watched for EndpointSlice {
    const KIND: &'static str = "EndpointSlice";

    fn into_change(event: ChangeEvent<Self>) -> Change {
        Change::EndpointSlice(event)
    }
}
