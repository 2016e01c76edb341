//! Construction of slice endpoints and slice objects from Pods and Services.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::Endpoint;
use k8s_openapi::api::discovery::v1::EndpointConditions;
use k8s_openapi::api::discovery::v1::EndpointPort;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::domain::pod;
use crate::domain::service;
use crate::domain::service::AddressType;
use crate::domain::service::CONTROLLER_NAME;
use crate::domain::service::LABEL_MANAGED_BY;
use crate::domain::service::LABEL_SERVICE_NAME;
use crate::domain::service::LABEL_TOPOLOGY_ZONE;
use crate::domain::write::SemanticEq;

/// Sorted, comparable form of a port list. Endpoints whose ports resolve to
/// different keys never share a slice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortKey(Vec<(String, String, i32, String)>);

impl PortKey {
    pub fn of(ports: &[EndpointPort]) -> Self {
        let mut entries: Vec<_> = ports
            .iter()
            .map(|p| {
                (
                    p.name.clone().unwrap_or_default(),
                    p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    p.port.unwrap_or_default(),
                    p.app_protocol.clone().unwrap_or_default(),
                )
            })
            .collect();
        entries.sort();
        Self(entries)
    }

    pub fn of_slice(slice: &EndpointSlice) -> Self {
        Self::of(slice.ports.as_deref().unwrap_or_default())
    }
}

/// Resolves every Service port for a Pod. Ports whose target cannot be
/// resolved on this Pod are left out.
pub fn endpoint_ports(service: &Service, pod: &Pod) -> Vec<EndpointPort> {
    let mut ports: Vec<EndpointPort> = service
        .spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .filter_map(|service_port| {
            let port = pod::find_port(pod, service_port)?;
            Some(EndpointPort {
                name: Some(service_port.name.clone().unwrap_or_default()),
                port: Some(port),
                protocol: Some(
                    service_port
                        .protocol
                        .clone()
                        .unwrap_or_else(|| "TCP".to_string()),
                ),
                app_protocol: service_port.app_protocol.clone(),
            })
        })
        .collect();
    ports.sort_by(|a, b| (&a.name, a.port).cmp(&(&b.name, b.port)));
    ports
}

/// Whether a Pod is represented in slices at all. Terminating Pods stay while
/// they still serve.
pub fn is_slice_candidate(pod: &Pod) -> bool {
    if !pod::should_pod_be_in_endpoints(pod, true) {
        return false;
    }
    !pod::is_pod_terminating(pod) || pod::is_pod_ready(pod)
}

pub fn node_zone(node: &Node) -> Option<String> {
    node.labels()
        .get(LABEL_TOPOLOGY_ZONE)
        .filter(|zone| !zone.is_empty())
        .cloned()
}

/// Builds the slice endpoint of a Pod for one address type. `None` when the
/// Pod has no IP of that family.
pub fn build_endpoint(
    service: &Service,
    pod: &Pod,
    node: Option<&Node>,
    address_type: AddressType,
) -> Option<Endpoint> {
    let ip = pod::pod_ip_for(pod, address_type)?;
    let serving = pod::is_pod_ready(pod);
    let terminating = pod::is_pod_terminating(pod);
    let ready = service::publishes_not_ready(service) || (serving && !terminating);

    Some(Endpoint {
        addresses: vec![ip],
        conditions: Some(EndpointConditions {
            ready: Some(ready),
            serving: Some(serving),
            terminating: Some(terminating),
        }),
        hostname: pod::endpoint_hostname(pod, &service.name_any()),
        node_name: pod::node_name(pod).map(str::to_string),
        zone: node.and_then(node_zone),
        target_ref: Some(pod::pod_reference(pod)),
        ..Default::default()
    })
}

pub fn is_endpoint_ready(endpoint: &Endpoint) -> bool {
    endpoint
        .conditions
        .as_ref()
        .and_then(|c| c.ready)
        .unwrap_or(false)
}

/// Identity of an endpoint within a Service: its first address.
pub fn endpoint_key(endpoint: &Endpoint) -> &str {
    endpoint.addresses.first().map(String::as_str).unwrap_or("")
}

/// Labels every slice of the Service must carry.
pub fn slice_labels(service: &Service) -> BTreeMap<String, String> {
    let mut labels = service::membership_labels(service);
    labels.insert(LABEL_SERVICE_NAME.to_string(), service.name_any());
    labels.insert(LABEL_MANAGED_BY.to_string(), CONTROLLER_NAME.to_string());
    labels
}

fn owner_reference(service: &Service) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        name: service.name_any(),
        uid: service.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether the slice is controlled by this Service object.
pub fn owned_by(slice: &EndpointSlice, service: &Service) -> bool {
    let Some(uid) = service.uid() else {
        return true;
    };
    slice
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.kind == "Service" && r.uid == uid)
}

/// A new, unnamed slice; the store assigns its name from `<service>-`.
pub fn new_slice(
    service: &Service,
    address_type: AddressType,
    ports: &[EndpointPort],
    endpoints: Vec<Endpoint>,
) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", service.name_any())),
            namespace: service.namespace(),
            labels: Some(slice_labels(service)),
            owner_references: Some(vec![owner_reference(service)]),
            ..Default::default()
        },
        address_type: address_type.as_str().to_string(),
        endpoints,
        ports: (!ports.is_empty()).then(|| ports.to_vec()),
    }
}

/// The empty slice that marks a Service with ports but no endpoints.
pub fn placeholder_slice(service: &Service, address_type: AddressType) -> EndpointSlice {
    new_slice(service, address_type, &[], Vec::new())
}

/// Whether an existing slice is already an equivalent placeholder.
pub fn is_equivalent_placeholder(existing: &EndpointSlice, placeholder: &EndpointSlice) -> bool {
    existing.endpoints.is_empty() && existing.semantically_eq(placeholder)
}

fn normalized<T>(list: &Option<Vec<T>>) -> &[T] {
    list.as_deref().unwrap_or_default()
}

impl SemanticEq for EndpointSlice {
    fn semantically_eq(&self, other: &Self) -> bool {
        self.address_type == other.address_type
            && self.endpoints == other.endpoints
            && normalized(&self.ports) == normalized(&other.ports)
            && self.metadata.labels.clone().unwrap_or_default()
                == other.metadata.labels.clone().unwrap_or_default()
    }
}
