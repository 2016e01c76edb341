//! Service accessors and the labels/annotations this controller understands.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Service;

pub const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";
pub const LABEL_MANAGED_BY: &str = "endpointslice.kubernetes.io/managed-by";
pub const LABEL_HEADLESS: &str = "service.kubernetes.io/headless";
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
pub const ANNOTATION_TOPOLOGY_MODE: &str = "service.kubernetes.io/topology-mode";
pub const ANNOTATION_TOPOLOGY_AWARE_HINTS: &str = "service.kubernetes.io/topology-aware-hints";
pub const ANNOTATION_OVER_CAPACITY: &str = "endpoints.kubernetes.io/over-capacity";

/// Value of the managed-by label on every slice this controller owns.
pub const CONTROLLER_NAME: &str = "endpointslice-controller.k8s.io";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub enum AddressType {
    #[display("IPv4")]
    IPv4,
    #[display("IPv6")]
    IPv6,
}

impl AddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::IPv4 => "IPv4",
            AddressType::IPv6 => "IPv6",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IPv4" => Some(AddressType::IPv4),
            "IPv6" => Some(AddressType::IPv6),
            _ => None,
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            AddressType::IPv4 => addr.is_ipv4(),
            AddressType::IPv6 => addr.is_ipv6(),
        }
    }

    fn of(addr: &IpAddr) -> Self {
        if addr.is_ipv4() {
            AddressType::IPv4
        } else {
            AddressType::IPv6
        }
    }
}

pub fn selector(service: &Service) -> Option<&BTreeMap<String, String>> {
    service.spec.as_ref().and_then(|spec| spec.selector.as_ref())
}

/// Services without a selector, ExternalName services and services being
/// deleted get no membership records from this controller.
pub fn is_managed(service: &Service) -> bool {
    if service.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(spec) = service.spec.as_ref() else {
        return false;
    };
    spec.selector.is_some() && spec.type_.as_deref() != Some("ExternalName")
}

pub fn is_headless(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        == Some("None")
}

pub fn publishes_not_ready(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.publish_not_ready_addresses)
        .unwrap_or(false)
}

pub fn has_ports(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| !ports.is_empty())
        .unwrap_or(false)
}

/// Address families served, in preference order: `ipFamilies`, then the
/// family of the cluster IPs, then IPv4.
pub fn address_types(service: &Service) -> Vec<AddressType> {
    let Some(spec) = service.spec.as_ref() else {
        return vec![AddressType::IPv4];
    };
    let mut types = Vec::new();
    for family in spec.ip_families.iter().flatten() {
        if let Some(t) = AddressType::parse(family) {
            if !types.contains(&t) {
                types.push(t);
            }
        }
    }
    if types.is_empty() {
        let cluster_ips = spec
            .cluster_ips
            .iter()
            .flatten()
            .chain(spec.cluster_ip.iter());
        for ip in cluster_ips {
            if let Ok(addr) = ip.parse::<IpAddr>() {
                let t = AddressType::of(&addr);
                if !types.contains(&t) {
                    types.push(t);
                }
            }
        }
    }
    if types.is_empty() {
        types.push(AddressType::IPv4);
    }
    types
}

/// Whether the service asked for topology-aware routing.
pub fn wants_topology_hints(service: &Service) -> bool {
    let Some(annotations) = service.metadata.annotations.as_ref() else {
        return false;
    };
    let mode = annotations
        .get(ANNOTATION_TOPOLOGY_MODE)
        .or_else(|| annotations.get(ANNOTATION_TOPOLOGY_AWARE_HINTS));
    matches!(mode.map(String::as_str), Some("Auto") | Some("auto"))
}

/// Labels copied onto membership objects: the service's own labels, minus
/// the ones this controller owns, plus the headless marker.
pub fn membership_labels(service: &Service) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = service
        .metadata
        .labels
        .iter()
        .flatten()
        .filter(|(key, _)| {
            key.as_str() != LABEL_SERVICE_NAME
                && key.as_str() != LABEL_MANAGED_BY
                && key.as_str() != LABEL_HEADLESS
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if is_headless(service) {
        labels.insert(LABEL_HEADLESS.to_string(), String::new());
    }
    labels
}
