//! Pod predicates shared by both reconcilers and the key translator.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::domain::service::AddressType;

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

pub fn is_pod_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Succeeded and Failed pods never come back and are never endpoints.
pub fn is_pod_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// All IPs of a pod, primary first, without duplicates.
pub fn pod_ips(pod: &Pod) -> Vec<String> {
    let Some(status) = pod.status.as_ref() else {
        return Vec::new();
    };
    let mut ips: Vec<String> = Vec::new();
    if let Some(ip) = status.pod_ip.as_ref().filter(|ip| !ip.is_empty()) {
        ips.push(ip.clone());
    }
    for entry in status.pod_ips.iter().flatten() {
        if let Some(ip) = Option::<String>::from(entry.ip.clone()) {
            if !ip.is_empty() && !ips.contains(&ip) {
                ips.push(ip);
            }
        }
    }
    ips
}

pub fn pod_ip_for(pod: &Pod, address_type: AddressType) -> Option<String> {
    pod_ips(pod).into_iter().find(|ip| {
        ip.parse::<IpAddr>()
            .map(|addr| address_type.matches(&addr))
            .unwrap_or(false)
    })
}

/// Whether a pod may be represented at all: it is not terminal, has an IP and,
/// unless `include_terminating`, is not being deleted.
pub fn should_pod_be_in_endpoints(pod: &Pod, include_terminating: bool) -> bool {
    if is_pod_terminal(pod) {
        return false;
    }
    if pod_ips(pod).is_empty() {
        return false;
    }
    include_terminating || !is_pod_terminating(pod)
}

/// Resolves a service port's target port against the pod's containers.
pub fn find_port(pod: &Pod, service_port: &ServicePort) -> Option<i32> {
    match &service_port.target_port {
        None => Some(service_port.port),
        Some(IntOrString::Int(port)) => Some(*port),
        Some(IntOrString::String(name)) => {
            if let Ok(port) = name.parse::<i32>() {
                return Some(port);
            }
            let protocol = service_port.protocol.as_deref().unwrap_or("TCP");
            pod.spec
                .iter()
                .flat_map(|spec| spec.containers.iter())
                .flat_map(|container| container.ports.iter().flatten())
                .find(|port| {
                    port.name.as_deref() == Some(name.as_str())
                        && port.protocol.as_deref().unwrap_or("TCP") == protocol
                })
                .map(|port| port.container_port)
        }
    }
}

pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Hostname published for the pod when its subdomain names the service.
pub fn endpoint_hostname(pod: &Pod, service_name: &str) -> Option<String> {
    let spec = pod.spec.as_ref()?;
    let hostname = spec.hostname.as_ref().filter(|h| !h.is_empty())?;
    (spec.subdomain.as_deref() == Some(service_name)).then(|| hostname.clone())
}

pub fn pod_reference(pod: &Pod) -> ObjectReference {
    ObjectReference {
        kind: Some("Pod".to_string()),
        namespace: pod.namespace(),
        name: Some(pod.name_any()),
        uid: pod.uid(),
        ..Default::default()
    }
}

/// Everything about a pod that can change its membership records. Two pods
/// with equal views produce identical endpoints.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PodEndpointView<'a> {
    ips: Vec<String>,
    ready: bool,
    terminating: bool,
    terminal: bool,
    node_name: Option<&'a str>,
    hostname: Option<&'a str>,
    subdomain: Option<&'a str>,
    named_ports: BTreeMap<(String, String), i32>,
}

impl<'a> PodEndpointView<'a> {
    pub(crate) fn of(pod: &'a Pod) -> Self {
        let spec = pod.spec.as_ref();
        let named_ports = spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .flat_map(|container| container.ports.iter().flatten())
            .filter_map(|port| {
                let name = port.name.clone()?;
                let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
                Some(((name, protocol), port.container_port))
            })
            .collect();
        Self {
            ips: pod_ips(pod),
            ready: is_pod_ready(pod),
            terminating: is_pod_terminating(pod),
            terminal: is_pod_terminal(pod),
            node_name: node_name(pod),
            hostname: spec.and_then(|s| s.hostname.as_deref()),
            subdomain: spec.and_then(|s| s.subdomain.as_deref()),
            named_ports,
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ContainerPort;

    use super::*;
    use crate::mock::fixtures;

    #[test]
    fn readiness_follows_ready_condition() {
        let ready = fixtures::pod("default", "p1", &[("app", "a")], Some("10.0.0.1"), true);
        let not_ready = fixtures::pod("default", "p2", &[("app", "a")], Some("10.0.0.2"), false);
        assert!(is_pod_ready(&ready));
        assert!(!is_pod_ready(&not_ready));
    }

    #[test]
    fn pods_without_ip_or_terminal_are_excluded() {
        let no_ip = fixtures::pod("default", "p1", &[], None, true);
        assert!(!should_pod_be_in_endpoints(&no_ip, true));

        let mut done = fixtures::pod("default", "p2", &[], Some("10.0.0.2"), true);
        done.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        assert!(!should_pod_be_in_endpoints(&done, true));
    }

    #[test]
    fn terminating_pods_need_explicit_inclusion() {
        let pod = fixtures::terminating(fixtures::pod(
            "default",
            "p1",
            &[],
            Some("10.0.0.1"),
            true,
        ));
        assert!(!should_pod_be_in_endpoints(&pod, false));
        assert!(should_pod_be_in_endpoints(&pod, true));
    }

    #[test]
    fn picks_ip_matching_family() {
        let mut pod = fixtures::pod("default", "p1", &[], Some("10.0.0.1"), true);
        pod.status.as_mut().unwrap().pod_ips = Some(vec![
            serde_json::from_value(serde_json::json!({"ip": "10.0.0.1"})).unwrap(),
            serde_json::from_value(serde_json::json!({"ip": "fd00::1"})).unwrap(),
        ]);
        assert_eq!(pod_ips(&pod), vec!["10.0.0.1", "fd00::1"]);
        assert_eq!(pod_ip_for(&pod, AddressType::IPv6).as_deref(), Some("fd00::1"));
        assert_eq!(pod_ip_for(&pod, AddressType::IPv4).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn resolves_named_target_ports() {
        let mut pod = fixtures::pod("default", "p1", &[], Some("10.0.0.1"), true);
        pod.spec.as_mut().unwrap().containers[0].ports = Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: 8080,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);

        let named = ServicePort {
            port: 80,
            target_port: Some(IntOrString::String("http".to_string())),
            ..Default::default()
        };
        assert_eq!(find_port(&pod, &named), Some(8080));

        let missing = ServicePort {
            port: 80,
            target_port: Some(IntOrString::String("grpc".to_string())),
            ..Default::default()
        };
        assert_eq!(find_port(&pod, &missing), None);

        let numeric = ServicePort {
            port: 80,
            target_port: Some(IntOrString::Int(9090)),
            ..Default::default()
        };
        assert_eq!(find_port(&pod, &numeric), Some(9090));
    }

    #[test]
    fn hostname_requires_matching_subdomain() {
        let mut pod = fixtures::pod("default", "p1", &[], Some("10.0.0.1"), true);
        let spec = pod.spec.as_mut().unwrap();
        spec.hostname = Some("web-0".to_string());
        spec.subdomain = Some("web".to_string());
        assert_eq!(endpoint_hostname(&pod, "web").as_deref(), Some("web-0"));
        assert_eq!(endpoint_hostname(&pod, "other"), None);
    }
}
