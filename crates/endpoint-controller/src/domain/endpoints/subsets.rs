//! Desired subsets of the aggregated Endpoints object of a Service.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::EndpointAddress;
use k8s_openapi::api::core::v1::EndpointPort;
use k8s_openapi::api::core::v1::EndpointSubset;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::debug;

use crate::domain::pod;
use crate::domain::service;
use crate::domain::service::AddressType;

/// Result of [`compute_subsets`].
#[derive(Debug, Default, PartialEq)]
pub struct DesiredSubsets {
    pub subsets: Vec<EndpointSubset>,
    /// Addresses were dropped to respect the capacity limit.
    pub truncated: bool,
    /// Addresses published, ready and not ready.
    pub addresses: usize,
    /// Pods that passed the membership rule.
    pub candidates: usize,
}

/// Sortable identity of a subset's port list.
type PortSignature = Vec<(String, i32, String)>;

#[derive(Default)]
struct Buckets {
    ports: Vec<EndpointPort>,
    ready: Vec<EndpointAddress>,
    not_ready: Vec<EndpointAddress>,
}

fn signature(ports: &[EndpointPort]) -> PortSignature {
    ports
        .iter()
        .map(|p| {
            (
                p.name.clone().unwrap_or_default(),
                p.port,
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            )
        })
        .collect()
}

fn endpoint_address(service: &Service, pod: &Pod, ip: String) -> EndpointAddress {
    EndpointAddress {
        ip,
        hostname: pod::endpoint_hostname(pod, &service.name_any()),
        node_name: pod::node_name(pod).map(str::to_string),
        target_ref: Some(pod::pod_reference(pod)),
    }
}

/// Ports of the Service resolved against one pod, sorted by name.
fn resolved_ports(service: &Service, pod: &Pod) -> Vec<EndpointPort> {
    let mut ports: Vec<EndpointPort> = service
        .spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .filter_map(|service_port| {
            let port = pod::find_port(pod, service_port)?;
            Some(EndpointPort {
                name: service_port.name.clone().filter(|name| !name.is_empty()),
                port,
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

fn address_order(address: &EndpointAddress) -> (Option<IpAddr>, &str) {
    (address.ip.parse().ok(), address.ip.as_str())
}

/// Computes the subsets for `pods`, which must already match the Service
/// selector. Pods with the same resolved ports share a subset; within a subset
/// addresses are split by readiness and sorted.
pub fn compute_subsets<'a>(
    service: &Service,
    pods: impl IntoIterator<Item = &'a Pod>,
    max_capacity: usize,
) -> DesiredSubsets {
    let publish_not_ready = service::publishes_not_ready(service);
    let primary = service::address_types(service)
        .first()
        .copied()
        .unwrap_or(AddressType::IPv4);
    let headless_without_ports = service::is_headless(service) && !service::has_ports(service);

    let mut groups: BTreeMap<PortSignature, Buckets> = BTreeMap::new();
    let mut candidates = 0;
    for pod in pods {
        if !pod::should_pod_be_in_endpoints(pod, publish_not_ready) {
            continue;
        }
        let Some(ip) = pod::pod_ip_for(pod, primary) else {
            debug!(pod = %pod.name_any(), family = %primary, "Pod has no IP of the primary family, skipping");
            continue;
        };
        candidates += 1;

        let ports = if headless_without_ports {
            Vec::new()
        } else {
            let ports = resolved_ports(service, pod);
            if ports.is_empty() {
                continue;
            }
            ports
        };
        let address = endpoint_address(service, pod, ip);
        let bucket = groups.entry(signature(&ports)).or_insert_with(|| Buckets {
            ports,
            ..Default::default()
        });
        if publish_not_ready || pod::is_pod_ready(pod) {
            bucket.ready.push(address);
        } else {
            bucket.not_ready.push(address);
        }
    }

    let mut subsets: Vec<EndpointSubset> = groups
        .into_values()
        .map(|mut bucket| {
            bucket.ready.sort_by(|a, b| address_order(a).cmp(&address_order(b)));
            bucket.not_ready.sort_by(|a, b| address_order(a).cmp(&address_order(b)));
            EndpointSubset {
                addresses: (!bucket.ready.is_empty()).then_some(bucket.ready),
                not_ready_addresses: (!bucket.not_ready.is_empty()).then_some(bucket.not_ready),
                ports: (!bucket.ports.is_empty()).then_some(bucket.ports),
            }
        })
        .collect();

    let truncated = truncate(&mut subsets, max_capacity);
    let addresses = subsets.iter().map(|s| ready_len(s) + not_ready_len(s)).sum();
    DesiredSubsets {
        subsets,
        truncated,
        addresses,
        candidates,
    }
}

fn ready_len(subset: &EndpointSubset) -> usize {
    subset.addresses.as_ref().map_or(0, Vec::len)
}

fn not_ready_len(subset: &EndpointSubset) -> usize {
    subset.not_ready_addresses.as_ref().map_or(0, Vec::len)
}

fn keep_first(list: &mut Option<Vec<EndpointAddress>>, count: usize) {
    if let Some(addresses) = list.as_mut() {
        addresses.truncate(count);
        if addresses.is_empty() {
            *list = None;
        }
    }
}

/// Cuts the subsets down to `max_capacity` addresses. Not-ready addresses go
/// first; ready ones are only cut, together with every not-ready address, when
/// they alone exceed the limit. Each subset keeps a share proportional to its
/// size, rounded up, until the limit is used up.
fn truncate(subsets: &mut [EndpointSubset], max_capacity: usize) -> bool {
    let total_ready: usize = subsets.iter().map(ready_len).sum();
    let total_not_ready: usize = subsets.iter().map(not_ready_len).sum();
    if total_ready + total_not_ready <= max_capacity {
        return false;
    }

    let truncate_ready = total_ready > max_capacity;
    let (max, total) = if truncate_ready {
        (max_capacity, total_ready)
    } else {
        (max_capacity - total_ready, total_not_ready)
    };

    let mut remaining = max;
    for subset in subsets.iter_mut() {
        let in_subset = if truncate_ready {
            ready_len(subset)
        } else {
            not_ready_len(subset)
        };
        let share = ((in_subset as f64 / total as f64) * max as f64).ceil() as usize;
        let share = share.min(remaining);
        if truncate_ready {
            keep_first(&mut subset.addresses, share);
            subset.not_ready_addresses = None;
            remaining -= ready_len(subset);
        } else {
            keep_first(&mut subset.not_ready_addresses, share);
            remaining -= not_ready_len(subset);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ContainerPort;
    use k8s_openapi::api::core::v1::ServicePort;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::mock::fixtures;

    fn ips(list: &Option<Vec<EndpointAddress>>) -> Vec<&str> {
        list.iter().flatten().map(|a| a.ip.as_str()).collect()
    }

    #[test]
    fn splits_ready_and_not_ready() {
        let service = fixtures::service("default", "svc-a", &[("app", "a")], &[80]);
        let pods = vec![
            fixtures::pod("default", "p2", &[("app", "a")], Some("10.0.0.2"), false),
            fixtures::pod("default", "p1", &[("app", "a")], Some("10.0.0.1"), true),
        ];

        let desired = compute_subsets(&service, &pods, 1000);
        assert_eq!(desired.subsets.len(), 1);
        assert_eq!(ips(&desired.subsets[0].addresses), vec!["10.0.0.1"]);
        assert_eq!(ips(&desired.subsets[0].not_ready_addresses), vec!["10.0.0.2"]);
        assert_eq!(desired.candidates, 2);
        assert!(!desired.truncated);
    }

    #[test]
    fn terminating_pods_are_left_out_unless_publishing_not_ready() {
        let mut service = fixtures::service("default", "svc", &[("app", "a")], &[80]);
        let pods = vec![fixtures::terminating(fixtures::pod(
            "default",
            "p1",
            &[("app", "a")],
            Some("10.0.0.1"),
            true,
        ))];
        assert!(compute_subsets(&service, &pods, 1000).subsets.is_empty());

        service.spec.as_mut().unwrap().publish_not_ready_addresses = Some(true);
        let desired = compute_subsets(&service, &pods, 1000);
        assert_eq!(ips(&desired.subsets[0].addresses), vec!["10.0.0.1"]);
    }

    #[test]
    fn pods_with_different_ports_get_separate_subsets() {
        let mut service = fixtures::service("default", "svc", &[("app", "a")], &[80]);
        service.spec.as_mut().unwrap().ports = Some(vec![ServicePort {
            name: Some("http".to_string()),
            port: 80,
            target_port: Some(IntOrString::String("http".to_string())),
            ..Default::default()
        }]);
        let with_port = |name: &str, ip: &str, port: i32| {
            let mut pod = fixtures::pod("default", name, &[("app", "a")], Some(ip), true);
            pod.spec.as_mut().unwrap().containers[0].ports = Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: port,
                ..Default::default()
            }]);
            pod
        };
        let pods = vec![
            with_port("p1", "10.0.0.1", 8080),
            with_port("p2", "10.0.0.2", 9090),
            with_port("p3", "10.0.0.3", 8080),
            fixtures::pod("default", "p4", &[("app", "a")], Some("10.0.0.4"), true),
        ];

        let desired = compute_subsets(&service, &pods, 1000);
        assert_eq!(desired.subsets.len(), 2);
        assert_eq!(ips(&desired.subsets[0].addresses), vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(ips(&desired.subsets[1].addresses), vec!["10.0.0.2"]);
        assert_eq!(desired.addresses, 3);
    }

    #[test]
    fn headless_service_without_ports_gets_portless_subset() {
        let mut service = fixtures::service("default", "svc", &[("app", "a")], &[]);
        service.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        let pods = vec![fixtures::pod("default", "p1", &[("app", "a")], Some("10.0.0.1"), true)];

        let desired = compute_subsets(&service, &pods, 1000);
        assert_eq!(desired.subsets.len(), 1);
        assert!(desired.subsets[0].ports.is_none());

        service.spec.as_mut().unwrap().cluster_ip = Some("10.96.0.10".to_string());
        let desired = compute_subsets(&service, &pods, 1000);
        assert!(desired.subsets.is_empty());
        assert_eq!(desired.candidates, 1);
    }

    #[test]
    fn addresses_sort_numerically() {
        let service = fixtures::service("default", "svc", &[("app", "a")], &[80]);
        let pods: Vec<_> = ["10.0.0.10", "10.0.0.9", "10.0.0.100"]
            .iter()
            .enumerate()
            .map(|(i, ip)| fixtures::pod("default", &format!("p{i}"), &[("app", "a")], Some(ip), true))
            .collect();

        let desired = compute_subsets(&service, &pods, 1000);
        assert_eq!(
            ips(&desired.subsets[0].addresses),
            vec!["10.0.0.9", "10.0.0.10", "10.0.0.100"]
        );
    }

    #[test]
    fn over_capacity_drops_not_ready_first() {
        let service = fixtures::service("default", "svc", &[("app", "a")], &[80]);
        let pods: Vec<_> = (1..=6)
            .map(|i| {
                fixtures::pod(
                    "default",
                    &format!("p{i}"),
                    &[("app", "a")],
                    Some(&format!("10.0.0.{i}")),
                    i <= 3,
                )
            })
            .collect();

        let desired = compute_subsets(&service, &pods, 4);
        assert!(desired.truncated);
        assert_eq!(desired.addresses, 4);
        assert_eq!(ips(&desired.subsets[0].addresses).len(), 3);
        assert_eq!(ips(&desired.subsets[0].not_ready_addresses), vec!["10.0.0.4"]);

        let desired = compute_subsets(&service, &pods, 2);
        assert_eq!(desired.addresses, 2);
        assert!(desired.subsets[0].not_ready_addresses.is_none());
    }
}
