//! Zone hints for topology-aware routing.
//!
//! Ready endpoints are allocated to zones in proportion to the allocatable CPU
//! of the ready Nodes in each zone. Every endpoint first hints at its own
//! zone; zones holding more than their maximum share then donate endpoints to
//! zones below their minimum.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::discovery::v1::Endpoint;
use k8s_openapi::api::discovery::v1::EndpointHints;
use k8s_openapi::api::discovery::v1::ForZone;
use kube::ResourceExt;

use super::builder::is_endpoint_ready;
use super::builder::node_zone;

/// Share of its desired allocation a zone may be short before it receives
/// endpoints from other zones.
const OVERLOAD_THRESHOLD: f64 = 0.2;

const LABEL_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

#[derive(Debug, Clone, Copy, PartialEq)]
struct Allocation {
    minimum: usize,
    maximum: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintsOutcome {
    /// Hints set; endpoints per zone after redistribution.
    Applied(BTreeMap<String, usize>),
    Removed(&'static str),
}

fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Parses a CPU quantity (`4`, `3500m`, `0.5`) into cores.
pub fn parse_cpu(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    match quantity.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().ok().map(|m| m / 1000.0),
        None => quantity.parse::<f64>().ok(),
    }
    .filter(|cores| cores.is_finite() && *cores >= 0.0)
}

/// Allocatable CPU of a node, if it is usable for routing decisions.
pub fn node_cpu(node: &Node) -> Option<f64> {
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get("cpu"))
        .and_then(|q| parse_cpu(&q.0))
}

/// Fraction of cluster CPU per zone. `None` when fewer than two zones have
/// usable nodes or a ready node lacks zone or CPU information.
pub fn zone_cpu_ratios(nodes: &[Arc<Node>]) -> Option<BTreeMap<String, f64>> {
    let mut cpu_by_zone: BTreeMap<String, f64> = BTreeMap::new();
    let mut total = 0.0;
    for node in nodes {
        if !is_node_ready(node) || node.labels().contains_key(LABEL_CONTROL_PLANE) {
            continue;
        }
        let zone = node_zone(node)?;
        let cpu = node_cpu(node)?;
        *cpu_by_zone.entry(zone).or_default() += cpu;
        total += cpu;
    }
    if cpu_by_zone.len() < 2 || total <= 0.0 {
        return None;
    }
    Some(
        cpu_by_zone
            .into_iter()
            .map(|(zone, cpu)| (zone, cpu / total))
            .collect(),
    )
}

fn allocations(
    num_endpoints: usize,
    ratios: &BTreeMap<String, f64>,
) -> Option<BTreeMap<String, Allocation>> {
    if ratios.len() > num_endpoints {
        return None;
    }
    let mut remaining = num_endpoints as i64;
    let mut min_total = 0;
    let mut minimums = BTreeMap::new();
    for (zone, ratio) in ratios {
        let desired = ratio * num_endpoints as f64;
        let minimum = (desired / (1.0 + OVERLOAD_THRESHOLD)).ceil() as usize;
        min_total += minimum;
        remaining -= minimum as i64;
        if remaining < 0 {
            return None;
        }
        minimums.insert(zone.clone(), minimum);
    }
    Some(
        minimums
            .into_iter()
            .map(|(zone, minimum)| {
                let maximum = minimum + num_endpoints - min_total;
                (zone, Allocation { minimum, maximum })
            })
            .collect(),
    )
}

fn for_zone(zone: &str) -> Option<EndpointHints> {
    Some(EndpointHints {
        for_zones: Some(vec![ForZone {
            name: zone.to_string(),
        }]),
    })
}

pub fn remove_hints(endpoints: &mut [&mut Endpoint]) {
    for endpoint in endpoints.iter_mut() {
        endpoint.hints = None;
    }
}

/// Sets zone hints on the ready endpoints of one address type, or removes all
/// hints when they cannot be computed safely.
pub fn add_hints(
    endpoints: &mut [&mut Endpoint],
    ratios: Option<&BTreeMap<String, f64>>,
) -> HintsOutcome {
    let outcome = compute_hints(endpoints, ratios);
    if matches!(outcome, HintsOutcome::Removed(_)) {
        remove_hints(endpoints);
    }
    outcome
}

fn compute_hints(
    endpoints: &mut [&mut Endpoint],
    ratios: Option<&BTreeMap<String, f64>>,
) -> HintsOutcome {
    let Some(ratios) = ratios else {
        return HintsOutcome::Removed("insufficient node information");
    };
    let mut ready = 0;
    for endpoint in endpoints.iter() {
        if !is_endpoint_ready(endpoint) {
            continue;
        }
        if endpoint.zone.as_deref().unwrap_or_default().is_empty() {
            return HintsOutcome::Removed("endpoint without zone");
        }
        ready += 1;
    }
    let Some(allocations) = allocations(ready, ratios) else {
        return HintsOutcome::Removed("insufficient endpoints for zones");
    };

    let mut per_zone: BTreeMap<String, usize> = BTreeMap::new();
    for endpoint in endpoints.iter_mut() {
        if !is_endpoint_ready(endpoint) {
            endpoint.hints = None;
            continue;
        }
        let zone = endpoint.zone.clone().unwrap_or_default();
        if !allocations.contains_key(&zone) {
            return HintsOutcome::Removed("endpoint in zone without ready nodes");
        }
        endpoint.hints = for_zone(&zone);
        *per_zone.entry(zone).or_default() += 1;
    }

    let mut giving: BTreeMap<String, usize> = BTreeMap::new();
    let mut receiving: BTreeMap<String, usize> = BTreeMap::new();
    for (zone, allocation) in &allocations {
        let assigned = per_zone.get(zone).copied().unwrap_or(0);
        if assigned > allocation.maximum {
            giving.insert(zone.clone(), assigned - allocation.maximum);
        } else if assigned < allocation.minimum {
            receiving.insert(zone.clone(), allocation.minimum - assigned);
        }
    }

    for endpoint in endpoints.iter_mut() {
        if !is_endpoint_ready(endpoint) {
            continue;
        }
        let zone = endpoint.zone.clone().unwrap_or_default();
        let Some(surplus) = giving.get_mut(&zone).filter(|n| **n > 0) else {
            continue;
        };
        let Some((target, need)) = receiving.iter_mut().find(|(_, need)| **need > 0) else {
            break;
        };
        endpoint.hints = for_zone(target);
        *surplus -= 1;
        *need -= 1;
        *per_zone.entry(zone).or_default() -= 1;
        *per_zone.entry(target.clone()).or_default() += 1;
    }

    if allocations
        .keys()
        .any(|zone| per_zone.get(zone).copied().unwrap_or(0) == 0)
    {
        return HintsOutcome::Removed("zone without endpoints");
    }
    HintsOutcome::Applied(per_zone)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::discovery::v1::EndpointConditions;

    use super::*;
    use crate::mock::fixtures;

    fn endpoint(ip: &str, zone: Option<&str>, ready: bool) -> Endpoint {
        Endpoint {
            addresses: vec![ip.to_string()],
            conditions: Some(EndpointConditions {
                ready: Some(ready),
                serving: Some(ready),
                terminating: Some(false),
            }),
            zone: zone.map(str::to_string),
            ..Default::default()
        }
    }

    fn hinted_zone(endpoint: &Endpoint) -> Option<&str> {
        endpoint
            .hints
            .as_ref()?
            .for_zones
            .as_ref()?
            .first()
            .map(|z| z.name.as_str())
    }

    fn ratios(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(z, r)| (z.to_string(), *r)).collect()
    }

    #[test]
    fn parses_cpu_quantities() {
        assert_eq!(parse_cpu("4"), Some(4.0));
        assert_eq!(parse_cpu("3500m"), Some(3.5));
        assert_eq!(parse_cpu("0.5"), Some(0.5));
        assert_eq!(parse_cpu("lots"), None);
    }

    #[test]
    fn ratios_need_two_zones() {
        let one_zone = vec![
            Arc::new(fixtures::node("n1", "zone-a", "4")),
            Arc::new(fixtures::node("n2", "zone-a", "4")),
        ];
        assert!(zone_cpu_ratios(&one_zone).is_none());

        let two_zones = vec![
            Arc::new(fixtures::node("n1", "zone-a", "6")),
            Arc::new(fixtures::node("n2", "zone-b", "2")),
        ];
        let ratios = zone_cpu_ratios(&two_zones).unwrap();
        assert_eq!(ratios.get("zone-a"), Some(&0.75));
        assert_eq!(ratios.get("zone-b"), Some(&0.25));
    }

    #[test]
    fn balanced_zones_hint_their_own_zone() {
        let mut eps = vec![
            endpoint("10.0.0.1", Some("zone-a"), true),
            endpoint("10.0.0.2", Some("zone-b"), true),
            endpoint("10.0.0.3", Some("zone-b"), false),
        ];
        let mut refs: Vec<&mut Endpoint> = eps.iter_mut().collect();
        let outcome = add_hints(&mut refs, Some(&ratios(&[("zone-a", 0.5), ("zone-b", 0.5)])));

        assert!(matches!(outcome, HintsOutcome::Applied(_)));
        assert_eq!(hinted_zone(&eps[0]), Some("zone-a"));
        assert_eq!(hinted_zone(&eps[1]), Some("zone-b"));
        assert_eq!(hinted_zone(&eps[2]), None, "not-ready endpoints get no hint");
    }

    #[test]
    fn surplus_zone_donates_to_deficit_zone() {
        let mut eps = vec![
            endpoint("10.0.0.1", Some("zone-a"), true),
            endpoint("10.0.0.2", Some("zone-a"), true),
            endpoint("10.0.0.3", Some("zone-a"), true),
            endpoint("10.0.0.4", Some("zone-b"), true),
        ];
        let mut refs: Vec<&mut Endpoint> = eps.iter_mut().collect();
        let outcome = add_hints(&mut refs, Some(&ratios(&[("zone-a", 0.5), ("zone-b", 0.5)])));

        let HintsOutcome::Applied(per_zone) = outcome else {
            panic!("expected hints, got {outcome:?}");
        };
        assert_eq!(per_zone.get("zone-a"), Some(&2));
        assert_eq!(per_zone.get("zone-b"), Some(&2));
        assert_eq!(hinted_zone(&eps[0]), Some("zone-b"));
        assert_eq!(hinted_zone(&eps[3]), Some("zone-b"));
    }

    #[test]
    fn missing_zone_removes_all_hints() {
        let mut eps = vec![
            endpoint("10.0.0.1", Some("zone-a"), true),
            endpoint("10.0.0.2", None, true),
        ];
        eps[0].hints = for_zone("zone-a");
        let mut refs: Vec<&mut Endpoint> = eps.iter_mut().collect();
        let outcome = add_hints(&mut refs, Some(&ratios(&[("zone-a", 0.5), ("zone-b", 0.5)])));

        assert_eq!(outcome, HintsOutcome::Removed("endpoint without zone"));
        assert!(eps.iter().all(|e| e.hints.is_none()));
    }

    #[test]
    fn fewer_endpoints_than_zones_removes_hints() {
        let mut eps = vec![endpoint("10.0.0.1", Some("zone-a"), true)];
        let mut refs: Vec<&mut Endpoint> = eps.iter_mut().collect();
        let outcome = add_hints(&mut refs, Some(&ratios(&[("zone-a", 0.5), ("zone-b", 0.5)])));
        assert_eq!(outcome, HintsOutcome::Removed("insufficient endpoints for zones"));
    }
}
