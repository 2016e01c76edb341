//! Packing of desired endpoints into slices with as few writes as possible.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::Endpoint;
use k8s_openapi::api::discovery::v1::EndpointPort;
use k8s_openapi::api::discovery::v1::EndpointSlice;

use super::builder::endpoint_key;
use super::builder::new_slice;
use super::builder::slice_labels;
use crate::domain::service::AddressType;

/// Writes needed to converge the slices of a Service.
#[derive(Debug, Default)]
pub struct SlicePlan {
    pub to_create: Vec<EndpointSlice>,
    pub to_update: Vec<(EndpointSlice, Arc<EndpointSlice>)>,
    pub to_delete: Vec<Arc<EndpointSlice>>,
}

impl SlicePlan {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn extend(&mut self, other: SlicePlan) {
        self.to_create.extend(other.to_create);
        self.to_update.extend(other.to_update);
        self.to_delete.extend(other.to_delete);
    }

    /// Turns pending creates into updates of slices of the same address type
    /// that were about to be deleted.
    pub fn reuse_deleted(&mut self) {
        let mut creates = std::mem::take(&mut self.to_create);
        let mut kept = Vec::new();
        for observed in std::mem::take(&mut self.to_delete) {
            let reusable = creates
                .iter()
                .position(|c| c.address_type == observed.address_type);
            match reusable {
                Some(index) => {
                    let mut desired = creates.remove(index);
                    desired.metadata.name = observed.metadata.name.clone();
                    desired.metadata.generate_name = observed.metadata.generate_name.clone();
                    desired.metadata.uid = observed.metadata.uid.clone();
                    desired.metadata.resource_version = observed.metadata.resource_version.clone();
                    desired.metadata.creation_timestamp = observed.metadata.creation_timestamp.clone();
                    self.to_update.push((desired, observed));
                }
                None => kept.push(observed),
            }
        }
        self.to_create = creates;
        self.to_delete = kept;
    }
}

/// Creation order of slices: oldest first, then by name.
fn age_order(slice: &EndpointSlice) -> (Option<chrono::DateTime<chrono::Utc>>, String) {
    (
        slice.metadata.creation_timestamp.as_ref().map(|t| t.0),
        slice.metadata.name.clone().unwrap_or_default(),
    )
}

struct Working {
    observed: Arc<EndpointSlice>,
    desired: EndpointSlice,
}

/// Reconciles the slices of one address type and port set against the
/// desired endpoints, which must be sorted and unique by address.
///
/// Existing slices keep the endpoints still desired and drop the rest. New
/// endpoints go first into slices that change anyway, then into the most
/// under-full unchanged slice, and only then into new slices of at most
/// `max_per_slice` endpoints.
pub fn reconcile_port_mapping(
    service: &Service,
    address_type: AddressType,
    ports: &[EndpointPort],
    desired: Vec<Endpoint>,
    existing: Vec<Arc<EndpointSlice>>,
    max_per_slice: usize,
) -> SlicePlan {
    let max_per_slice = max_per_slice.max(1);
    let labels = slice_labels(service);
    let mut pending: BTreeMap<String, Endpoint> = desired
        .into_iter()
        .map(|ep| (endpoint_key(&ep).to_string(), ep))
        .collect();

    let mut existing = existing;
    existing.sort_by_key(|slice| age_order(slice));

    let mut plan = SlicePlan::default();
    let mut changed: Vec<Working> = Vec::new();
    let mut unchanged: Vec<Working> = Vec::new();

    for observed in existing {
        let mut desired = observed.as_ref().clone();
        let mut dirty = false;
        let mut kept = Vec::with_capacity(observed.endpoints.len());
        for endpoint in &observed.endpoints {
            match pending.remove(endpoint_key(endpoint)) {
                Some(wanted) => {
                    if wanted != *endpoint {
                        dirty = true;
                    }
                    kept.push(wanted);
                }
                None => dirty = true,
            }
        }
        if kept.is_empty() {
            plan.to_delete.push(observed);
            continue;
        }
        if kept.len() > max_per_slice {
            for overflow in kept.split_off(max_per_slice) {
                pending.insert(endpoint_key(&overflow).to_string(), overflow);
            }
            dirty = true;
        }
        if desired.metadata.labels.as_ref() != Some(&labels) {
            desired.metadata.labels = Some(labels.clone());
            dirty = true;
        }
        desired.endpoints = kept;
        let working = Working { observed, desired };
        if dirty {
            changed.push(working);
        } else {
            unchanged.push(working);
        }
    }

    let mut remaining = pending.into_values();

    for working in changed.iter_mut() {
        fill(&mut working.desired, &mut remaining, max_per_slice);
    }

    let mut remaining = remaining.peekable();
    while remaining.peek().is_some() {
        let Some(index) = most_under_full(&unchanged, max_per_slice) else {
            break;
        };
        let mut working = unchanged.remove(index);
        fill(&mut working.desired, &mut remaining, max_per_slice);
        changed.push(working);
    }

    let leftover: Vec<Endpoint> = remaining.collect();
    for chunk in leftover.chunks(max_per_slice) {
        plan.to_create
            .push(new_slice(service, address_type, ports, chunk.to_vec()));
    }

    for working in changed {
        let mut desired = working.desired;
        desired.endpoints.sort_by(|a, b| endpoint_key(a).cmp(endpoint_key(b)));
        plan.to_update.push((desired, working.observed));
    }
    plan
}

fn fill(
    slice: &mut EndpointSlice,
    remaining: &mut impl Iterator<Item = Endpoint>,
    max_per_slice: usize,
) {
    let room = max_per_slice.saturating_sub(slice.endpoints.len());
    slice.endpoints.extend(remaining.take(room));
}

/// The unchanged slice with the fewest endpoints that still has room; ties go
/// to the oldest, which comes first in `slices`.
fn most_under_full(slices: &[Working], max_per_slice: usize) -> Option<usize> {
    slices
        .iter()
        .enumerate()
        .filter(|(_, w)| w.desired.endpoints.len() < max_per_slice)
        .min_by_key(|(index, w)| (w.desired.endpoints.len(), *index))
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::discovery::v1::EndpointConditions;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::mock::fixtures;

    fn ep(ip: &str, ready: bool) -> Endpoint {
        Endpoint {
            addresses: vec![ip.to_string()],
            conditions: Some(EndpointConditions {
                ready: Some(ready),
                serving: Some(ready),
                terminating: Some(false),
            }),
            ..Default::default()
        }
    }

    fn existing(service: &Service, name: &str, age_secs: i64, ips: &[&str]) -> Arc<EndpointSlice> {
        let mut slice = new_slice(
            service,
            AddressType::IPv4,
            &[],
            ips.iter().map(|ip| ep(ip, true)).collect(),
        );
        slice.metadata.name = Some(name.to_string());
        slice.metadata.creation_timestamp = Some(Time(
            chrono::DateTime::from_timestamp(1_700_000_000 + age_secs, 0).unwrap(),
        ));
        Arc::new(slice)
    }

    fn svc() -> Service {
        fixtures::service("default", "svc", &[("app", "a")], &[])
    }

    fn sizes(plan: &SlicePlan) -> Vec<usize> {
        plan.to_create.iter().map(|s| s.endpoints.len()).collect()
    }

    #[test]
    fn creates_chunks_of_max() {
        let service = svc();
        let desired = (1..=5).map(|i| ep(&format!("10.0.0.{i}"), true)).collect();
        let plan = reconcile_port_mapping(&service, AddressType::IPv4, &[], desired, vec![], 2);

        assert_eq!(sizes(&plan), vec![2, 2, 1]);
        assert!(plan.to_update.is_empty());
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn unchanged_slices_produce_no_writes() {
        let service = svc();
        let current = existing(&service, "svc-1", 0, &["10.0.0.1", "10.0.0.2"]);
        let desired = vec![ep("10.0.0.1", true), ep("10.0.0.2", true)];
        let plan = reconcile_port_mapping(&service, AddressType::IPv4, &[], desired, vec![current], 100);
        assert!(plan.is_empty());
    }

    #[test]
    fn readiness_change_rewrites_only_its_slice() {
        let service = svc();
        let a = existing(&service, "svc-a", 0, &["10.0.0.1", "10.0.0.2"]);
        let b = existing(&service, "svc-b", 1, &["10.0.0.3", "10.0.0.4"]);
        let desired = vec![
            ep("10.0.0.1", true),
            ep("10.0.0.2", true),
            ep("10.0.0.3", false),
            ep("10.0.0.4", true),
        ];
        let plan = reconcile_port_mapping(&service, AddressType::IPv4, &[], desired, vec![a, b], 2);

        assert!(plan.to_create.is_empty());
        assert!(plan.to_delete.is_empty());
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].1.metadata.name.as_deref(), Some("svc-b"));
    }

    #[test]
    fn removed_endpoints_shrink_in_place_and_empty_slices_go() {
        let service = svc();
        let a = existing(&service, "svc-a", 0, &["10.0.0.1", "10.0.0.2"]);
        let b = existing(&service, "svc-b", 1, &["10.0.0.3"]);
        let desired = vec![ep("10.0.0.1", true)];
        let plan = reconcile_port_mapping(&service, AddressType::IPv4, &[], desired, vec![a, b], 100);

        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].0.endpoints.len(), 1);
        assert_eq!(plan.to_delete.len(), 1);
        assert_eq!(plan.to_delete[0].metadata.name.as_deref(), Some("svc-b"));
    }

    #[test]
    fn new_endpoints_fill_most_under_full_oldest_first() {
        let service = svc();
        let old_half = existing(&service, "svc-old", 0, &["10.0.0.1", "10.0.0.2"]);
        let young_small = existing(&service, "svc-young", 5, &["10.0.0.3"]);
        let old_small = existing(&service, "svc-older", 1, &["10.0.0.4"]);
        let desired = vec![
            ep("10.0.0.1", true),
            ep("10.0.0.2", true),
            ep("10.0.0.3", true),
            ep("10.0.0.4", true),
            ep("10.0.0.5", true),
        ];
        let plan = reconcile_port_mapping(
            &service,
            AddressType::IPv4,
            &[],
            desired,
            vec![old_half, young_small, old_small],
            4,
        );

        assert!(plan.to_create.is_empty());
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].1.metadata.name.as_deref(), Some("svc-older"));
        assert_eq!(plan.to_update[0].0.endpoints.len(), 2);
    }

    #[test]
    fn duplicates_across_slices_are_removed() {
        let service = svc();
        let a = existing(&service, "svc-a", 0, &["10.0.0.1"]);
        let b = existing(&service, "svc-b", 1, &["10.0.0.1", "10.0.0.2"]);
        let desired = vec![ep("10.0.0.1", true), ep("10.0.0.2", true)];
        let plan = reconcile_port_mapping(&service, AddressType::IPv4, &[], desired, vec![a, b], 100);

        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].1.metadata.name.as_deref(), Some("svc-b"));
        assert_eq!(plan.to_update[0].0.endpoints.len(), 1);
    }

    #[test]
    fn creates_reuse_slices_pending_deletion() {
        let service = svc();
        let mut plan = SlicePlan {
            to_create: vec![new_slice(&service, AddressType::IPv4, &[], vec![ep("10.0.0.9", true)])],
            to_update: vec![],
            to_delete: vec![existing(&service, "svc-gone", 0, &["10.0.0.1"])],
        };
        plan.reuse_deleted();

        assert!(plan.to_create.is_empty());
        assert!(plan.to_delete.is_empty());
        assert_eq!(plan.to_update[0].0.metadata.name.as_deref(), Some("svc-gone"));
    }

    #[test]
    fn slices_above_the_cap_are_split() {
        let service = svc();
        let oversized = existing(&service, "svc-big", 0, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let desired = vec![ep("10.0.0.1", true), ep("10.0.0.2", true), ep("10.0.0.3", true)];
        let plan =
            reconcile_port_mapping(&service, AddressType::IPv4, &[], desired, vec![oversized], 2);

        assert!(!plan.is_empty());
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].1.metadata.name.as_deref(), Some("svc-big"));
        assert_eq!(plan.to_update[0].0.endpoints.len(), 2);
        assert_eq!(sizes(&plan), vec![1]);
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn reuse_pairs_creates_by_address_type() {
        let service = svc();
        let v6 = new_slice(&service, AddressType::IPv6, &[], vec![ep("fd00::9", true)]);
        let v4 = new_slice(&service, AddressType::IPv4, &[], vec![ep("10.0.0.9", true)]);
        let mut plan = SlicePlan {
            to_create: vec![v6, v4],
            to_update: vec![],
            to_delete: vec![existing(&service, "svc-gone", 0, &["10.0.0.1"])],
        };
        plan.reuse_deleted();

        assert!(plan.to_delete.is_empty());
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].0.metadata.name.as_deref(), Some("svc-gone"));
        assert_eq!(plan.to_update[0].0.address_type, "IPv4");
        assert_eq!(plan.to_create.len(), 1);
        assert_eq!(plan.to_create[0].address_type, "IPv6");
    }
}
