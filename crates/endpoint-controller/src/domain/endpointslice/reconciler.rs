use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::Endpoint;
use k8s_openapi::api::discovery::v1::EndpointPort;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;

use super::builder;
use super::builder::PortKey;
use super::packing::reconcile_port_mapping;
use super::packing::SlicePlan;
use super::topology;
use super::topology::HintsOutcome;
use crate::domain::controller::write_failed;
use crate::domain::controller::ReconcileError;
use crate::domain::controller::Reconciler;
use crate::domain::keys::ServiceKey;
use crate::domain::pod;
use crate::domain::selector::Selector;
use crate::domain::service;
use crate::domain::service::AddressType;
use crate::domain::service::LABEL_SERVICE_NAME;
use crate::domain::tracker::EndpointSliceTracker;
use crate::domain::write::WriteCoordinator;
use crate::domain::write::WriteOp;
use crate::infrastructure::cache::Caches;
use crate::infrastructure::metrics::ControllerMetrics;

#[derive(Debug, Clone, Copy)]
pub struct EndpointSliceSettings {
    pub max_endpoints_per_slice: usize,
    pub topology_aware_routing: bool,
}

/// Maintains the EndpointSlices of every Service.
pub struct EndpointSliceReconciler {
    caches: Caches,
    writer: WriteCoordinator<EndpointSlice>,
    tracker: Arc<EndpointSliceTracker>,
    metrics: Arc<ControllerMetrics>,
    settings: EndpointSliceSettings,
}

/// Desired endpoints of one address type, grouped by resolved ports.
type PortGroups = BTreeMap<PortKey, (Vec<EndpointPort>, Vec<Endpoint>)>;

#[derive(Debug, Default)]
struct WriteSummary {
    created: usize,
    updated: usize,
    deleted: usize,
    worst: Option<Report<ReconcileError>>,
}

impl WriteSummary {
    fn failed(&mut self, report: Report<ReconcileError>) {
        let worse = match &self.worst {
            Some(current) => report.current_context() > current.current_context(),
            None => true,
        };
        if worse {
            self.worst = Some(report);
        }
    }
}

impl EndpointSliceReconciler {
    pub fn new(
        caches: Caches,
        writer: WriteCoordinator<EndpointSlice>,
        tracker: Arc<EndpointSliceTracker>,
        metrics: Arc<ControllerMetrics>,
        settings: EndpointSliceSettings,
    ) -> Self {
        Self {
            caches,
            writer,
            tracker,
            metrics,
            settings,
        }
    }

    /// Slices in the cache that belong to the Service, minus those already
    /// being deleted.
    fn owned_slices(&self, key: &ServiceKey) -> Vec<Arc<EndpointSlice>> {
        let selector = Selector::from_pairs([(LABEL_SERVICE_NAME, key.name.as_str())]);
        self.caches
            .slices
            .list_by_selector(&key.namespace, &selector)
            .into_iter()
            .filter(|slice| slice.metadata.deletion_timestamp.is_none())
            .collect()
    }

    async fn delete_all(&self, key: &ServiceKey) -> Result<(), Report<ReconcileError>> {
        self.tracker.delete_service(key);
        self.metrics.forget_service(key);
        let plan = SlicePlan {
            to_delete: self.owned_slices(key),
            ..Default::default()
        };
        if plan.is_empty() {
            return Ok(());
        }
        info!(service = %key, slices = plan.to_delete.len(), "Service deleted, removing its slices");
        self.apply(key, plan).await
    }

    /// Builds the desired endpoints of one address type. Pods on Nodes missing
    /// from the cache are skipped and reported in `missing_nodes`.
    fn desired_groups(
        &self,
        service: &Service,
        pods: &[Arc<k8s_openapi::api::core::v1::Pod>],
        address_type: AddressType,
        missing_nodes: &mut BTreeSet<String>,
    ) -> PortGroups {
        let mut groups = PortGroups::new();
        for pod in pods {
            if !builder::is_slice_candidate(pod) {
                continue;
            }
            let node = match pod::node_name(pod) {
                Some(name) => match self.caches.nodes.get("", name) {
                    Some(node) => Some(node),
                    None => {
                        missing_nodes.insert(name.to_string());
                        continue;
                    }
                },
                None => None,
            };
            let Some(endpoint) =
                builder::build_endpoint(service, pod, node.as_deref(), address_type)
            else {
                continue;
            };
            let ports = builder::endpoint_ports(service, pod);
            groups
                .entry(PortKey::of(&ports))
                .or_insert_with(|| (ports, Vec::new()))
                .1
                .push(endpoint);
        }
        for (_, endpoints) in groups.values_mut() {
            endpoints.sort_by(|a, b| builder::endpoint_key(a).cmp(builder::endpoint_key(b)));
            endpoints.dedup_by(|a, b| builder::endpoint_key(a) == builder::endpoint_key(b));
        }
        groups
    }

    fn plan_address_type(
        &self,
        service: &Service,
        address_type: AddressType,
        mut groups: PortGroups,
        existing: Vec<Arc<EndpointSlice>>,
    ) -> SlicePlan {
        let existing_count = existing.len();
        let mut existing_groups: BTreeMap<PortKey, Vec<Arc<EndpointSlice>>> = BTreeMap::new();
        for slice in existing {
            existing_groups
                .entry(PortKey::of_slice(&slice))
                .or_default()
                .push(slice);
        }

        let keys: BTreeSet<PortKey> = groups
            .keys()
            .chain(existing_groups.keys())
            .cloned()
            .collect();
        let mut plan = SlicePlan::default();
        for key in keys {
            let (ports, endpoints) = groups.remove(&key).unwrap_or_default();
            plan.extend(reconcile_port_mapping(
                service,
                address_type,
                &ports,
                endpoints,
                existing_groups.remove(&key).unwrap_or_default(),
                self.settings.max_endpoints_per_slice,
            ));
        }

        if plan.to_delete.len() == existing_count && plan.to_create.is_empty() {
            if !service::has_ports(service) {
                return plan;
            }
            let placeholder = builder::placeholder_slice(service, address_type);
            if plan.to_delete.len() == 1
                && builder::is_equivalent_placeholder(&plan.to_delete[0], &placeholder)
            {
                plan.to_delete.clear();
            } else {
                plan.to_create.push(placeholder);
            }
        }
        plan
    }

    async fn apply(&self, key: &ServiceKey, plan: SlicePlan) -> Result<(), Report<ReconcileError>> {
        let mut summary = WriteSummary::default();
        let ops = plan
            .to_create
            .into_iter()
            .map(WriteOp::Create)
            .chain(
                plan.to_update
                    .into_iter()
                    .map(|(desired, observed)| WriteOp::Update { desired, observed }),
            )
            .chain(plan.to_delete.into_iter().map(WriteOp::Delete));

        for op in ops {
            let verb = op.verb();
            match self.writer.apply(op).await {
                Ok(outcome) if outcome.is_write() => {
                    self.metrics.record_write(verb);
                    match verb {
                        "create" => summary.created += 1,
                        "update" => summary.updated += 1,
                        _ => summary.deleted += 1,
                    }
                }
                Ok(_) => {}
                Err(report) => summary.failed(write_failed(report)),
            }
        }

        if summary.created + summary.updated + summary.deleted > 0 {
            info!(
                service = %key,
                slices_created = summary.created,
                slices_updated = summary.updated,
                slices_deleted = summary.deleted,
                "Reconciled endpoint slices"
            );
        }
        match summary.worst {
            Some(report) => Err(report),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Reconciler for EndpointSliceReconciler {
    fn name(&self) -> &'static str {
        "endpointslice"
    }

    #[tracing::instrument(skip(self), fields(controller = "endpointslice"))]
    async fn reconcile(&self, key: &ServiceKey) -> Result<(), Report<ReconcileError>> {
        let Some(service) = self.caches.services.get(&key.namespace, &key.name) else {
            return self.delete_all(key).await;
        };
        if !service::is_managed(&service) {
            debug!(service = %key, "Service has no selector or is being deleted, skipping");
            return Ok(());
        }
        let Some(raw_selector) = service::selector(&service) else {
            return Ok(());
        };
        let selector = Selector::from_map(raw_selector)
            .change_context(ReconcileError::Structural)
            .attach_printable_lazy(|| format!("selector of service {key}"))?;

        let owned = self.owned_slices(key);
        if self.tracker.stale_slices(key, &owned) {
            return Err(Report::new(ReconcileError::StaleCache)
                .attach_printable(format!("endpoint slice cache for {key} is out of date")));
        }

        let pods = self.caches.pods.list_by_selector(&key.namespace, &selector);
        let address_types = service::address_types(&service);
        let hints_wanted =
            self.settings.topology_aware_routing && service::wants_topology_hints(&service);
        let zone_ratios = if hints_wanted {
            topology::zone_cpu_ratios(&self.caches.nodes.list_all())
        } else {
            None
        };

        let mut plan = SlicePlan::default();
        let mut by_type: BTreeMap<AddressType, Vec<Arc<EndpointSlice>>> = BTreeMap::new();
        for slice in owned.iter().cloned() {
            match AddressType::parse(&slice.address_type) {
                Some(t) if address_types.contains(&t) && builder::owned_by(&slice, &service) => {
                    by_type.entry(t).or_default().push(slice)
                }
                _ => plan.to_delete.push(slice),
            }
        }

        let mut missing_nodes = BTreeSet::new();
        let mut desired_endpoints = 0;
        for address_type in &address_types {
            let mut groups =
                self.desired_groups(&service, &pods, *address_type, &mut missing_nodes);
            let mut endpoints: Vec<&mut Endpoint> = groups
                .values_mut()
                .flat_map(|(_, endpoints)| endpoints.iter_mut())
                .collect();
            desired_endpoints += endpoints.len();
            if hints_wanted {
                if let HintsOutcome::Removed(reason) =
                    topology::add_hints(&mut endpoints, zone_ratios.as_ref())
                {
                    debug!(service = %key, address_type = %address_type, reason, "Topology hints removed");
                }
            } else {
                topology::remove_hints(&mut endpoints);
            }
            drop(endpoints);

            let existing = by_type.remove(address_type).unwrap_or_default();
            plan.extend(self.plan_address_type(&service, *address_type, groups, existing));
        }
        plan.reuse_deleted();

        let desired_slices = owned.len() - plan.to_delete.len() + plan.to_create.len();
        self.metrics.set_desired(key, desired_endpoints, desired_slices);

        self.apply(key, plan).await?;

        if !missing_nodes.is_empty() {
            return Err(Report::new(ReconcileError::Transient).attach_printable(format!(
                "skipped pods of {key} on nodes missing from cache: {}",
                missing_nodes.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(())
    }
}
