use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;
use tracing::info;

use super::subsets::compute_subsets;
use super::subsets::DesiredSubsets;
use crate::domain::controller::write_failed;
use crate::domain::controller::ReconcileError;
use crate::domain::controller::Reconciler;
use crate::domain::keys::ServiceKey;
use crate::domain::selector::Selector;
use crate::domain::service;
use crate::domain::service::ANNOTATION_OVER_CAPACITY;
use crate::domain::tracker::StaleEndpointsTracker;
use crate::domain::write::SemanticEq;
use crate::domain::write::WriteCoordinator;
use crate::domain::write::WriteOp;
use crate::domain::write::WriteOutcome;
use crate::infrastructure::cache::Caches;
use crate::infrastructure::metrics::ControllerMetrics;

const TRUNCATED: &str = "truncated";

#[derive(Debug, Clone, Copy)]
pub struct EndpointsSettings {
    pub max_endpoints_capacity: usize,
}

/// Maintains the aggregated Endpoints object of every Service.
pub struct EndpointsReconciler {
    caches: Caches,
    writer: WriteCoordinator<Endpoints>,
    tracker: Arc<StaleEndpointsTracker>,
    metrics: Arc<ControllerMetrics>,
    settings: EndpointsSettings,
}

impl EndpointsReconciler {
    pub fn new(
        caches: Caches,
        writer: WriteCoordinator<Endpoints>,
        tracker: Arc<StaleEndpointsTracker>,
        metrics: Arc<ControllerMetrics>,
        settings: EndpointsSettings,
    ) -> Self {
        Self {
            caches,
            writer,
            tracker,
            metrics,
            settings,
        }
    }

    async fn delete(&self, key: &ServiceKey) -> Result<(), Report<ReconcileError>> {
        self.tracker.delete(key);
        self.metrics.forget_service(key);
        let Some(current) = self.caches.endpoints.get(&key.namespace, &key.name) else {
            return Ok(());
        };
        let outcome = self
            .writer
            .apply(WriteOp::Delete(current))
            .await
            .map_err(write_failed)?;
        if outcome.is_write() {
            self.metrics.record_write("delete");
            info!(service = %key, "Service deleted, removed its endpoints");
        }
        Ok(())
    }
}

/// The desired object, keeping the observed metadata so the update carries
/// its resource version and any foreign annotations.
fn desired_endpoints(
    service: &Service,
    key: &ServiceKey,
    observed: Option<&Endpoints>,
    desired: DesiredSubsets,
) -> Endpoints {
    let mut metadata = observed.map(|e| e.metadata.clone()).unwrap_or_else(|| ObjectMeta {
        namespace: Some(key.namespace.clone()),
        name: Some(key.name.clone()),
        ..Default::default()
    });

    let labels = service::membership_labels(service);
    metadata.labels = (!labels.is_empty()).then_some(labels);

    let mut annotations: BTreeMap<String, String> = metadata.annotations.take().unwrap_or_default();
    annotations.remove(ANNOTATION_OVER_CAPACITY);
    if desired.truncated {
        annotations.insert(ANNOTATION_OVER_CAPACITY.to_string(), TRUNCATED.to_string());
    }
    metadata.annotations = (!annotations.is_empty()).then_some(annotations);

    Endpoints {
        metadata,
        subsets: (!desired.subsets.is_empty()).then_some(desired.subsets),
    }
}

fn over_capacity(endpoints: &Endpoints) -> Option<&str> {
    endpoints
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_OVER_CAPACITY))
        .map(String::as_str)
}

impl SemanticEq for Endpoints {
    fn semantically_eq(&self, other: &Self) -> bool {
        self.subsets.as_deref().unwrap_or_default() == other.subsets.as_deref().unwrap_or_default()
            && self.metadata.labels.clone().unwrap_or_default()
                == other.metadata.labels.clone().unwrap_or_default()
            && over_capacity(self) == over_capacity(other)
    }
}

#[async_trait]
impl Reconciler for EndpointsReconciler {
    fn name(&self) -> &'static str {
        "endpoints"
    }

    #[tracing::instrument(skip(self), fields(controller = "endpoints"))]
    async fn reconcile(&self, key: &ServiceKey) -> Result<(), Report<ReconcileError>> {
        let Some(service) = self.caches.services.get(&key.namespace, &key.name) else {
            return self.delete(key).await;
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

        let observed = self.caches.endpoints.get(&key.namespace, &key.name);
        if let Some(observed) = observed.as_deref() {
            if self.tracker.is_stale(observed) {
                return Err(Report::new(ReconcileError::StaleCache)
                    .attach_printable(format!("endpoints cache for {key} is out of date")));
            }
        }

        let pods = self.caches.pods.list_by_selector(&key.namespace, &selector);
        let desired = compute_subsets(
            &service,
            pods.iter().map(|pod| pod.as_ref()),
            self.settings.max_endpoints_capacity,
        );
        let (addresses, truncated) = (desired.addresses, desired.truncated);
        self.metrics.set_desired(key, addresses, 1);
        if truncated {
            info!(service = %key, addresses, "Endpoints over capacity, truncated");
        }

        let op = match observed {
            None => WriteOp::Create(desired_endpoints(&service, key, None, desired)),
            Some(observed) => WriteOp::Update {
                desired: desired_endpoints(&service, key, Some(observed.as_ref()), desired),
                observed,
            },
        };
        let verb = op.verb();
        let outcome = self.writer.apply(op).await.map_err(write_failed)?;
        if outcome.is_write() {
            self.metrics.record_write(verb);
            info!(service = %key, operation = verb, addresses, "Reconciled endpoints");
        } else if matches!(outcome, WriteOutcome::AlreadyConverged) {
            // Removed behind our back; the delete event brings the key back.
            debug!(service = %key, "Endpoints vanished before update");
        }
        Ok(())
    }
}
