use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::MetricsFormat;
use crate::domain::keys::ServiceKey;

pub mod encoders;
use encoders::create_encoder;
use encoders::MetricsEncoder as _;
use encoders::ServiceMetricsParams;
use encoders::SyncMetricsParams;
use encoders::WriteMetricsParams;

#[derive(Debug, Default, Clone, Copy)]
struct SyncCounter {
    count: u64,
    seconds_total: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct DesiredGauge {
    endpoints: u64,
    objects: u64,
}

/// Counters of one controller, flushed periodically to the metrics target.
pub struct ControllerMetrics {
    controller: &'static str,
    syncs: DashMap<&'static str, SyncCounter>,
    writes: DashMap<&'static str, u64>,
    desired: DashMap<ServiceKey, DesiredGauge>,
}

impl ControllerMetrics {
    pub fn new(controller: &'static str) -> Self {
        Self {
            controller,
            syncs: DashMap::new(),
            writes: DashMap::new(),
            desired: DashMap::new(),
        }
    }

    pub fn controller(&self) -> &'static str {
        self.controller
    }

    pub fn record_sync(&self, result: &'static str, elapsed: Duration) {
        let mut counter = self.syncs.entry(result).or_default();
        counter.count += 1;
        counter.seconds_total += elapsed.as_secs_f64();
    }

    pub fn record_write(&self, operation: &'static str) {
        *self.writes.entry(operation).or_default() += 1;
    }

    /// Size of the desired state of a Service: endpoints and objects (1 for
    /// Endpoints, the number of slices for EndpointSlices).
    pub fn set_desired(&self, service: &ServiceKey, endpoints: usize, objects: usize) {
        self.desired.insert(
            service.clone(),
            DesiredGauge {
                endpoints: endpoints as u64,
                objects: objects as u64,
            },
        );
    }

    pub fn forget_service(&self, service: &ServiceKey) {
        self.desired.remove(service);
    }

    pub fn syncs(&self, result: &str) -> u64 {
        self.syncs.get(result).map(|c| c.count).unwrap_or(0)
    }

    pub fn writes(&self, operation: &str) -> u64 {
        self.writes.get(operation).map(|c| *c).unwrap_or(0)
    }

    /// Encodes every counter as one line per point, sorted for stable output.
    pub fn encode(&self, encoder: &encoders::Encoder, timestamp: i64) -> Vec<String> {
        let mut lines = Vec::new();

        let mut syncs: Vec<(&'static str, SyncCounter)> =
            self.syncs.iter().map(|e| (*e.key(), *e.value())).collect();
        syncs.sort_by_key(|(result, _)| *result);
        for (result, counter) in syncs {
            lines.push(encoder.encode_sync_metrics(&SyncMetricsParams {
                controller: self.controller,
                result,
                count: counter.count,
                seconds_total: counter.seconds_total,
                timestamp,
            }));
        }

        let mut writes: Vec<(&'static str, u64)> =
            self.writes.iter().map(|e| (*e.key(), *e.value())).collect();
        writes.sort_by_key(|(operation, _)| *operation);
        for (operation, count) in writes {
            lines.push(encoder.encode_write_metrics(&WriteMetricsParams {
                controller: self.controller,
                operation,
                count,
                timestamp,
            }));
        }

        let mut desired: Vec<(ServiceKey, DesiredGauge)> = self
            .desired
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        desired.sort_by(|a, b| a.0.cmp(&b.0));
        for (service, gauge) in desired {
            lines.push(encoder.encode_service_metrics(&ServiceMetricsParams {
                controller: self.controller,
                namespace: &service.namespace,
                service: &service.name,
                endpoints: gauge.endpoints,
                objects: gauge.objects,
                timestamp,
            }));
        }
        lines
    }
}

/// Periodically writes every controller's counters to the `metrics` target.
#[tracing::instrument(skip_all, fields(format = ?format))]
pub(crate) async fn run_metrics(
    controllers: Vec<Arc<ControllerMetrics>>,
    format: MetricsFormat,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let encoder = create_encoder(format);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                tracing::info!("Metrics flusher shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let timestamp = current_time();
                for metrics in &controllers {
                    for line in metrics.encode(&encoder, timestamp) {
                        tracing::info!(target: "metrics", msg = %line.trim_end());
                    }
                }
            }
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
