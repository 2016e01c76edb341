//! Worker pool driving one reconciler from its work queue.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::keys::ServiceKey;
use crate::domain::queue::WorkQueue;
use crate::domain::write::WriteError;
use crate::infrastructure::metrics::ControllerMetrics;

/// Failure classes of one reconciliation; each maps to a requeue policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum ReconcileError {
    #[display("write conflicted with a concurrent change")]
    Conflict,
    #[display("cache is older than the last write")]
    StaleCache,
    #[display("transient failure")]
    Transient,
    #[display("structurally invalid input")]
    Structural,
}

impl std::error::Error for ReconcileError {}

impl ReconcileError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileError::Conflict => "conflict",
            ReconcileError::StaleCache => "stale_cache",
            ReconcileError::Transient => "transient",
            ReconcileError::Structural => "structural",
        }
    }
}

impl From<WriteError> for ReconcileError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Conflict => ReconcileError::Conflict,
            WriteError::Retryable => ReconcileError::Transient,
            WriteError::Rejected => ReconcileError::Structural,
        }
    }
}

/// Converts a failed write into a reconcile failure of the matching class.
pub fn write_failed(report: Report<WriteError>) -> Report<ReconcileError> {
    let class = ReconcileError::from(*report.current_context());
    report.change_context(class)
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Converges the objects of one Service. Must be idempotent.
    async fn reconcile(&self, key: &ServiceKey) -> Result<(), Report<ReconcileError>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Minimum delay before a structurally broken key is tried again.
    pub structural_retry_delay: Duration,
    /// Failures are logged at error level once a key was requeued this often.
    pub escalate_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            structural_retry_delay: Duration::from_secs(60),
            escalate_after: 15,
        }
    }
}

pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ServiceKey>>,
    policy: RetryPolicy,
    metrics: Arc<ControllerMetrics>,
}

impl<R> Clone for Controller<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
            policy: self.policy,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: Arc<R>,
        queue: Arc<WorkQueue<ServiceKey>>,
        policy: RetryPolicy,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            reconciler,
            queue,
            policy,
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ServiceKey>> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    /// Runs `workers` loops until cancelled, then drains in-flight keys.
    #[tracing::instrument(skip_all, fields(controller = self.reconciler.name()))]
    pub async fn run(&self, workers: usize, cancellation_token: CancellationToken) {
        info!(workers, "Starting workers");
        let handles: Vec<_> = (0..workers.max(1))
            .map(|worker| {
                let this = self.clone();
                tokio::spawn(async move {
                    while this.process_next().await {}
                    debug!(controller = this.reconciler.name(), worker, "Worker stopped");
                })
            })
            .collect();

        cancellation_token.cancelled().await;
        info!("Shutting down, draining in-flight keys");
        self.queue.shut_down_with_drain().await;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("All workers stopped");
    }

    /// Handles one key. Returns false once the queue has shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let started = Instant::now();
        let result = self.reconciler.reconcile(&key).await;
        self.handle_result(&key, result, started.elapsed());
        self.queue.done(&key);
        true
    }

    fn handle_result(
        &self,
        key: &ServiceKey,
        result: Result<(), Report<ReconcileError>>,
        elapsed: Duration,
    ) {
        let name = self.reconciler.name();
        let report = match result {
            Ok(()) => {
                self.metrics.record_sync("success", elapsed);
                self.queue.forget(key);
                debug!(controller = name, service = %key, ?elapsed, "Synced service");
                return;
            }
            Err(report) => report,
        };

        let class = *report.current_context();
        self.metrics.record_sync(class.as_str(), elapsed);
        let requeues = self.queue.num_requeues(key);

        match class {
            ReconcileError::Conflict => {
                self.queue.add_after(key.clone(), self.queue.base_delay());
            }
            ReconcileError::StaleCache | ReconcileError::Transient => {
                self.queue.add_rate_limited(key.clone());
            }
            ReconcileError::Structural => {
                self.queue
                    .add_rate_limited_at_least(key.clone(), self.policy.structural_retry_delay);
            }
        }

        if class == ReconcileError::Conflict || class == ReconcileError::StaleCache {
            debug!(controller = name, service = %key, error = ?report, "Requeueing service");
        } else if requeues >= self.policy.escalate_after {
            error!(controller = name, service = %key, requeues, error = ?report, "Service keeps failing to sync");
        } else {
            warn!(controller = name, service = %key, requeues, error = ?report, "Failed to sync service, requeueing");
        }
    }
}
