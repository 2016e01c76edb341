use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use error_stack::Report;
use k8s_openapi::api::core::v1::Service;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::services::Informers;
use crate::config::MetricsFormat;
use crate::domain::change::Change;
use crate::domain::change::Watched;
use crate::domain::controller::Controller;
use crate::domain::controller::Reconciler;
use crate::domain::keys::ServiceKey;
use crate::domain::queue::WorkQueue;
use crate::domain::translator::Dispatcher;
use crate::infrastructure::cache::Caches;
use crate::infrastructure::cache::ObjectCache;
use crate::infrastructure::informer::Informer;
use crate::infrastructure::kube_client::KubernetesError;
use crate::infrastructure::metrics;
use crate::infrastructure::metrics::ControllerMetrics;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn spawn_informers(&mut self, informers: &Informers, changes: &mpsc::Sender<Change>) {
        self.spawn_informer(&informers.services, changes);
        self.spawn_informer(&informers.pods, changes);
        self.spawn_informer(&informers.nodes, changes);
        self.spawn_informer(&informers.endpoints, changes);
        self.spawn_informer(&informers.slices, changes);
    }

    fn spawn_informer<K>(&mut self, informer: &Arc<Informer<K>>, changes: &mpsc::Sender<Change>)
    where
        K: Watched + DeserializeOwned,
    {
        let informer = Arc::clone(informer);
        let changes = changes.clone();
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting {} informer task", K::KIND);
            informer.run(changes, token).await;
            tracing::info!("{} informer task completed", K::KIND);
        }));
    }

    pub fn spawn_dispatcher(&mut self, dispatcher: Dispatcher, changes: mpsc::Receiver<Change>) {
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            dispatcher.run(changes, token).await;
        }));
    }

    /// Waits until every informer has completed its first list.
    pub async fn wait_for_cache_sync(
        &self,
        caches: &Caches,
        timeout: Duration,
    ) -> Result<(), Report<KubernetesError>> {
        tracing::info!("Waiting for caches to sync");
        tokio::time::timeout(timeout, caches.wait_synced())
            .await
            .map_err(|_| {
                Report::new(KubernetesError::CacheSyncTimeout {
                    seconds: timeout.as_secs(),
                })
            })?;
        tracing::info!("Caches synced");
        Ok(())
    }

    pub fn spawn_controller<R: Reconciler>(&mut self, controller: Controller<R>, workers: usize) {
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            controller.run(workers, token).await;
        }));
    }

    /// Periodically enqueues every known Service into every queue.
    pub fn spawn_resync(
        &mut self,
        services: ObjectCache<Service>,
        queues: impl IntoIterator<Item = Arc<WorkQueue<ServiceKey>>>,
        interval: Duration,
    ) {
        let queues: Vec<_> = queues.into_iter().collect();
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            tracing::info!(?interval, "Starting resync task");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the initial sync already
            // covers every Service.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let count = resync_all(&services, &queues);
                        tracing::debug!(services = count, "Resync enqueued services");
                    }
                }
            }
            tracing::info!("Resync task completed");
        }));
    }

    pub fn spawn_metrics(
        &mut self,
        controllers: Vec<Arc<ControllerMetrics>>,
        format: MetricsFormat,
        interval: Duration,
    ) {
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting metrics task");
            metrics::run_metrics(controllers, format, interval, token).await;
            tracing::info!("Metrics task completed");
        }));
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                    }
                })
            }
        };

        let outcome = tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                Ok(())
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                match result {
                    Err(e) => {
                        tracing::error!("Task completed with error: {e}");
                        Err(e)
                    }
                    Ok(()) => {
                        tracing::warn!("Task completed unexpectedly");
                        Ok(())
                    }
                }
            }
        };

        self.shutdown().await;
        outcome.map_err(Into::into)
    }

    /// Cancels every task and waits for them to finish.
    pub async fn shutdown(&mut self) {
        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if task.is_finished() {
                    continue;
                }
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}

/// Enqueues every cached Service into each queue. Returns the number of
/// Services.
pub fn resync_all(services: &ObjectCache<Service>, queues: &[Arc<WorkQueue<ServiceKey>>]) -> usize {
    let all = services.list_all();
    for service in &all {
        let key = ServiceKey::from_object(service.as_ref());
        for queue in queues {
            queue.add(key.clone());
        }
    }
    all.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::queue::ItemExponentialBackoff;
    use crate::infrastructure::cache::new_caches;
    use crate::mock::fixtures;

    fn queue(name: &'static str) -> Arc<WorkQueue<ServiceKey>> {
        WorkQueue::new(
            name,
            ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn resync_enqueues_every_service_once_per_queue() {
        let (writers, caches) = new_caches();
        writers
            .services
            .apply(fixtures::service("default", "web", &[("app", "web")], &[80]));
        writers
            .services
            .apply(fixtures::service("shop", "cart", &[("app", "cart")], &[8080]));
        let queues = [queue("endpoints"), queue("endpointslice")];

        assert_eq!(resync_all(&caches.services, &queues), 2);
        assert_eq!(resync_all(&caches.services, &queues), 2);
        for queue in &queues {
            assert_eq!(queue.len(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_sync_times_out() {
        let (_writers, caches) = new_caches();
        let tasks = Tasks::new();
        let err = tasks
            .wait_for_cache_sync(&caches, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            KubernetesError::CacheSyncTimeout { seconds: 3 }
        ));
    }

    #[tokio::test]
    async fn cache_sync_resolves_once_every_cache_listed() {
        let (writers, caches) = new_caches();
        writers.services.mark_synced();
        writers.pods.mark_synced();
        writers.nodes.mark_synced();
        writers.endpoints.mark_synced();
        writers.slices.mark_synced();
        Tasks::new()
            .wait_for_cache_sync(&caches, Duration::from_secs(1))
            .await
            .unwrap();
    }
}
