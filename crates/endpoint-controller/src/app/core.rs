use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::ControllerConfig;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    config: ControllerConfig,
}

impl Application {
    pub fn new(services: ApplicationServices, config: ControllerConfig) -> Self {
        Self { services, config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Runs until a shutdown signal arrives or a task stops unexpectedly.
    ///
    /// Workers only start once every cache has synced, so no reconciliation
    /// ever sees a partial view of the cluster.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting all application tasks...");
        let Application { services, config } = self;
        let ApplicationServices {
            caches,
            informers,
            changes_tx,
            changes_rx,
            dispatcher,
            endpoints_controller,
            slices_controller,
        } = services;

        let mut tasks = Tasks::new();
        tasks.spawn_informers(&informers, &changes_tx);
        drop(changes_tx);
        tasks.spawn_dispatcher(dispatcher, changes_rx);

        if let Err(e) = tasks
            .wait_for_cache_sync(&caches, config.cache_sync_timeout())
            .await
        {
            tracing::error!("Cache sync failed: {e:?}");
            tasks.shutdown().await;
            return Err(anyhow::anyhow!("Cache sync failed: {e:?}"));
        }

        let queues = [
            endpoints_controller.queue().clone(),
            slices_controller.queue().clone(),
        ];
        let metrics = vec![
            endpoints_controller.metrics().clone(),
            slices_controller.metrics().clone(),
        ];
        tasks.spawn_controller(endpoints_controller, config.endpoint_workers);
        tasks.spawn_controller(slices_controller, config.endpointslice_workers);
        tasks.spawn_resync(caches.services.clone(), queues, config.resync_interval());
        tasks.spawn_metrics(metrics, config.metrics_format, config.metrics_interval());

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }
}
