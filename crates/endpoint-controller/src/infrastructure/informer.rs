//! Watch loops feeding the caches and the change channel.

use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::Api;
use serde::de::DeserializeOwned;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::change::Change;
use crate::domain::change::Watched;
use crate::infrastructure::cache::CacheWriter;
use crate::infrastructure::cache::WatchEvent;
use crate::infrastructure::kube_client::KubernetesError;

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// The change channel was closed; nobody consumes changes anymore.
#[derive(Debug)]
pub(crate) struct ChannelClosed;

/// Watches one kind and is the only writer of its cache.
pub struct Informer<K: Watched> {
    api: Api<K>,
    label_selector: Option<String>,
    cache: CacheWriter<K>,
}

impl<K> Informer<K>
where
    K: Watched + DeserializeOwned,
{
    pub fn new(api: Api<K>, cache: CacheWriter<K>) -> Self {
        Self {
            api,
            label_selector: None,
            cache,
        }
    }

    /// Restricts the watch to objects matching a label selector.
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Watches until cancelled. A failed or finished stream is restarted, the
    /// fresh relist reconciling the cache with what was missed.
    #[tracing::instrument(skip_all, fields(kind = K::KIND))]
    pub async fn run(&self, changes: mpsc::Sender<Change>, cancellation_token: CancellationToken) {
        info!("Starting informer");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Informer shutdown requested");
                    break;
                }
                result = self.watch(&changes) => {
                    match result {
                        Ok(()) => warn!("Watch stream ended unexpectedly, restarting..."),
                        Err(e) => {
                            error!("Watch failed: {e:?}");
                            select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(RESTART_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn watch(&self, changes: &mpsc::Sender<Change>) -> Result<(), Report<KubernetesError>> {
        let mut config = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            config = config.labels(selector);
        }
        let mut stream = watcher(self.api.clone(), config).boxed();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| {
                Report::new(KubernetesError::WatchFailed {
                    kind: K::KIND,
                    message: format!("Watch stream error: {e}"),
                })
            })?;
            if forward(&self.cache, event, changes).await.is_err() {
                debug!("Change channel closed, stopping watch");
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Applies one watch event to the cache and publishes the resulting changes.
/// The first relist marks the cache synced.
pub(crate) async fn forward<K: Watched>(
    cache: &CacheWriter<K>,
    event: watcher::Event<K>,
    changes: &mpsc::Sender<Change>,
) -> Result<(), ChannelClosed> {
    let (event, relist) = match event {
        watcher::Event::Applied(obj) => (WatchEvent::Applied(obj), false),
        watcher::Event::Deleted(obj) => (WatchEvent::Deleted(obj), false),
        watcher::Event::Restarted(objects) => (WatchEvent::Restarted(objects), true),
    };
    for change in cache.ingest(event) {
        changes
            .send(K::into_change(change))
            .await
            .map_err(|_| ChannelClosed)?;
    }
    if relist && !cache.reader().is_synced() {
        info!(kind = K::KIND, objects = cache.reader().len(), "Cache synced");
        cache.mark_synced();
    }
    Ok(())
}
