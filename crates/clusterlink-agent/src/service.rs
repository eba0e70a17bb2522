//! Cluster client service — polls the directory and reconciles the pool.
//!
//! The first poll runs as soon as the service starts; after that it sleeps a
//! random interval between the configured bounds so that many clusters do not
//! hit the region in lockstep. A failed poll is logged and retried on the next
//! tick.

use crate::channel::{Channel, ChannelContext};
use crate::directory::{DirectoryClient, DirectoryError, DirectorySource};
use crate::pool::{ChannelPool, Reconciliation};
use crate::security::CredentialStore;

use clusterlink_types::{AgentConfig, ClusterResult};
use clusterlink_wire::ResponderTable;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A random poll interval in `[min, max]` seconds, inclusive.
pub fn random_interval(min_secs: u64, max_secs: u64) -> Duration {
    let (lo, hi) = if min_secs <= max_secs {
        (min_secs, max_secs)
    } else {
        (max_secs, min_secs)
    };
    Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
}

/// Keeps the channel pool in step with the region's directory.
pub struct ClusterClientService {
    pool: ChannelPool,
    source: Arc<dyn DirectorySource>,
    interval_secs: (u64, u64),
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterClientService {
    pub fn new(
        pool: ChannelPool,
        source: Arc<dyn DirectorySource>,
        interval_min_secs: u64,
        interval_max_secs: u64,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pool,
            source,
            interval_secs: (interval_min_secs, interval_max_secs),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Service wired from configuration, serving `responders` to regions.
    pub fn from_config(
        config: &AgentConfig,
        responders: Arc<ResponderTable>,
    ) -> Result<Self, DirectoryError> {
        let context = ChannelContext {
            credentials: CredentialStore::from_config(config),
            subject: config.cluster_uuid.clone(),
            responders,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        };
        let source = DirectoryClient::from_config(config)?;
        Ok(Self::new(
            ChannelPool::new(context),
            Arc::new(source),
            config.poll_interval_min_secs,
            config.poll_interval_max_secs,
        ))
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Fetch the directory once and reconcile the pool against it.
    pub async fn update(&self) -> Result<Reconciliation, DirectoryError> {
        let directory = self.source.fetch().await?;
        Ok(self.pool.reconcile(&directory))
    }

    /// A ready channel to some event-loop, chosen at random.
    ///
    /// `NoConnectionsAvailable` is retryable; `ShuttingDown` is not.
    pub fn get_client(&self) -> ClusterResult<Arc<Channel>> {
        Ok(self.pool.get_client()?)
    }

    /// Start the poll loop. Calling it again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let (min, max) = self.interval_secs;
        info!(
            interval_min_secs = min,
            interval_max_secs = max,
            "Starting cluster client service"
        );

        let service = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                match service.update().await {
                    Ok(report) if !report.is_noop() => {
                        info!(
                            started = report.started.len(),
                            dropped = report.dropped.len(),
                            "Event-loop directory changed"
                        );
                    }
                    Ok(_) => debug!("Event-loop directory unchanged"),
                    Err(e) => warn!(error = %e, "Failed to update event-loop connections"),
                }

                let wait = random_interval(min, max);
                debug!(secs = wait.as_secs(), "Next directory poll scheduled");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => {
                        info!("Cluster client service: shutdown signal received");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop polling and close every channel.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.pool.stop().await;
    }
}
