//! # Relay Context
//!
//! Everything the ingress routes and background tasks share, built once at
//! startup and torn down by [`Relay::shutdown`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::auth::ApiKeyStore;
use crate::config::RelayConfig;
use crate::durable_log::{Backoff, ConsumerWorker, LogBackend, Producer};
use crate::hub::{HubError, HubHandle};
use crate::observability::RelayMetrics;
use crate::ratelimit::RateLimiter;

struct BackgroundTasks {
    hub: JoinHandle<()>,
    consumer: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

/// Shared state of a running relay
pub struct Relay {
    pub config: RelayConfig,
    pub hub: HubHandle,
    pub producer: Producer,
    pub limiter: RateLimiter,
    pub metrics: Arc<RelayMetrics>,
    pub api_keys: ApiKeyStore,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl Relay {
    /// Spawn the hub, the consumer loop and the maintenance task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: RelayConfig, backend: LogBackend) -> Arc<Self> {
        let metrics = Arc::new(RelayMetrics::new());
        let (hub, hub_task) = HubHandle::spawn(config.connection.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let producer = Producer::new(
            backend.producer,
            config.durable_log.delivery_timeout(),
            Arc::clone(&metrics),
        );
        let consumer = ConsumerWorker::new(
            backend.consumer,
            hub.clone(),
            Arc::clone(&metrics),
            config.transform_stage,
            Backoff::from(&config.consumer),
            shutdown_rx.clone(),
        )
        .spawn();

        let limiter = RateLimiter::new(config.rate_limit.clone());
        let maintenance = tokio::spawn(maintain(
            hub.clone(),
            limiter.clone(),
            config.hub.maintenance_interval(),
            config.rate_limit.idle_ttl(),
            config.hub.stream_idle_ttl(),
            shutdown_rx,
        ));

        info!(
            backend = ?config.durable_log.backend,
            stage = ?config.transform_stage,
            api_keys = config.api_keys.len(),
            "Relay started"
        );

        Arc::new(Self {
            api_keys: ApiKeyStore::new(&config.api_keys),
            config,
            hub,
            producer,
            limiter,
            metrics,
            started_at: Instant::now(),
            shutdown,
            tasks: Mutex::new(Some(BackgroundTasks {
                hub: hub_task,
                consumer,
                maintenance,
            })),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop the consumer and maintenance loops, then close every subscriber
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };

        let _ = self.shutdown.send(true);
        let _ = tasks.consumer.await;
        let _ = tasks.maintenance.await;

        let _ = self.hub.shutdown().await;
        let _ = tasks.hub.await;
        info!("Relay stopped");
    }
}

/// Periodic housekeeping: forget idle rate-limit buckets and, when
/// configured, prune idle streams
async fn maintain(
    hub: HubHandle,
    limiter: RateLimiter,
    period: Duration,
    bucket_ttl: Duration,
    stream_ttl: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let swept = limiter.sweep_idle(bucket_ttl).await;
                let pruned = match stream_ttl {
                    Some(ttl) => match hub.prune_idle(ttl).await {
                        Ok(pruned) => pruned,
                        Err(HubError::Stopped) => break,
                        Err(_) => 0,
                    },
                    None => 0,
                };
                debug!(swept, pruned, "Maintenance pass");
            }
        }
    }
}
