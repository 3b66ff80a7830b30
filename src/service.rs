//! The archive pipeline shared by the CLI and the HTTP ingress:
//! fan-out, artifact capture, then publish.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::archiver::{ArchiveError, Archived, Backends, Collect, Coordinator, Slots};
use crate::config::Config;
use crate::pooling::{Job, Permanent, Pool, PoolError, MSG_TIMEOUT};
use crate::publish::{Dispatcher, Sink, SinkRegistry};
use crate::reduxer::Reduxer;

/// Share of the job timeout after which no more publish jobs are submitted.
const SPREAD_DEADLINE_SHARE: f64 = 0.95;

/// What a submitted archive job ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Archived(Vec<Collect>),
    /// Retries exhausted; carries the message shown to the user.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Service {
    coordinator: Arc<Coordinator>,
    pool: Pool,
    dispatcher: Dispatcher,
    slots: Slots,
    sinks: Vec<Sink>,
}

impl Service {
    /// Archive jobs run on `pool`; `dispatcher` must use a different pool.
    #[must_use]
    pub fn new(coordinator: Coordinator, pool: Pool, dispatcher: Dispatcher, slots: Slots) -> Self {
        if coordinator.timeout() > pool.timeout() {
            warn!(
                coordinator_ms = coordinator.timeout().as_millis(),
                pool_ms = pool.timeout().as_millis(),
                "Archive jobs time out before the fan-out deadline"
            );
        }
        let sinks = dispatcher.configured();
        Self {
            coordinator: Arc::new(coordinator),
            pool,
            dispatcher,
            slots,
            sinks,
        }
    }

    /// Wire up backends, capture, pools and sinks from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a client cannot be built or a pool option is
    /// invalid.
    pub fn from_config(root: &CancellationToken, config: &Config) -> Result<Self> {
        let backends = Backends::from_config(config)?;
        let mut coordinator = Coordinator::new(backends, config.wayback_timeout);
        if let Some(reduxer) = Reduxer::from_config(config)? {
            coordinator = coordinator.with_reduxer(Arc::new(reduxer));
        }

        let pool = Pool::new(root.clone(), config.pool_options()).context("Invalid archive pool")?;
        let publish_pool =
            Pool::new(root.clone(), config.publish_pool_options()).context("Invalid publish pool")?;

        let registry = SinkRegistry::bootstrap()?;
        let dispatcher = Dispatcher::new(publish_pool, registry.setup(config))
            .with_max_delay(config.publish_max_delay);

        info!(
            slots = ?config.slots,
            sinks = ?dispatcher.configured(),
            capacity = config.pooling_size,
            "Archive service ready"
        );

        Ok(Self::new(coordinator, pool, dispatcher, config.slots.clone()))
    }

    /// Start running jobs on both pools.
    pub fn start(&self) {
        for pool in [self.pool.clone(), self.dispatcher.pool().clone()] {
            tokio::spawn(async move {
                if let Err(e) = pool.roll().await {
                    error!("Pool stopped: {e}");
                }
            });
        }
    }

    /// Archive `urls`, capture artifacts and hand the result to every
    /// configured sink.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::archive`].
    pub async fn wayback(&self, token: &CancellationToken, urls: &[Url]) -> Result<Archived, ArchiveError> {
        // Submitting publish jobs must end before the archive job's deadline,
        // or records that are already archived get thrown away and redone
        let deadline = Instant::now() + self.deadline();
        let archived = self.coordinator.archive(token, urls, &self.slots).await?;
        if self.sinks.is_empty() {
            return Ok(archived);
        }

        let spread = self
            .dispatcher
            .spread(token, &archived.bundles, &archived.collects, &self.sinks);
        match tokio::time::timeout_at(deadline, spread).await {
            Ok(submitted) => debug!(submitted, "Archive result handed to sinks"),
            Err(_) => warn!(
                sinks = self.sinks.len(),
                "Publish pool stayed full until the deadline, some sinks skipped"
            ),
        }
        Ok(archived)
    }

    /// How long [`Service::wayback`] may take: most of the shorter of the
    /// archive job timeout and the coordinator timeout.
    fn deadline(&self) -> Duration {
        self.coordinator
            .timeout()
            .min(self.pool.timeout())
            .mul_f64(SPREAD_DEADLINE_SHARE)
    }

    /// Run [`Service::wayback`] as a pool job with the pool's retry policy.
    ///
    /// Blocks while the pool is full. The receiver yields the outcome once
    /// the job succeeds or its fallback runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is closed or cancelled.
    pub async fn submit(&self, urls: Vec<Url>) -> Result<oneshot::Receiver<Outcome>, PoolError> {
        let (tx, rx) = oneshot::channel();
        let reply = Arc::new(Mutex::new(Some(tx)));
        let urls = Arc::new(urls);
        let name = format!("wayback:{}", urls.len());

        let request = {
            let service = self.clone();
            let reply = Arc::clone(&reply);
            let urls = Arc::clone(&urls);
            move |token: CancellationToken| {
                let service = service.clone();
                let reply = Arc::clone(&reply);
                let urls = Arc::clone(&urls);
                async move {
                    match service.wayback(&token, &urls).await {
                        Ok(archived) => {
                            send(&reply, Outcome::Archived(archived.collects));
                            Ok(())
                        }
                        Err(e @ (ArchiveError::NoSlotEnabled | ArchiveError::NoUrls)) => {
                            Err(Permanent(e.into()).into())
                        }
                        Err(e) => {
                            warn!(partial = e.partial().len(), "Archive attempt interrupted: {e}");
                            Err(e.into())
                        }
                    }
                }
            }
        };

        let job = Job::new(request)
            .with_fallback(move |_| {
                let reply = Arc::clone(&reply);
                async move {
                    send(&reply, Outcome::Failed(MSG_TIMEOUT.to_string()));
                    Ok(())
                }
            })
            .named(name);

        self.pool.put(job).await?;
        Ok(rx)
    }

    /// Stop admission, then wait for archive jobs and the publishes they
    /// started. Closes the capture browser last.
    pub async fn close(&self) {
        self.pool.close().await;
        self.dispatcher.pool().close().await;
        self.coordinator.shutdown().await;
    }

    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn slots(&self) -> &Slots {
        &self.slots
    }
}

fn send(reply: &Mutex<Option<oneshot::Sender<Outcome>>>, outcome: Outcome) {
    let sender = reply
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        // The submitter may have stopped waiting
        let _ = sender.send(outcome);
    }
}
