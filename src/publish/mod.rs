//! Fan-out of archive results to downstream sinks.
//!
//! [`Dispatcher::spread`] turns every requested sink into one pool [`Job`].
//! The request publishes one message per source URL, each after a small
//! random delay. The fallback only counts the failure. Sinks never share a
//! job, so one slow or failing sink cannot hold up another.

pub mod github;
pub mod meili;
pub mod registry;
pub mod render;
pub mod webhook;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use registry::{RegistryError, SetupFn, SinkRegistry};

use crate::archiver::{group_by_src, Collect};
use crate::pooling::{Job, Pool, PoolError};
use crate::reduxer::Bundles;

/// A downstream publish target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sink {
    /// Chat channel behind an incoming webhook
    Chat,
    /// GitHub issue tracker
    Issue,
    /// Meilisearch index
    SearchIndex,
}

impl Sink {
    pub const ALL: [Sink; 3] = [Sink::Chat, Sink::Issue, Sink::SearchIndex];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Issue => "issue",
            Self::SearchIndex => "search-index",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Chat => 0,
            Self::Issue => 1,
            Self::SearchIndex => 2,
        }
    }
}

impl fmt::Display for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A sink adapter.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish the records of a single source URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the message.
    async fn publish(&self, token: &CancellationToken, bundles: &Bundles, cols: &[Collect]) -> Result<()>;
}

/// The publisher configured for each sink, if any.
#[derive(Clone, Default)]
pub struct Publishers {
    chat: Option<Arc<dyn Publisher>>,
    issue: Option<Arc<dyn Publisher>>,
    search_index: Option<Arc<dyn Publisher>>,
}

impl Publishers {
    fn entry(&mut self, sink: Sink) -> &mut Option<Arc<dyn Publisher>> {
        match sink {
            Sink::Chat => &mut self.chat,
            Sink::Issue => &mut self.issue,
            Sink::SearchIndex => &mut self.search_index,
        }
    }

    pub fn set(&mut self, sink: Sink, publisher: Arc<dyn Publisher>) {
        *self.entry(sink) = Some(publisher);
    }

    #[must_use]
    pub fn with(mut self, sink: Sink, publisher: Arc<dyn Publisher>) -> Self {
        self.set(sink, publisher);
        self
    }

    #[must_use]
    pub fn get(&self, sink: Sink) -> Option<&Arc<dyn Publisher>> {
        match sink {
            Sink::Chat => self.chat.as_ref(),
            Sink::Issue => self.issue.as_ref(),
            Sink::SearchIndex => self.search_index.as_ref(),
        }
    }

    /// Sinks with a publisher, in declaration order.
    #[must_use]
    pub fn configured(&self) -> Vec<Sink> {
        Sink::ALL
            .into_iter()
            .filter(|sink| self.get(*sink).is_some())
            .collect()
    }
}

impl fmt::Debug for Publishers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publishers")
            .field("configured", &self.configured())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Counters {
    request: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
}

/// Point-in-time publish counters of one sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    /// Attempts started, retries included.
    pub request: u64,
    pub success: u64,
    /// Jobs that ended in the fallback.
    pub failure: u64,
}

/// Per-sink publish counters.
#[derive(Debug, Default)]
pub struct PublishMetrics {
    sinks: [Counters; 3],
}

impl PublishMetrics {
    fn counters(&self, sink: Sink) -> &Counters {
        &self.sinks[sink.index()]
    }

    #[must_use]
    pub fn stats(&self, sink: Sink) -> SinkStats {
        let c = self.counters(sink);
        SinkStats {
            request: c.request.load(Ordering::Relaxed),
            success: c.success.load(Ordering::Relaxed),
            failure: c.failure.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the dispatcher's waiting counter when dropped.
struct Pending(Arc<AtomicUsize>);

impl Pending {
    fn new(waiting: &Arc<AtomicUsize>) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(waiting))
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything one sink job needs, shared by its request and fallback.
struct SinkTask {
    sink: Sink,
    publisher: Arc<dyn Publisher>,
    bundles: Bundles,
    cols: Vec<Collect>,
    metrics: Arc<PublishMetrics>,
    max_delay: Duration,
    /// Sources already published, skipped on retry.
    published: Mutex<HashSet<String>>,
    _pending: Pending,
}

impl SinkTask {
    async fn run(&self, token: CancellationToken) -> Result<()> {
        let counters = self.metrics.counters(self.sink);
        counters.request.fetch_add(1, Ordering::Relaxed);

        let parts: Vec<(String, Vec<Collect>)> = group_by_src(&self.cols)
            .into_iter()
            .filter(|(src, _)| !self.is_published(src))
            .map(|(src, part)| (src.to_string(), part.into_iter().cloned().collect()))
            .collect();

        let results = join_all(parts.iter().map(|(src, part)| self.publish_part(&token, src, part))).await;

        let failed: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
        let total = parts.len();
        match failed.into_iter().next() {
            None => {
                counters.success.fetch_add(1, Ordering::Relaxed);
                info!(sink = %self.sink, parts = total, "Published");
                Ok(())
            }
            Some(first) => Err(first.context(format!("publishing to {} failed", self.sink))),
        }
    }

    async fn publish_part(&self, token: &CancellationToken, src: &str, part: &[Collect]) -> Result<()> {
        let delay = jitter(self.max_delay);
        if !delay.is_zero() {
            debug!(sink = %self.sink, src = %src, delay_ms = delay.as_millis(), "Delaying publish");
            tokio::select! {
                biased;
                () = token.cancelled() => anyhow::bail!("cancelled before publishing"),
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.publisher.publish(token, &self.bundles, part).await?;
        self.mark_published(src);
        Ok(())
    }

    fn is_published(&self, src: &str) -> bool {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(src)
    }

    fn mark_published(&self, src: &str) {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(src.to_string());
    }

    fn fail(&self) {
        self.metrics
            .counters(self.sink)
            .failure
            .fetch_add(1, Ordering::Relaxed);
        error!(sink = %self.sink, "Publish retries exhausted");
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Submits one pool job per sink.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    publishers: Arc<Publishers>,
    waiting: Arc<AtomicUsize>,
    metrics: Arc<PublishMetrics>,
    max_delay: Duration,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("publishers", &self.publishers)
            .field("waiting", &self.waiting())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// `pool` should not be the pool the caller itself runs on: a full pool
    /// would block `spread` forever.
    #[must_use]
    pub fn new(pool: Pool, publishers: Publishers) -> Self {
        Self {
            pool,
            publishers: Arc::new(publishers),
            waiting: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(PublishMetrics::default()),
            max_delay: Duration::ZERO,
        }
    }

    /// Upper bound of the random delay before each published message.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Submit one job per sink in `sinks`. Sinks without a publisher and
    /// repeated sinks are skipped. Returns the number of jobs submitted.
    ///
    /// Blocks while the publish pool is full. Stops submitting once `token`
    /// is cancelled.
    pub async fn spread(
        &self,
        token: &CancellationToken,
        bundles: &Bundles,
        cols: &[Collect],
        sinks: &[Sink],
    ) -> usize {
        if cols.is_empty() {
            debug!("Nothing to publish");
            return 0;
        }

        let mut seen = HashSet::new();
        let mut submitted = 0;

        for &sink in sinks {
            if !seen.insert(sink) {
                continue;
            }
            let Some(publisher) = self.publishers.get(sink) else {
                warn!(sink = %sink, "Sink not configured, skipping");
                continue;
            };

            let task = Arc::new(SinkTask {
                sink,
                publisher: Arc::clone(publisher),
                bundles: bundles.clone(),
                cols: cols.to_vec(),
                metrics: Arc::clone(&self.metrics),
                max_delay: self.max_delay,
                published: Mutex::new(HashSet::new()),
                _pending: Pending::new(&self.waiting),
            });

            let request = Arc::clone(&task);
            let job = Job::new(move |token| {
                let task = Arc::clone(&request);
                async move { task.run(token).await }
            })
            .with_fallback(move |_| {
                let task = Arc::clone(&task);
                async move {
                    task.fail();
                    Ok(())
                }
            })
            .named(format!("publish:{sink}"));

            let put = tokio::select! {
                biased;
                () = token.cancelled() => Err(PoolError::Cancelled),
                put = self.pool.put(job) => put,
            };

            match put {
                Ok(()) => submitted += 1,
                Err(PoolError::Cancelled) => {
                    warn!(sink = %sink, "Spread cancelled");
                    break;
                }
                Err(e) => {
                    error!(sink = %sink, "Failed to submit publish job: {e}");
                }
            }
        }

        debug!(submitted, waiting = self.waiting(), "Spread finished");
        submitted
    }

    /// Publish jobs submitted and not finished yet.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self, sink: Sink) -> SinkStats {
        self.metrics.stats(sink)
    }

    #[must_use]
    pub fn configured(&self) -> Vec<Sink> {
        self.publishers.configured()
    }

    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}
