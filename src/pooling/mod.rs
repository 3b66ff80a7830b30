//! Bounded worker pool with per-job timeout, retry and fallback.
//!
//! A [`Pool`] admits at most `capacity` jobs at a time. [`Pool::put`] blocks
//! the submitter while the pool is full, [`Pool::roll`] pulls admitted jobs
//! and runs each on its own task, and [`Pool::close`] stops admission and
//! waits for everything in flight. Every attempt of a job's request runs
//! under a fresh deadline; once the retry budget is spent the job's fallback
//! runs exactly once.

mod options;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub use options::{
    PoolOptions, RetryPolicy, DEFAULT_BACKOFF, DEFAULT_CAPACITY, DEFAULT_MAX_RETRIES,
    DEFAULT_TIMEOUT,
};

/// Message a front-end shows once a job's fallback runs.
pub const MSG_TIMEOUT: &str = "wayback timeout, please try later.";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool capacity must be at least 1")]
    ZeroCapacity,
    #[error("pool is closed")]
    Closed,
    #[error("pool context cancelled")]
    Cancelled,
    #[error("pool is already rolling")]
    AlreadyRolling,
}

/// Marks a request error as not worth retrying.
///
/// Only honoured under [`RetryPolicy::SkipPermanent`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Permanent(#[from] pub anyhow::Error);

type Action = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn action<F, Fut>(f: F) -> Action
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |token| Box::pin(f(token)))
}

/// A unit of work: a request plus an optional fallback.
///
/// Both receive a token that is cancelled when the attempt's deadline passes
/// or the pool's root token is cancelled.
pub struct Job {
    name: String,
    request: Action,
    fallback: Option<Action>,
}

impl Job {
    pub fn new<F, Fut>(request: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: "job".to_string(),
            request: action(request),
            fallback: None,
        }
    }

    /// Set the fallback run once the retry budget is exhausted.
    #[must_use]
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.fallback = Some(action(fallback));
        self
    }

    /// Name used in logs.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a job inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Retrying,
    Succeeded,
    FallbackInvoked,
    /// The root token was cancelled before the job reached a terminal state.
    Abandoned,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::FallbackInvoked => "fallback-invoked",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// An admitted job together with the execution slot it holds.
struct Ticket {
    job: Job,
    permit: OwnedSemaphorePermit,
}

enum Failure {
    Deadline,
    Error(anyhow::Error),
}

impl Failure {
    fn is_permanent(&self) -> bool {
        match self {
            Self::Deadline => false,
            Self::Error(e) => is_permanent_failure(e),
        }
    }
}

enum Attempt {
    Done,
    Cancelled,
    Failed(Failure),
}

/// Check if an error indicates a failure that a retry will not fix.
///
/// Explicit [`Permanent`] errors always qualify; otherwise HTTP 401, 403
/// and 404 style messages do.
#[must_use]
pub fn is_permanent_failure(err: &anyhow::Error) -> bool {
    if err.chain().any(|cause| cause.is::<Permanent>()) {
        return true;
    }

    let error_lower = format!("{err:#}").to_lowercase();

    error_lower.contains("401")
        || error_lower.contains("403")
        || error_lower.contains("404")
        || error_lower.contains("unauthorized")
        || error_lower.contains("forbidden")
        || error_lower.contains("not found")
}

struct Inner {
    root: CancellationToken,
    closing: CancellationToken,
    options: PoolOptions,
    slots: Arc<Semaphore>,
    sender: mpsc::UnboundedSender<Ticket>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Ticket>>>,
    tracker: TaskTracker,
    running: AtomicUsize,
    waiting: watch::Sender<usize>,
    closed: AtomicBool,
}

/// Capacity-bounded job scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    /// Create a pool whose jobs are all children of `root`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ZeroCapacity`] if `options.capacity` is 0.
    pub fn new(root: CancellationToken, options: PoolOptions) -> Result<Self, PoolError> {
        if options.capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (waiting, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                closing: CancellationToken::new(),
                slots: Arc::new(Semaphore::new(options.capacity)),
                options,
                sender,
                receiver: Mutex::new(Some(receiver)),
                tracker: TaskTracker::new(),
                running: AtomicUsize::new(0),
                waiting,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Submit a job.
    ///
    /// Blocks while the pool is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool is closed, also while
    /// waiting for a slot, and [`PoolError::Cancelled`] if the root token is
    /// cancelled while waiting for a slot.
    pub async fn put(&self, job: Job) -> Result<(), PoolError> {
        if self.closed() {
            return Err(PoolError::Closed);
        }

        let permit = tokio::select! {
            biased;
            () = self.inner.root.cancelled() => return Err(PoolError::Cancelled),
            () = self.inner.closing.cancelled() => return Err(PoolError::Closed),
            permit = Arc::clone(&self.inner.slots).acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)?
            }
        };

        if self.closed() {
            return Err(PoolError::Closed);
        }

        debug!(job = %job.name, state = %JobState::Queued, "Job admitted");
        self.inner.waiting.send_modify(|n| *n += 1);
        let ticket = Ticket { job, permit };
        if self.inner.sender.send(ticket).is_err() {
            self.inner.finish();
            return Err(PoolError::Closed);
        }

        Ok(())
    }

    /// Run admitted jobs until the pool is closed or the root token is
    /// cancelled. Must be started once per pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadyRolling`] on a second call and
    /// [`PoolError::Closed`] if the pool was closed before rolling.
    pub async fn roll(&self) -> Result<(), PoolError> {
        if self.closed() {
            return Err(PoolError::Closed);
        }
        let mut receiver = self
            .inner
            .receiver
            .lock()
            .await
            .take()
            .ok_or(PoolError::AlreadyRolling)?;

        info!(capacity = self.inner.options.capacity, "Pool rolling");

        let mut closing = false;
        loop {
            tokio::select! {
                biased;
                () = self.inner.root.cancelled() => break,
                () = self.inner.closing.cancelled(), if !closing => {
                    // Stop admission but keep draining what is already queued.
                    closing = true;
                    receiver.close();
                }
                ticket = receiver.recv() => match ticket {
                    Some(ticket) => {
                        let inner = Arc::clone(&self.inner);
                        self.inner.tracker.spawn(async move { inner.execute(ticket).await });
                    }
                    None => break,
                },
            }
        }

        self.inner.abandon_queued(&mut receiver);
        self.inner.tracker.close();
        debug!("Pool stopped rolling");

        Ok(())
    }

    /// Stop accepting jobs and wait until every admitted job has finished, or
    /// until the root token is cancelled. Idempotent.
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(status = %self.status(), "Closing pool");
            self.inner.closing.cancel();
        }

        // Never rolled: nothing will ever run what is queued.
        if let Some(mut receiver) = self.inner.receiver.lock().await.take() {
            self.inner.abandon_queued(&mut receiver);
        }

        let mut waiting = self.inner.waiting.subscribe();
        tokio::select! {
            biased;
            _ = waiting.wait_for(|n| *n == 0) => {}
            () = self.inner.root.cancelled() => {
                warn!(status = %self.status(), "Pool cancelled before in-flight jobs finished");
            }
        }
    }

    /// Reports whether the pool has been closed.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.options.capacity
    }

    /// Deadline of a single attempt.
    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        self.inner.options.timeout
    }

    /// Number of jobs whose request or fallback is executing right now.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of admitted jobs that have not finished yet.
    #[must_use]
    pub fn waiting(&self) -> usize {
        *self.inner.waiting.borrow()
    }

    /// Diagnostic snapshot, `idle` or `busy (running R/C, waiting W)`.
    #[must_use]
    pub fn status(&self) -> String {
        let waiting = self.waiting();
        if waiting == 0 {
            return "idle".to_string();
        }
        format!(
            "busy (running {}/{}, waiting {waiting})",
            self.running(),
            self.capacity()
        )
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("options", &self.inner.options)
            .field("status", &self.status())
            .field("closed", &self.closed())
            .finish()
    }
}

impl Inner {
    fn finish(&self) {
        self.waiting.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn abandon_queued(&self, receiver: &mut mpsc::UnboundedReceiver<Ticket>) {
        receiver.close();
        while let Ok(ticket) = receiver.try_recv() {
            warn!(job = %ticket.job.name, state = %JobState::Abandoned, "Queued job dropped");
            drop(ticket);
            self.finish();
        }
    }

    async fn execute(self: Arc<Self>, ticket: Ticket) {
        let Ticket { job, permit } = ticket;

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(job = %job.name, state = %JobState::Running, running, "Job started");

        let state = self.process(&job).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        debug!(job = %job.name, state = %state, "Job finished");

        drop(job);
        drop(permit);
        self.finish();
    }

    async fn process(&self, job: &Job) -> JobState {
        let mut budget = self.options.max_retries;
        let mut retry = 0;

        loop {
            let failure = match self.attempt(&job.request).await {
                Attempt::Done => return JobState::Succeeded,
                Attempt::Cancelled => return JobState::Abandoned,
                Attempt::Failed(failure) => failure,
            };

            match &failure {
                Failure::Deadline => warn!(
                    job = %job.name,
                    timeout_ms = self.options.timeout.as_millis(),
                    "Job request deadline exceeded"
                ),
                Failure::Error(e) => warn!(job = %job.name, "Job request failed: {e:#}"),
            }

            if budget == 0 {
                break;
            }
            if self.options.retry_policy == RetryPolicy::SkipPermanent && failure.is_permanent()
            {
                info!(job = %job.name, "Permanent failure, skipping retries");
                break;
            }

            budget -= 1;
            retry += 1;
            debug!(
                job = %job.name,
                state = %JobState::Retrying,
                retry,
                remaining = budget,
                "Retrying job"
            );

            if !self.backoff(retry).await {
                return JobState::Abandoned;
            }
        }

        self.fallback(job).await
    }

    async fn attempt(&self, act: &Action) -> Attempt {
        let token = self.root.child_token();

        let outcome = tokio::select! {
            biased;
            () = self.root.cancelled() => return Attempt::Cancelled,
            outcome = tokio::time::timeout(self.options.timeout, act(token.clone())) => outcome,
        };
        token.cancel();

        match outcome {
            Ok(Ok(())) => Attempt::Done,
            Ok(Err(e)) => Attempt::Failed(Failure::Error(e)),
            Err(_) => Attempt::Failed(Failure::Deadline),
        }
    }

    async fn backoff(&self, retry: u32) -> bool {
        let delay = self.options.backoff_for(retry);
        if delay.is_zero() {
            return !self.root.is_cancelled();
        }

        tokio::select! {
            biased;
            () = self.root.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    async fn fallback(&self, job: &Job) -> JobState {
        let Some(fallback) = &job.fallback else {
            debug!(job = %job.name, "Retries exhausted, no fallback set");
            return JobState::FallbackInvoked;
        };

        match self.attempt(fallback).await {
            Attempt::Cancelled => return JobState::Abandoned,
            Attempt::Done => {}
            Attempt::Failed(Failure::Deadline) => {
                warn!(job = %job.name, "Job fallback deadline exceeded");
            }
            Attempt::Failed(Failure::Error(e)) => {
                warn!(job = %job.name, "Job fallback failed: {e:#}");
            }
        }

        JobState::FallbackInvoked
    }
}
