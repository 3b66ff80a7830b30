//! Fan-out of one archive request to every enabled slot.
//!
//! Each URL × slot pair runs as its own task inside a [`JoinSet`] scoped to
//! the call. Every finished task appends exactly one [`Collect`] to a shared
//! accumulator, so a failing backend shows up as a failed record instead of
//! a missing one. If the caller's token is cancelled, or the call deadline
//! passes, the records gathered so far are handed back with the error and
//! the remaining tasks are aborted with the scope.
//!
//! Fan-out and artifact capture share 90% of the call timeout; the rest is
//! left for the caller to publish the result before an enclosing pool
//! deadline with the same timeout passes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{archived_sources, Backends, Collect, Destination, Slot, SlotArchiver, Slots};
use crate::reduxer::{Bundles, Reduxer};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no archive slot enabled")]
    NoSlotEnabled,
    #[error("no URL to archive")]
    NoUrls,
    #[error("archiving cancelled")]
    Cancelled { partial: Vec<Collect> },
    #[error("archiving deadline exceeded")]
    DeadlineExceeded { partial: Vec<Collect> },
}

impl ArchiveError {
    /// Records that completed before the call was interrupted.
    #[must_use]
    pub fn partial(&self) -> &[Collect] {
        match self {
            Self::Cancelled { partial } | Self::DeadlineExceeded { partial } => partial,
            Self::NoSlotEnabled | Self::NoUrls => &[],
        }
    }
}

/// Result of a completed archive call.
#[derive(Debug, Default)]
pub struct Archived {
    /// One record per URL × slot, in completion order.
    pub collects: Vec<Collect>,
    /// Captured artifacts for sources archived at least once.
    pub bundles: Bundles,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Wayback,
    Playback,
}

enum Interrupt {
    Cancelled,
    Deadline,
}

/// Dispatches archive requests to the slot backends.
#[derive(Debug, Clone)]
pub struct Coordinator {
    backends: Backends,
    reduxer: Option<Arc<Reduxer>>,
    timeout: Duration,
}

impl Coordinator {
    /// `timeout` bounds a whole call; 10% of it is kept back for the caller.
    #[must_use]
    pub fn new(backends: Backends, timeout: Duration) -> Self {
        Self {
            backends,
            reduxer: None,
            timeout,
        }
    }

    /// Capture artifacts for archived sources after each call.
    #[must_use]
    pub fn with_reduxer(mut self, reduxer: Arc<Reduxer>) -> Self {
        self.reduxer = Some(reduxer);
        self
    }

    /// Archive every URL to every enabled slot, then capture artifacts of
    /// the archived sources in whatever is left of the budget.
    ///
    /// # Errors
    ///
    /// Fails up front when `urls` or `slots` is empty. When `token` is
    /// cancelled or the deadline passes, returns the partial records inside
    /// [`ArchiveError::Cancelled`] or [`ArchiveError::DeadlineExceeded`].
    pub async fn archive(
        &self,
        token: &CancellationToken,
        urls: &[Url],
        slots: &Slots,
    ) -> Result<Archived, ArchiveError> {
        let started = Instant::now();
        let collects = self.fan_out(token, urls, slots, Mode::Wayback).await?;

        let bundles = match &self.reduxer {
            Some(reduxer) => {
                let srcs = archived_sources(&collects);
                if srcs.is_empty() {
                    Bundles::default()
                } else {
                    let left = self.budget().saturating_sub(started.elapsed());
                    reduxer.capture_within(token, &srcs, left).await
                }
            }
            None => Bundles::default(),
        };

        Ok(Archived { collects, bundles })
    }

    /// Look up existing snapshots on every slot without creating new ones.
    ///
    /// # Errors
    ///
    /// Same as [`Coordinator::archive`].
    pub async fn playback(
        &self,
        token: &CancellationToken,
        urls: &[Url],
    ) -> Result<Vec<Collect>, ArchiveError> {
        let slots: Slots = Slot::ALL.into_iter().collect();
        self.fan_out(token, urls, &slots, Mode::Playback).await
    }

    async fn fan_out(
        &self,
        token: &CancellationToken,
        urls: &[Url],
        slots: &Slots,
        mode: Mode,
    ) -> Result<Vec<Collect>, ArchiveError> {
        if slots.is_empty() {
            return Err(ArchiveError::NoSlotEnabled);
        }
        let urls = dedup(urls);
        if urls.is_empty() {
            return Err(ArchiveError::NoUrls);
        }

        info!(urls = urls.len(), slots = slots.len(), ?mode, "Archiving started");

        let scope = token.child_token();
        let _scope_guard = scope.clone().drop_guard();
        let collects = Arc::new(Mutex::new(Vec::with_capacity(urls.len() * slots.len())));
        let mut tasks = JoinSet::new();

        for url in &urls {
            for &slot in slots {
                let archiver = Arc::clone(self.backends.get(slot));
                let collects = Arc::clone(&collects);
                let scope = scope.clone();
                let url = url.clone();

                tasks.spawn(async move {
                    debug!(slot = %slot, url = %url, "Archiving slot");
                    let dst = tokio::select! {
                        biased;
                        () = scope.cancelled() => return,
                        dst = call(archiver.as_ref(), mode, &scope, &url) => dst,
                    };
                    collects.lock().await.push(Collect::new(slot, url.as_str(), dst));
                });
            }
        }

        let interrupt = tokio::select! {
            biased;
            () = token.cancelled() => Some(Interrupt::Cancelled),
            () = tokio::time::sleep(self.budget()) => Some(Interrupt::Deadline),
            () = join_all(&mut tasks) => None,
        };

        if interrupt.is_some() {
            tasks.abort_all();
        }
        let collects = std::mem::take(&mut *collects.lock().await);

        match interrupt {
            None => {
                let archived = collects.iter().filter(|c| c.is_archived()).count();
                info!(records = collects.len(), archived, "Archiving finished");
                Ok(collects)
            }
            Some(Interrupt::Cancelled) => {
                warn!(records = collects.len(), "Archiving cancelled");
                Err(ArchiveError::Cancelled { partial: collects })
            }
            Some(Interrupt::Deadline) => {
                warn!(records = collects.len(), "Archiving deadline exceeded");
                Err(ArchiveError::DeadlineExceeded { partial: collects })
            }
        }
    }

    /// Bound of a whole call.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Close the capture browser, if any.
    pub async fn shutdown(&self) {
        if let Some(reduxer) = &self.reduxer {
            reduxer.shutdown().await;
        }
    }

    /// Time allowed for fan-out plus capture, leaving some for the caller.
    fn budget(&self) -> Duration {
        self.timeout.mul_f64(0.9)
    }
}

async fn call(
    archiver: &dyn SlotArchiver,
    mode: Mode,
    token: &CancellationToken,
    url: &Url,
) -> Destination {
    let result = AssertUnwindSafe(async {
        match mode {
            Mode::Wayback => archiver.wayback(token, url).await,
            Mode::Playback => archiver
                .playback(token, url)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no snapshot found")),
        }
    })
    .catch_unwind()
    .await;

    match result {
        Ok(Ok(dst)) => Destination::Archived(dst),
        Ok(Err(e)) => {
            error!(url = %url, ?mode, "Slot failed: {e:#}");
            Destination::Failed(format!("{e:#}"))
        }
        Err(_) => {
            error!(url = %url, ?mode, "Slot panicked");
            Destination::Failed("archiver panicked".to_string())
        }
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Archive task failed: {e}");
        }
    }
}

fn dedup(urls: &[Url]) -> Vec<Url> {
    let mut seen = Vec::with_capacity(urls.len());
    for url in urls {
        if !seen.contains(url) {
            seen.push(url.clone());
        }
    }
    seen
}
