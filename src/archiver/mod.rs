//! Archive slots and the records produced for them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::archive_today::ArchiveTodayClient;
use crate::config::Config;
use crate::ipfs::IpfsClient;
use crate::telegraph::TelegraphClient;
use crate::wayback::WaybackClient;

pub mod coordinator;

pub use coordinator::{ArchiveError, Archived, Coordinator};

/// One archiving destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// Internet Archive
    Ia,
    /// archive.today
    Is,
    /// IPFS
    Ip,
    /// Telegraph
    Ph,
}

/// A set of enabled slots, iterated in a stable order.
pub type Slots = BTreeSet<Slot>;

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Ia, Slot::Is, Slot::Ip, Slot::Ph];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Ia => "ia",
            Self::Is => "is",
            Self::Ip => "ip",
            Self::Ph => "ph",
        }
    }

    /// Human readable service name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ia => "Internet Archive",
            Self::Is => "archive.today",
            Self::Ip => "IPFS",
            Self::Ph => "Telegraph",
        }
    }

    /// Landing page of the service.
    #[must_use]
    pub fn link(self) -> &'static str {
        match self {
            Self::Ia => "https://web.archive.org/",
            Self::Is => "https://archive.today/",
            Self::Ip => "https://ipfs.github.io/public-gateway-checker/",
            Self::Ph => "https://telegra.ph/",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|slot| slot.id().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Where a source ended up, or why it did not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Destination {
    Archived(String),
    Failed(String),
}

impl Destination {
    #[must_use]
    pub fn is_archived(&self) -> bool {
        matches!(self, Self::Archived(_))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Archived(s) | Self::Failed(s) => s,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record of one backend attempt. Exists whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collect {
    pub slot: Slot,
    pub src: String,
    pub dst: Destination,
    pub ext: Slot,
}

impl Collect {
    #[must_use]
    pub fn new(slot: Slot, src: impl Into<String>, dst: Destination) -> Self {
        Self {
            slot,
            src: src.into(),
            dst,
            ext: slot,
        }
    }

    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.dst.is_archived()
    }
}

/// Group records by source URL, keeping the order sources first appear in.
#[must_use]
pub fn group_by_src(cols: &[Collect]) -> Vec<(&str, Vec<&Collect>)> {
    let mut parts: Vec<(&str, Vec<&Collect>)> = Vec::new();
    for col in cols {
        match parts.iter_mut().find(|(src, _)| *src == col.src) {
            Some((_, part)) => part.push(col),
            None => parts.push((&col.src, vec![col])),
        }
    }
    parts
}

/// Distinct sources with at least one archived record.
#[must_use]
pub fn archived_sources(cols: &[Collect]) -> Vec<Url> {
    group_by_src(cols)
        .into_iter()
        .filter(|(_, part)| part.iter().any(|c| c.is_archived()))
        .filter_map(|(src, _)| Url::parse(src).ok())
        .collect()
}

/// A backend that can archive a URL.
#[async_trait]
pub trait SlotArchiver: Send + Sync {
    /// Archive `url` and return the destination URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the service rejects or fails the request.
    async fn wayback(&self, token: &CancellationToken, url: &Url) -> Result<String>;

    /// Look up an existing snapshot of `url` without creating one.
    async fn playback(&self, _token: &CancellationToken, _url: &Url) -> Result<Option<String>> {
        Ok(None)
    }
}

/// The archiver behind every slot.
#[derive(Clone)]
pub struct Backends {
    ia: Arc<dyn SlotArchiver>,
    is: Arc<dyn SlotArchiver>,
    ip: Arc<dyn SlotArchiver>,
    ph: Arc<dyn SlotArchiver>,
}

impl Backends {
    #[must_use]
    pub fn new(
        ia: Arc<dyn SlotArchiver>,
        is: Arc<dyn SlotArchiver>,
        ip: Arc<dyn SlotArchiver>,
        ph: Arc<dyn SlotArchiver>,
    ) -> Self {
        Self { ia, is, ip, ph }
    }

    /// Build the real service clients.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            ia: Arc::new(WaybackClient::new(config)?),
            is: Arc::new(ArchiveTodayClient::new(config)?),
            ip: Arc::new(IpfsClient::new(config)?),
            ph: Arc::new(TelegraphClient::new(config)?),
        })
    }

    #[must_use]
    pub fn get(&self, slot: Slot) -> &Arc<dyn SlotArchiver> {
        match slot {
            Slot::Ia => &self.ia,
            Slot::Is => &self.is,
            Slot::Ip => &self.ip,
            Slot::Ph => &self.ph,
        }
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
