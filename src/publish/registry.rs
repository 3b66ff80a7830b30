use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, error, info};

use super::{github, meili, webhook, Publisher, Publishers, Sink};
use crate::config::Config;

/// Builds a sink's publisher, or `None` when the sink is not configured.
pub type SetupFn = fn(&Config) -> Result<Option<Arc<dyn Publisher>>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sink {0} is already registered")]
    Duplicate(Sink),
}

/// Setup functions of the known sinks. Filled once at startup.
#[derive(Default)]
pub struct SinkRegistry {
    setups: BTreeMap<Sink, SetupFn>,
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.setups.keys()).finish()
    }
}

impl SinkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in sink.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in sink is listed twice.
    pub fn bootstrap() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register(Sink::Chat, webhook::setup)?;
        registry.register(Sink::Issue, github::setup)?;
        registry.register(Sink::SearchIndex, meili::setup)?;
        Ok(registry)
    }

    /// Register `setup` for `sink`. The first registration wins.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if `sink` is already registered.
    pub fn register(&mut self, sink: Sink, setup: SetupFn) -> Result<(), RegistryError> {
        if self.setups.contains_key(&sink) {
            return Err(RegistryError::Duplicate(sink));
        }
        self.setups.insert(sink, setup);
        Ok(())
    }

    #[must_use]
    pub fn is_registered(&self, sink: Sink) -> bool {
        self.setups.contains_key(&sink)
    }

    /// Run every setup function. A sink whose setup fails is left out.
    #[must_use]
    pub fn setup(&self, config: &Config) -> Publishers {
        let mut publishers = Publishers::default();
        for (&sink, setup) in &self.setups {
            match setup(config) {
                Ok(Some(publisher)) => {
                    info!(sink = %sink, "Sink enabled");
                    publishers.set(sink, publisher);
                }
                Ok(None) => debug!(sink = %sink, "Sink not configured"),
                Err(e) => error!(sink = %sink, "Failed to set up sink: {e:#}"),
            }
        }
        publishers
    }
}
