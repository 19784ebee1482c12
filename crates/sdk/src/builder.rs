//! Builder pattern for constructing a [`Courier`].

use std::path::Path;
use std::sync::Arc;

use courier_broker::{Broker, LogBroker, MemoryBroker};

use crate::config::{CallOptions, Config};
use crate::courier::Courier;
use crate::types::RpcError;

/// Fluent builder for [`Courier`].
///
/// # Example
///
/// ```rust,no_run
/// # use courier_sdk::CourierBuilder;
/// # use courier_broker::MemoryBroker;
/// let courier = CourierBuilder::new()
///     .memory(MemoryBroker::new())
///     .call_options(Default::default())
///     .build()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct CourierBuilder {
    broker: Option<Arc<dyn Broker>>,
    log: Option<Arc<dyn LogBroker>>,
    config: Config,
}

impl CourierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Connection ───────────────────────────────────────────────────

    /// Set the publish/subscribe connection.  Required.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the persistent log.  Without one, durable operations fail with
    /// [`RpcError::Config`].
    pub fn log(mut self, log: Arc<dyn LogBroker>) -> Self {
        self.log = Some(log);
        self
    }

    /// Use an in-memory broker for both roles.
    pub fn memory(self, broker: MemoryBroker) -> Self {
        self.broker(Arc::new(broker.clone())).log(Arc::new(broker))
    }

    // ── Configuration ────────────────────────────────────────────────

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Load configuration from a TOML file; a missing file keeps defaults.
    pub fn config_file(self, path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let config = Config::load(path)?;
        Ok(self.config(config))
    }

    /// Override the `[calls]` section.
    pub fn call_options(mut self, options: CallOptions) -> Self {
        self.config.calls = options;
        self
    }

    // ── Build ────────────────────────────────────────────────────────

    /// Validate and assemble the [`Courier`].
    pub fn build(self) -> Result<Courier, RpcError> {
        let broker = self
            .broker
            .ok_or_else(|| RpcError::Config("a broker connection is required".into()))?;
        self.config.validate()?;
        Ok(Courier::from_parts(broker, self.log, self.config))
    }
}
