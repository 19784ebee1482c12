//! Idempotent stream provisioning.

use std::collections::HashMap;
use std::sync::Arc;

use courier_broker::{LogBroker, StreamConfig};
use courier_protocol::stream_name_for;
use parking_lot::RwLock;

use crate::config::StreamSettings;
use crate::types::RpcError;

/// Guarantees that a durable stream exists for a subject.
///
/// Safe to call from any number of tasks and processes at once: at most one
/// stream is ever created per subject, because the name is derived from the
/// subject and creation races are resolved by re-querying.
pub struct StreamProvisioner {
    log: Arc<dyn LogBroker>,
    /// subject -> config of the stream as it exists on the log.
    ensured: RwLock<HashMap<String, StreamConfig>>,
}

impl StreamProvisioner {
    pub fn new(log: Arc<dyn LogBroker>) -> Self {
        Self {
            log,
            ensured: RwLock::new(HashMap::new()),
        }
    }

    /// Make sure a stream capturing `subject` exists and return its name.
    pub async fn ensure_stream(
        &self,
        subject: &str,
        settings: &StreamSettings,
    ) -> Result<String, RpcError> {
        self.ensure_stream_config(subject, settings)
            .await
            .map(|config| config.name)
    }

    /// Like [`ensure_stream`](Self::ensure_stream), but returns the config
    /// the stream actually has.  When another process created the stream,
    /// that is its config, not `settings`.
    pub async fn ensure_stream_config(
        &self,
        subject: &str,
        settings: &StreamSettings,
    ) -> Result<StreamConfig, RpcError> {
        if let Some(config) = self.ensured.read().get(subject) {
            return Ok(config.clone());
        }

        let name = stream_name_for(subject);
        match self.log.stream_info(&name).await {
            Ok(info) => {
                tracing::debug!(subject = %subject, stream = %name, "stream already present");
                return Ok(self.remember(subject, info.config));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(RpcError::provisioning(subject, e)),
        }

        let config = settings.stream_config(&name, subject);
        match self.log.create_stream(config).await {
            Ok(info) => {
                tracing::info!(subject = %subject, stream = %name, "stream created");
                Ok(self.remember(subject, info.config))
            }
            Err(create_err) => {
                // Someone else may have created it in the meantime.
                match self.log.stream_info(&name).await {
                    Ok(info) => {
                        tracing::debug!(
                            subject = %subject,
                            stream = %name,
                            error = %create_err,
                            "stream created concurrently"
                        );
                        Ok(self.remember(subject, info.config))
                    }
                    Err(requery_err) => {
                        tracing::warn!(
                            subject = %subject,
                            stream = %name,
                            error = %create_err,
                            requery_error = %requery_err,
                            "stream provisioning failed"
                        );
                        Err(RpcError::provisioning(subject, create_err))
                    }
                }
            }
        }
    }

    /// Whether `subject` is already in the local cache.
    pub fn is_ensured(&self, subject: &str) -> bool {
        self.ensured.read().contains_key(subject)
    }

    pub fn ensured_count(&self) -> usize {
        self.ensured.read().len()
    }

    fn remember(&self, subject: &str, config: StreamConfig) -> StreamConfig {
        self.ensured
            .write()
            .entry(subject.to_string())
            .or_insert(config)
            .clone()
    }
}

impl std::fmt::Debug for StreamProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProvisioner")
            .field("ensured", &self.ensured_count())
            .finish_non_exhaustive()
    }
}

