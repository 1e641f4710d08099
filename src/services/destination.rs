//! Destination facade: one configured backend, checked or written to.

use futures::stream::Stream;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{BackendError, SyncError};
use crate::models::{Catalog, ConnectionStatus, DestinationConfig, Message};
use crate::services::loader::{Loader, create_loader};
use crate::services::processor::SyncProcessor;

pub struct Destination {
    loader: Arc<dyn Loader>,
}

impl Destination {
    pub fn new(config: &DestinationConfig) -> Result<Self, BackendError> {
        info!(module = config.module_name(), "initializing destination");
        Ok(Self {
            loader: create_loader(config)?,
        })
    }

    /// Build a destination around an existing loader.
    pub fn with_loader(loader: Arc<dyn Loader>) -> Self {
        Self { loader }
    }

    /// Check connectivity and schema. Adapter errors become a FAILED status.
    pub async fn check(&self) -> ConnectionStatus {
        match self.loader.check().await {
            Ok(result) if result.ok => ConnectionStatus::succeeded(),
            Ok(result) => {
                let detail = result.detail.unwrap_or_default();
                error!(backend = self.loader.name(), %detail, "connection check failed");
                ConnectionStatus::failed(detail)
            }
            Err(e) => {
                error!(backend = self.loader.name(), error = %e, "connection check failed");
                ConnectionStatus::failed(e.to_string())
            }
        }
    }

    /// Write `input` into the backend, yielding acknowledgements lazily.
    pub fn write<S>(
        &self,
        catalog: Catalog,
        input: S,
        batch_size: usize,
    ) -> Result<impl Stream<Item = Result<Message, SyncError>> + use<S>, SyncError>
    where
        S: Stream<Item = Message>,
    {
        SyncProcessor::new(Arc::clone(&self.loader), batch_size)?.process(catalog, input)
    }
}
