//! Backend adapter layer.
//!
//! Each vector database is reached through the [`Loader`] trait. The sync
//! processor only ever depends on this trait, never on a concrete backend.

mod http;
mod milvus;
mod pinecone;
mod qdrant;
mod weaviate;

pub use milvus::MilvusLoader;
pub use pinecone::PineconeLoader;
pub use qdrant::QdrantLoader;
pub use weaviate::WeaviateLoader;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::BackendError;
use crate::models::{Catalog, DestinationConfig, DocumentMessage, MetadataFilter, WriteSyncMode};

/// Outcome of a connectivity and schema check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub ok: bool,
    pub detail: Option<String>,
}

impl CheckResult {
    pub fn passed() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Capability set every vector store backend implements.
///
/// `load` and `delete` return only once the backend has durably accepted the
/// whole request; any partial failure is an error.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Verify reachability and that the target collection matches the
    /// configured dimension, creating it when the backend allows.
    async fn check(&self) -> Result<CheckResult, BackendError>;

    /// Run before the first load of a sync: purge every REPLACE stream.
    async fn initiate_sync(&self, catalog: &Catalog) -> Result<(), BackendError> {
        for stream in catalog.streams_with_mode(WriteSyncMode::Replace) {
            let filter = MetadataFilter::stream(&stream.name);
            info!(
                backend = self.name(),
                stream = %stream.name,
                namespace = stream.namespace(),
                %filter,
                "write mode REPLACE, deleting previous records"
            );
            self.delete(&filter, stream.namespace()).await?;
        }
        Ok(())
    }

    /// Write a batch of records of one stream into `namespace`.
    async fn load(
        &self,
        batch: &[DocumentMessage],
        namespace: &str,
        stream: &str,
    ) -> Result<(), BackendError>;

    /// Remove every record in `namespace` matching `filter`.
    async fn delete(&self, filter: &MetadataFilter, namespace: &str) -> Result<(), BackendError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Create the loader for the configured backend.
pub fn create_loader(config: &DestinationConfig) -> Result<Arc<dyn Loader>, BackendError> {
    match config {
        DestinationConfig::Qdrant(c) => Ok(Arc::new(QdrantLoader::new(c))),
        DestinationConfig::Pinecone(c) => Ok(Arc::new(PineconeLoader::new(c)?)),
        DestinationConfig::Weaviate(c) => Ok(Arc::new(WeaviateLoader::new(c)?)),
        DestinationConfig::Milvus(c) => Ok(Arc::new(MilvusLoader::new(c)?)),
    }
}

/// Keep only metadata values every backend can index: non-null scalars and
/// lists made entirely of strings.
pub fn flatten_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .filter(|(_, value)| match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => true,
            Value::Array(items) => items.iter().all(Value::is_string),
            Value::Null | Value::Object(_) => false,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
