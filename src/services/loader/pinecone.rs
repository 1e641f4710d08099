//! Pinecone backend over its REST API.

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::http::RestClient;
use super::{CheckResult, Loader, flatten_metadata};
use crate::error::BackendError;
use crate::models::{DocumentMessage, Match, MetadataFilter, PineconeConfig};

const PINECONE_BATCH_SIZE: usize = 100;
const PARALLELISM_LIMIT: usize = 4;
const METADATA_SIZE_LIMIT: usize = 40 * 1024;
const MAX_IDS_PER_DELETE: usize = 1000;
const DELETE_QUERY_TOP_K: usize = 10_000;
const API_VERSION: &str = "2024-07";

#[derive(Debug, Deserialize)]
struct IndexList {
    #[serde(default)]
    indexes: Vec<IndexDescription>,
}

#[derive(Debug, Deserialize)]
struct IndexDescription {
    name: String,
    dimension: u64,
    host: String,
}

#[derive(Debug, Serialize)]
struct PineconeVector {
    id: String,
    values: Vec<f32>,
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
}

pub struct PineconeLoader {
    config: PineconeConfig,
    control: RestClient,
    data: OnceCell<RestClient>,
}

impl PineconeLoader {
    pub fn new(config: &PineconeConfig) -> Result<Self, BackendError> {
        let control = RestClient::new(&config.controller_url, Self::headers(config)?)?;
        Ok(Self {
            config: config.clone(),
            control,
            data: OnceCell::new(),
        })
    }

    fn headers(config: &PineconeConfig) -> Result<HeaderMap, BackendError> {
        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(&config.pinecone_api_key)
            .map_err(|e| BackendError::ClientError(format!("invalid API key header: {}", e)))?;
        headers.insert("api-key", api_key);
        headers.insert(
            "x-pinecone-api-version",
            HeaderValue::from_static(API_VERSION),
        );
        Ok(headers)
    }

    async fn describe_index(&self) -> Result<IndexDescription, BackendError> {
        self.control
            .get(&format!("/indexes/{}", self.config.pinecone_index))
            .await
    }

    /// Data-plane client for the index host, resolved once.
    async fn index(&self) -> Result<&RestClient, BackendError> {
        self.data
            .get_or_try_init(|| async {
                let description = self.describe_index().await?;
                let base_url = if description.host.starts_with("http") {
                    description.host
                } else {
                    format!("https://{}", description.host)
                };
                RestClient::new(&base_url, Self::headers(&self.config)?)
            })
            .await
    }

    async fn upsert(
        &self,
        index: &RestClient,
        vectors: &[PineconeVector],
        namespace: &str,
    ) -> Result<(), BackendError> {
        let body = json!({ "vectors": vectors, "namespace": namespace });
        let _: Value = index
            .post("/vectors/upsert", &body)
            .await
            .map_err(|e| e.relabel(BackendError::LoadError))?;
        Ok(())
    }

    /// Delete by querying matching ids and removing them in batches until
    /// the query comes back empty. Serverless indexes cannot delete by
    /// metadata filter directly.
    async fn delete_by_metadata(
        &self,
        filter: &Value,
        namespace: &str,
    ) -> Result<(), BackendError> {
        let index = self.index().await?;
        let zero_vector = vec![0.0f32; self.config.embedding_dimensions as usize];
        let query = json!({
            "vector": zero_vector,
            "filter": filter,
            "topK": DELETE_QUERY_TOP_K,
            "namespace": namespace,
            "includeValues": false,
            "includeMetadata": false,
        });

        loop {
            let result: QueryResponse = index.post("/query", &query).await?;
            if result.matches.is_empty() {
                return Ok(());
            }

            let ids: Vec<String> = result.matches.into_iter().map(|m| m.id).collect();
            for batch in ids.chunks(MAX_IDS_PER_DELETE) {
                let body = json!({ "ids": batch, "namespace": namespace });
                let _: Value = index
                    .post("/vectors/delete", &body)
                    .await
                    .map_err(|e| e.relabel(BackendError::DeleteError))?;
                debug!(namespace, ids = batch.len(), "deleted Pinecone vectors");
                tokio::time::sleep(Duration::from_secs(self.config.delete_settle_secs)).await;
            }
        }
    }
}

/// Translate a metadata filter into Pinecone's filter language.
pub(crate) fn build_filter(filter: &MetadataFilter) -> Value {
    let clauses: Vec<Value> = filter
        .conditions()
        .iter()
        .map(|c| {
            let op = match &c.matches {
                Match::Equals(v) => json!({ "$eq": v }),
                Match::AnyOf(vs) => json!({ "$in": vs }),
                Match::Except(v) => json!({ "$ne": v }),
            };
            let mut clause = Map::new();
            clause.insert(c.key.clone(), op);
            Value::Object(clause)
        })
        .collect();

    match clauses.len() {
        0 => json!({}),
        1 => clauses.into_iter().next().unwrap_or_default(),
        _ => json!({ "$and": clauses }),
    }
}

/// Keep only metadata Pinecone accepts and enforce its per-vector size limit.
pub(crate) fn normalize_metadata(
    metadata: &Map<String, Value>,
) -> Result<Map<String, Value>, BackendError> {
    let normalized = flatten_metadata(metadata);

    let size: usize = normalized
        .iter()
        .map(|(k, v)| {
            k.len()
                + match v {
                    Value::String(s) => s.len(),
                    other => other.to_string().len(),
                }
        })
        .sum();
    if size > METADATA_SIZE_LIMIT {
        return Err(BackendError::LoadError(format!(
            "Metadata exceeds the 40KB size limit, current size: {} bytes",
            size
        )));
    }

    Ok(normalized)
}

#[async_trait]
impl Loader for PineconeLoader {
    async fn check(&self) -> Result<CheckResult, BackendError> {
        let list: IndexList = self.control.get("/indexes").await?;
        let index = &self.config.pinecone_index;

        let Some(description) = list.indexes.into_iter().find(|i| &i.name == index) else {
            return Ok(CheckResult::failed(format!(
                "Index {} does not exist in environment {}.",
                index, self.config.pinecone_environment
            )));
        };

        if description.dimension != self.config.embedding_dimensions {
            return Ok(CheckResult::failed(format!(
                "Index {} has dimension {} but configured dimension is {}.",
                index, description.dimension, self.config.embedding_dimensions
            )));
        }

        Ok(CheckResult::passed())
    }

    async fn load(
        &self,
        batch: &[DocumentMessage],
        namespace: &str,
        stream: &str,
    ) -> Result<(), BackendError> {
        if batch.is_empty() {
            return Ok(());
        }
        let index = self.index().await?;

        let vectors = batch
            .iter()
            .map(|record| {
                Ok(PineconeVector {
                    id: uuid::Uuid::new_v4().to_string(),
                    values: record.data.vectors.clone(),
                    metadata: normalize_metadata(&record.data.metadata)?,
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        // Up to PARALLELISM_LIMIT sub-batches in flight; returns once all are accepted.
        for serial in vectors.chunks(PINECONE_BATCH_SIZE * PARALLELISM_LIMIT) {
            try_join_all(
                serial
                    .chunks(PINECONE_BATCH_SIZE)
                    .map(|part| self.upsert(index, part, namespace)),
            )
            .await?;
        }

        debug!(stream, namespace, vectors = batch.len(), "upserted into Pinecone");
        Ok(())
    }

    async fn delete(&self, filter: &MetadataFilter, namespace: &str) -> Result<(), BackendError> {
        let filter = build_filter(filter);
        info!(namespace, %filter, "deleting Pinecone vectors");
        self.delete_by_metadata(&filter, namespace).await
    }

    fn name(&self) -> &'static str {
        "pinecone"
    }
}
