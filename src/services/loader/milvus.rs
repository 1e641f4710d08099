//! Milvus backend over the v2 REST API.
//!
//! One collection (auto id, dynamic fields) holds every stream; each
//! namespace is a partition of it.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::http::RestClient;
use super::{CheckResult, Loader};
use crate::error::BackendError;
use crate::models::{
    Authentication, Catalog, DocumentMessage, Match, MetadataFilter, MilvusConfig, WriteSyncMode,
};

const MILVUS_BATCH_SIZE: usize = 100;
const DEFAULT_PARTITION: &str = "_default";
const VECTOR_FIELD: &str = "vector";
const ID_FIELD: &str = "id";

pub struct MilvusLoader {
    client: RestClient,
    collection: String,
    dimension: u64,
}

/// Every v2 endpoint answers HTTP 200 with this envelope; `code != 0` is a failure.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    fn into_data(
        self,
        endpoint: &str,
        on_error: fn(String) -> BackendError,
    ) -> Result<Value, BackendError> {
        if self.code != 0 {
            return Err(on_error(format!(
                "{} failed with code {}: {}",
                endpoint, self.code, self.message
            )));
        }
        Ok(self.data)
    }
}

impl MilvusLoader {
    pub fn new(config: &MilvusConfig) -> Result<Self, BackendError> {
        let token = match &config.authentication {
            Authentication::NoAuthentication => None,
            Authentication::BasicAuthentication { username, password } => {
                Some(format!("{}:{}", username, password))
            }
            Authentication::TokenAuthentication { token }
            | Authentication::ApiKeyAuthentication { api_key: token } => Some(token.clone()),
        };

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| BackendError::ClientError(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client: RestClient::new(&config.uri, headers)?,
            collection: config.collection_name.clone(),
            dimension: config.embedding_dimensions,
        })
    }

    async fn call(
        &self,
        endpoint: &str,
        body: Value,
        on_error: fn(String) -> BackendError,
    ) -> Result<Value, BackendError> {
        let envelope: Envelope = self
            .client
            .post(&format!("/v2/vectordb/{}", endpoint), &body)
            .await?;
        envelope.into_data(endpoint, on_error)
    }

    /// Insert without retries: the collection assigns ids, so a replayed
    /// request would store the entities twice.
    async fn insert(&self, partition: &str, data: Vec<Value>) -> Result<(), BackendError> {
        let endpoint = "entities/insert";
        let body = json!({
            "collectionName": self.collection,
            "partitionName": partition,
            "data": data,
        });
        let envelope: Envelope = self
            .client
            .post_once(&format!("/v2/vectordb/{}", endpoint), &body)
            .await?;
        envelope.into_data(endpoint, BackendError::LoadError)?;
        Ok(())
    }

    async fn ensure_collection(&self) -> Result<(), BackendError> {
        let data = self
            .call(
                "collections/has",
                json!({ "collectionName": self.collection }),
                BackendError::CollectionError,
            )
            .await?;
        if data.get("has").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(());
        }

        info!(collection = %self.collection, dimension = self.dimension, "creating Milvus collection");
        self.call(
            "collections/create",
            json!({
                "collectionName": self.collection,
                "dimension": self.dimension,
                "autoID": true,
                "enableDynamicField": true,
            }),
            BackendError::CollectionError,
        )
        .await?;
        Ok(())
    }

    async fn has_partition(&self, partition: &str) -> Result<bool, BackendError> {
        let data = self
            .call(
                "partitions/has",
                json!({ "collectionName": self.collection, "partitionName": partition }),
                BackendError::CollectionError,
            )
            .await?;
        Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn ensure_partition(&self, partition: &str) -> Result<(), BackendError> {
        if partition == DEFAULT_PARTITION || self.has_partition(partition).await? {
            return Ok(());
        }
        debug!(collection = %self.collection, partition, "creating Milvus partition");
        self.call(
            "partitions/create",
            json!({ "collectionName": self.collection, "partitionName": partition }),
            BackendError::CollectionError,
        )
        .await?;
        Ok(())
    }

    async fn drop_partition(&self, partition: &str) -> Result<(), BackendError> {
        if !self.has_partition(partition).await? {
            return Ok(());
        }
        self.call(
            "partitions/release",
            json!({ "collectionName": self.collection, "partitionNames": [partition] }),
            BackendError::DeleteError,
        )
        .await?;
        self.call(
            "partitions/drop",
            json!({ "collectionName": self.collection, "partitionName": partition }),
            BackendError::DeleteError,
        )
        .await?;
        Ok(())
    }

    /// Validate a `collections/describe` payload against what the loader needs.
    fn validate_schema(&self, description: &Value) -> CheckResult {
        if !description
            .get("enableDynamicField")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return CheckResult::failed("Dynamic fields are not enabled.");
        }
        if !description.get("autoId").and_then(Value::as_bool).unwrap_or(false) {
            return CheckResult::failed("Auto ID is not enabled.");
        }

        let fields = description
            .get("fields")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let field = |name: &str| fields.iter().find(|f| f.get("name").and_then(Value::as_str) == Some(name));

        let (Some(id_field), Some(vector_field)) = (field(ID_FIELD), field(VECTOR_FIELD)) else {
            return CheckResult::failed(format!(
                "Collection {} must have `{}` and `{}` fields.",
                self.collection, ID_FIELD, VECTOR_FIELD
            ));
        };
        if !id_field.get("primaryKey").and_then(Value::as_bool).unwrap_or(false) {
            return CheckResult::failed("ID field is not primary.");
        }

        match vector_dimension(vector_field) {
            Some(dim) if dim == self.dimension => CheckResult::passed(),
            Some(dim) => CheckResult::failed(format!(
                "Vector dimension {} does not match the configured dimension {}.",
                dim, self.dimension
            )),
            None => CheckResult::failed("Vector field has no dimension."),
        }
    }
}

/// Partition that stores a namespace.
fn partition_name(namespace: &str) -> &str {
    if namespace.is_empty() { DEFAULT_PARTITION } else { namespace }
}

/// `dim` entry of a field's params, given as a number or a numeric string.
fn vector_dimension(field: &Value) -> Option<u64> {
    field
        .get("params")?
        .as_array()?
        .iter()
        .find(|p| p.get("key").and_then(Value::as_str) == Some("dim"))
        .and_then(|p| p.get("value"))
        .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Translate a metadata filter into a Milvus boolean expression.
pub(crate) fn build_expression(filter: &MetadataFilter) -> String {
    filter
        .conditions()
        .iter()
        .map(|c| match &c.matches {
            Match::Equals(value) => format!("({} == {})", c.key, quote(value)),
            Match::AnyOf(values) => {
                let list: Vec<String> = values.iter().map(|v| quote(v)).collect();
                format!("({} in [{}])", c.key, list.join(", "))
            }
            Match::Except(value) => format!("({} != {})", c.key, quote(value)),
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

fn to_entity(record: &DocumentMessage) -> Value {
    let mut entity: Map<String, Value> = record
        .data
        .metadata
        .iter()
        .filter(|(k, v)| !v.is_null() && k.as_str() != ID_FIELD && k.as_str() != VECTOR_FIELD)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    entity.insert(VECTOR_FIELD.to_string(), json!(record.data.vectors));
    Value::Object(entity)
}

#[async_trait]
impl Loader for MilvusLoader {
    async fn check(&self) -> Result<CheckResult, BackendError> {
        self.ensure_collection().await?;
        let description = self
            .call(
                "collections/describe",
                json!({ "collectionName": self.collection }),
                BackendError::CollectionError,
            )
            .await?;
        debug!(collection = %self.collection, ?description, "described Milvus collection");
        Ok(self.validate_schema(&description))
    }

    /// REPLACE streams lose their whole partition; the default partition
    /// cannot be dropped and is purged by stream instead.
    async fn initiate_sync(&self, catalog: &Catalog) -> Result<(), BackendError> {
        self.ensure_collection().await?;
        for stream in catalog.streams_with_mode(WriteSyncMode::Replace) {
            let partition = partition_name(stream.namespace());
            info!(
                stream = %stream.name,
                partition,
                "write mode REPLACE, dropping previous records"
            );
            if partition == DEFAULT_PARTITION {
                self.delete(&MetadataFilter::stream(&stream.name), stream.namespace())
                    .await?;
            } else {
                self.drop_partition(partition).await?;
            }
        }
        Ok(())
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
        let partition = partition_name(namespace);
        self.ensure_collection().await?;
        self.ensure_partition(partition).await?;

        for part in batch.chunks(MILVUS_BATCH_SIZE) {
            let data: Vec<Value> = part.iter().map(to_entity).collect();
            self.insert(partition, data).await?;
        }

        debug!(stream, partition, entities = batch.len(), "loaded entities into Milvus");
        Ok(())
    }

    async fn delete(&self, filter: &MetadataFilter, namespace: &str) -> Result<(), BackendError> {
        let partition = partition_name(namespace);
        if partition != DEFAULT_PARTITION && !self.has_partition(partition).await? {
            debug!(partition, "partition does not exist, nothing to delete");
            return Ok(());
        }

        let expression = build_expression(filter);
        let data = self
            .call(
                "entities/delete",
                json!({
                    "collectionName": self.collection,
                    "partitionName": partition,
                    "filter": expression,
                }),
                BackendError::DeleteError,
            )
            .await?;
        info!(partition, filter = %expression, result = %data, "deleted Milvus entities");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "milvus"
    }
}
