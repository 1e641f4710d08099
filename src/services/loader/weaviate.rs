//! Weaviate backend.
//!
//! Each namespace maps to one Weaviate class; records are written as class
//! objects with the metadata as properties.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;
use tracing::{debug, info};

use super::http::RestClient;
use super::{CheckResult, Loader};
use crate::error::BackendError;
use crate::models::{Authentication, DocumentMessage, Match, MetadataFilter, WeaviateConfig};

const WEAVIATE_BATCH_SIZE: usize = 100;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static WORD_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-\s]").unwrap());

pub struct WeaviateLoader {
    client: RestClient,
    dimension: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    results: DeleteResults,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteResults {
    #[serde(default)]
    matches: u64,
    /// Server cap on objects deleted per call (`QUERY_MAXIMUM_RESULTS`).
    #[serde(default)]
    limit: u64,
    #[serde(default)]
    failed: u64,
}

impl WeaviateLoader {
    pub fn new(config: &WeaviateConfig) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        let mut basic = None;
        match &config.authentication {
            Authentication::NoAuthentication => {}
            Authentication::ApiKeyAuthentication { api_key: secret }
            | Authentication::TokenAuthentication { token: secret } => {
                let value = HeaderValue::from_str(&format!("Bearer {}", secret))
                    .map_err(|e| BackendError::ClientError(e.to_string()))?;
                headers.insert(AUTHORIZATION, value);
            }
            Authentication::BasicAuthentication { username, password } => {
                basic = Some((username.as_str(), password.as_str()));
            }
        }

        let mut client = RestClient::new(&config.cluster_url, headers)?;
        if let Some((username, password)) = basic {
            client = client.with_basic_auth(username, password);
        }
        Ok(Self {
            client,
            dimension: config.embedding_dimensions,
        })
    }

    async fn class_exists(&self, class: &str) -> Result<bool, BackendError> {
        let schema: Option<Value> = self
            .client
            .get_optional(&format!("/v1/schema/{}", class))
            .await?;
        Ok(schema.is_some())
    }
}

/// Weaviate class name for a namespace: `"my-class  name"` -> `"My_Class_Name"`.
pub(crate) fn namespace_to_class_name(namespace: &str) -> String {
    let cleaned = WHITESPACE.replace_all(namespace.trim(), " ");
    WORD_SEPARATOR
        .split(&cleaned)
        .map(capitalize)
        .collect::<Vec<_>>()
        .join("_")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Null metadata values are stored as empty strings.
fn normalize_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .map(|(k, v)| {
            let value = if v.is_null() { Value::String(String::new()) } else { v.clone() };
            (k.clone(), value)
        })
        .collect()
}

/// Translate a metadata filter into a Weaviate `where` clause.
pub(crate) fn build_where(filter: &MetadataFilter) -> Value {
    let operands: Vec<Value> = filter
        .conditions()
        .iter()
        .map(|c| match &c.matches {
            Match::Equals(value) => json!({
                "path": [c.key],
                "operator": "Equal",
                "valueText": value,
            }),
            Match::AnyOf(values) => json!({
                "path": [c.key],
                "operator": "ContainsAny",
                "valueTextArray": values,
            }),
            Match::Except(value) => json!({
                "path": [c.key],
                "operator": "NotEqual",
                "valueText": value,
            }),
        })
        .collect();

    if operands.len() == 1 {
        operands.into_iter().next().unwrap_or(Value::Null)
    } else {
        json!({ "operator": "And", "operands": operands })
    }
}

/// First per-object error message in a batch response, if any.
fn first_object_error(response: &[Value]) -> Option<String> {
    response.iter().find_map(|object| {
        let errors = object.pointer("/result/errors/error")?.as_array()?;
        let message = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; ");
        Some(message)
    })
}

#[async_trait]
impl Loader for WeaviateLoader {
    async fn check(&self) -> Result<CheckResult, BackendError> {
        match self.client.get::<Value>("/v1/meta").await {
            Ok(meta) => {
                debug!(version = ?meta.get("version"), "connected to Weaviate");
                Ok(CheckResult::passed())
            }
            Err(e) => Ok(CheckResult::failed(e.to_string())),
        }
    }

    async fn load(
        &self,
        batch: &[DocumentMessage],
        namespace: &str,
        stream: &str,
    ) -> Result<(), BackendError> {
        let class = namespace_to_class_name(namespace);
        if let Some(dimension) = self.dimension
            && let Some(bad) = batch.iter().find(|r| r.data.vectors.len() as u64 != dimension)
        {
            return Err(BackendError::LoadError(format!(
                "vector of length {} does not match the configured dimension {}",
                bad.data.vectors.len(),
                dimension
            )));
        }

        for part in batch.chunks(WEAVIATE_BATCH_SIZE) {
            let objects: Vec<Value> = part
                .iter()
                .map(|record| {
                    json!({
                        "class": class,
                        "id": uuid::Uuid::new_v4().to_string(),
                        "properties": normalize_metadata(&record.data.metadata),
                        "vector": record.data.vectors,
                    })
                })
                .collect();

            let response: Vec<Value> = self
                .client
                .post("/v1/batch/objects", &json!({ "objects": objects }))
                .await?;
            if let Some(message) = first_object_error(&response) {
                return Err(BackendError::LoadError(format!(
                    "Weaviate rejected objects for class {}: {}",
                    class, message
                )));
            }
        }

        debug!(stream, class = %class, objects = batch.len(), "loaded objects into Weaviate");
        Ok(())
    }

    async fn delete(&self, filter: &MetadataFilter, namespace: &str) -> Result<(), BackendError> {
        let class = namespace_to_class_name(namespace);
        if !self.class_exists(&class).await? {
            debug!(class = %class, "class does not exist, nothing to delete");
            return Ok(());
        }

        let body = json!({
            "match": {
                "class": class,
                "where": build_where(filter),
            },
            "output": "minimal",
        });
        // Each call removes at most `limit` objects; repeat until a call
        // matches fewer than that.
        let mut deleted = 0;
        loop {
            let response: DeleteResponse = self.client.delete("/v1/batch/objects", &body).await?;
            let results = response.results;
            if results.failed > 0 {
                return Err(BackendError::DeleteError(format!(
                    "{} of {} objects in class {} could not be deleted",
                    results.failed, results.matches, class
                )));
            }
            deleted += results.matches;
            if results.limit == 0 || results.matches < results.limit {
                break;
            }
            debug!(class = %class, matches = results.matches, "delete hit the server limit, repeating");
        }

        info!(class = %class, %filter, deleted, "deleted Weaviate objects");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "weaviate"
    }
}
