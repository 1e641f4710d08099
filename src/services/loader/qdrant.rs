//! Qdrant backend.
//!
//! All streams share one collection; namespaces are kept apart by a
//! `namespace` payload field.

use async_trait::async_trait;
use qdrant_client::{Qdrant, QdrantError};
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    UpsertPointsBuilder, VectorParamsBuilder, vectors_config,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{CheckResult, Loader, flatten_metadata};
use crate::error::BackendError;
use crate::models::{DistanceMetric, DocumentMessage, Match, MetadataFilter, QdrantConfig};

const QDRANT_BATCH_SIZE: usize = 100;

const NAMESPACE_FIELD: &str = "namespace";
const TEXT_FIELD: &str = "document_chunk";

pub struct QdrantLoader {
    config: QdrantConfig,
    client: OnceCell<Qdrant>,
}

impl QdrantLoader {
    pub fn new(config: &QdrantConfig) -> Self {
        Self {
            config: config.clone(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Qdrant, BackendError> {
        self.client
            .get_or_try_init(|| async {
                let mut builder = Qdrant::from_url(&self.config.url);
                if let Some(ref api_key) = self.config.api_key {
                    builder = builder.api_key(api_key.clone());
                }
                builder
                    .build()
                    .map_err(|e| BackendError::Unavailable(e.to_string()))
            })
            .await
    }

    fn distance(&self) -> Distance {
        match self.config.distance.distance {
            DistanceMetric::Dot => Distance::Dot,
            DistanceMetric::Cos => Distance::Cosine,
            DistanceMetric::Euc => Distance::Euclid,
        }
    }

    fn collection(&self) -> &str {
        &self.config.collection_name
    }

    /// Vector size of an existing collection, `None` when it has named vectors.
    async fn collection_dimension(&self, client: &Qdrant) -> Result<Option<u64>, BackendError> {
        let info = client
            .collection_info(self.collection())
            .await
            .map_err(|e| BackendError::CollectionError(e.to_string()))?;

        let size = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|config| match config {
                vectors_config::Config::Params(params) => Some(params.size),
                vectors_config::Config::ParamsMap(_) => None,
            });
        Ok(size)
    }
}

/// Translate a metadata filter, scoped to one namespace.
pub(crate) fn build_filter(filter: &MetadataFilter, namespace: &str) -> Filter {
    let mut must = vec![Condition::matches(NAMESPACE_FIELD, namespace.to_string())];
    let mut must_not = Vec::new();

    for condition in filter.conditions() {
        let key = condition.key.clone();
        match &condition.matches {
            Match::Equals(value) => must.push(Condition::matches(key, value.clone())),
            Match::AnyOf(values) => must.push(Condition::matches(key, values.clone())),
            Match::Except(value) => must_not.push(Condition::matches(key, value.clone())),
        }
    }

    Filter {
        must,
        must_not,
        ..Default::default()
    }
}

fn to_qdrant_value(value: &JsonValue) -> Option<qdrant_client::qdrant::Value> {
    match value {
        JsonValue::String(s) => Some(s.clone().into()),
        JsonValue::Bool(b) => Some((*b).into()),
        JsonValue::Number(n) => n
            .as_i64()
            .map(Into::into)
            .or_else(|| n.as_f64().map(Into::into)),
        JsonValue::Array(items) => {
            let values: Vec<qdrant_client::qdrant::Value> =
                items.iter().filter_map(to_qdrant_value).collect();
            Some(values.into())
        }
        JsonValue::Null | JsonValue::Object(_) => None,
    }
}

fn to_point(record: &DocumentMessage, namespace: &str) -> PointStruct {
    let mut payload: HashMap<String, qdrant_client::qdrant::Value> = flatten_metadata(
        &record.data.metadata,
    )
    .iter()
    .filter_map(|(k, v)| to_qdrant_value(v).map(|v| (k.clone(), v)))
    .collect();
    payload.insert(TEXT_FIELD.to_string(), record.data.document_chunk.clone().into());
    payload.insert(NAMESPACE_FIELD.to_string(), namespace.to_string().into());

    PointStruct::new(
        uuid::Uuid::new_v4().to_string(),
        record.data.vectors.clone(),
        payload,
    )
}

#[async_trait]
impl Loader for QdrantLoader {
    async fn check(&self) -> Result<CheckResult, BackendError> {
        let client = self.client().await?;
        let exists = client
            .collection_exists(self.collection())
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if !exists {
            info!(collection = self.collection(), "creating Qdrant collection");
            let create = CreateCollectionBuilder::new(self.collection()).vectors_config(
                VectorParamsBuilder::new(self.config.embedding_dimensions, self.distance()),
            );
            client
                .create_collection(create)
                .await
                .map_err(|e| BackendError::CollectionError(e.to_string()))?;
            return Ok(CheckResult::passed());
        }

        match self.collection_dimension(client).await? {
            Some(size) if size != self.config.embedding_dimensions => {
                Ok(CheckResult::failed(format!(
                    "Collection {} has dimension {}, but the configured dimension is {}.",
                    self.collection(),
                    size,
                    self.config.embedding_dimensions
                )))
            }
            Some(_) => Ok(CheckResult::passed()),
            None => Ok(CheckResult::failed(format!(
                "Collection {} uses named vectors, a single unnamed vector is required.",
                self.collection()
            ))),
        }
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
        let client = self.client().await?;

        for part in batch.chunks(QDRANT_BATCH_SIZE) {
            let points: Vec<PointStruct> = part.iter().map(|r| to_point(r, namespace)).collect();
            let upsert = UpsertPointsBuilder::new(self.collection(), points).wait(true);
            client
                .upsert_points(upsert)
                .await
                .map_err(|e| classify(e, BackendError::LoadError))?;
        }

        debug!(stream, namespace, points = batch.len(), "loaded points into Qdrant");
        Ok(())
    }

    async fn delete(&self, filter: &MetadataFilter, namespace: &str) -> Result<(), BackendError> {
        info!(namespace, %filter, "deleting Qdrant points");
        let client = self.client().await?;
        let delete = DeletePointsBuilder::new(self.collection())
            .points(build_filter(filter, namespace))
            .wait(true);

        client
            .delete_points(delete)
            .await
            .map_err(|e| classify(e, BackendError::DeleteError))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "qdrant"
    }
}

// gRPC DEADLINE_EXCEEDED and UNAVAILABLE.
const TRANSIENT_GRPC_CODES: [i32; 2] = [4, 14];

/// Map a client error to `wrap`, keeping outages and rate limits `Unavailable`.
fn classify(err: QdrantError, wrap: fn(String) -> BackendError) -> BackendError {
    let transient = match &err {
        QdrantError::ResponseError { status } => {
            TRANSIENT_GRPC_CODES.contains(&(status.code() as i32))
        }
        QdrantError::ResourceExhaustedError { .. } | QdrantError::Io(_) => true,
        _ => false,
    };
    if transient {
        BackendError::Unavailable(err.to_string())
    } else {
        wrap(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Data, DistanceSpec, DocumentStream, WriteSyncMode};
    use qdrant_client::qdrant::condition::ConditionOneOf;
    use serde_json::json;

    fn config() -> QdrantConfig {
        QdrantConfig {
            url: "http://localhost:6334".to_string(),
            collection_name: "docs".to_string(),
            distance: DistanceSpec {
                distance: DistanceMetric::Euc,
            },
            embedding_dimensions: 4,
            api_key: None,
        }
    }

    fn field_key(condition: &Condition) -> String {
        match &condition.condition_one_of {
            Some(ConditionOneOf::Field(field)) => field.key.clone(),
            other => panic!("unexpected condition: {:?}", other),
        }
    }

    #[test]
    fn test_distance_mapping() {
        let loader = QdrantLoader::new(&config());
        assert_eq!(loader.distance(), Distance::Euclid);
        assert_eq!(loader.name(), "qdrant");
    }

    #[test]
    fn test_build_filter_scopes_namespace_and_excludes_run() {
        let filter = MetadataFilter::stale_records("PDF", vec!["/a.pdf".into()], "run-2");
        let built = build_filter(&filter, "docs");

        let must: Vec<String> = built.must.iter().map(field_key).collect();
        assert_eq!(must, vec!["namespace", "dat_stream", "dat_record_id"]);

        let must_not: Vec<String> = built.must_not.iter().map(field_key).collect();
        assert_eq!(must_not, vec!["dat_run_id"]);
    }

    #[test]
    fn test_point_payload() {
        let stream = DocumentStream::new("PDF", "docs", WriteSyncMode::Append);
        let record = DocumentMessage::new(
            &stream,
            Data {
                document_chunk: "chunk".to_string(),
                vectors: vec![0.1, 0.2, 0.3, 0.4],
                metadata: json!({"dat_stream": "PDF", "page": 2, "nested": {"a": 1}})
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
        );

        let point = to_point(&record, "docs");
        assert!(point.payload.contains_key("dat_stream"));
        assert!(point.payload.contains_key("page"));
        assert!(!point.payload.contains_key("nested"));
        assert!(point.payload.contains_key(TEXT_FIELD));
        assert!(point.payload.contains_key(NAMESPACE_FIELD));
    }

    #[test]
    fn test_classify_keeps_transport_failures_unavailable() {
        let io = QdrantError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(
            classify(io, BackendError::LoadError),
            BackendError::Unavailable(_)
        ));

        let conversion = QdrantError::ConversionError("sparse vector".to_string());
        assert!(matches!(
            classify(conversion, BackendError::LoadError),
            BackendError::LoadError(_)
        ));
    }
}
