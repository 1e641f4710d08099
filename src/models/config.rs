use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Records buffered per stream before they are handed to the backend.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Environment variable overriding the batch size.
pub const BATCH_SIZE_ENV: &str = "VDEST_BATCH_SIZE";

pub const DEFAULT_PINECONE_CONTROLLER_URL: &str = "https://api.pinecone.io";

/// Destination configuration, selected by `module_name`.
///
/// ```json
/// {"name": "Qdrant", "module_name": "qdrant", "connection_specification": {...}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "module_name",
    content = "connection_specification",
    rename_all = "lowercase"
)]
pub enum DestinationConfig {
    Qdrant(QdrantConfig),
    Pinecone(PineconeConfig),
    Weaviate(WeaviateConfig),
    Milvus(MilvusConfig),
}

impl DestinationConfig {
    /// Load a configuration file. `.toml` files are parsed as TOML, anything
    /// else as JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DestinationConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn module_name(&self) -> &'static str {
        match self {
            DestinationConfig::Qdrant(_) => "qdrant",
            DestinationConfig::Pinecone(_) => "pinecone",
            DestinationConfig::Weaviate(_) => "weaviate",
            DestinationConfig::Milvus(_) => "milvus",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DestinationConfig::Qdrant(c) => {
                require("url", &c.url)?;
                require("collection_name", &c.collection_name)?;
                require_dimension(c.embedding_dimensions)
            }
            DestinationConfig::Pinecone(c) => {
                require("pinecone_index", &c.pinecone_index)?;
                require("pinecone_api_key", &c.pinecone_api_key)?;
                require_dimension(c.embedding_dimensions)
            }
            DestinationConfig::Weaviate(c) => require("cluster_url", &c.cluster_url),
            DestinationConfig::Milvus(c) => {
                require("uri", &c.uri)?;
                require("collection_name", &c.collection_name)?;
                require_dimension(c.embedding_dimensions)
            }
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

fn require_dimension(dimension: u64) -> Result<(), ConfigError> {
    if dimension == 0 {
        return Err(ConfigError::ValidationError(
            "embedding_dimensions must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Accepts the dimension as a number or a numeric string (as produced by
/// environment-variable templating).
fn deserialize_dimension<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Dimension {
        Number(u64),
        Text(String),
    }

    match Dimension::deserialize(deserializer)? {
        Dimension::Number(n) => Ok(n),
        Dimension::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Dot,
    Cos,
    Euc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceSpec {
    pub distance: DistanceMetric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    pub url: String,

    pub collection_name: String,

    pub distance: DistanceSpec,

    #[serde(deserialize_with = "deserialize_dimension")]
    pub embedding_dimensions: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PineconeConfig {
    pub pinecone_index: String,

    #[serde(default)]
    pub pinecone_environment: String,

    pub pinecone_api_key: String,

    #[serde(deserialize_with = "deserialize_dimension")]
    pub embedding_dimensions: u64,

    #[serde(default = "default_pinecone_controller_url")]
    pub controller_url: String,

    /// Pause between id-batch deletes while purging by metadata.
    #[serde(default = "default_delete_settle_secs")]
    pub delete_settle_secs: u64,
}

fn default_pinecone_controller_url() -> String {
    DEFAULT_PINECONE_CONTROLLER_URL.to_string()
}

fn default_delete_settle_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "authentication", rename_all = "snake_case")]
pub enum Authentication {
    #[default]
    NoAuthentication,
    BasicAuthentication {
        username: String,
        password: String,
    },
    ApiKeyAuthentication {
        api_key: String,
    },
    TokenAuthentication {
        token: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaviateConfig {
    pub cluster_url: String,

    /// When set, loads reject vectors of any other length.
    #[serde(default)]
    pub embedding_dimensions: Option<u64>,

    #[serde(default)]
    pub authentication: Authentication,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilvusConfig {
    pub uri: String,

    pub collection_name: String,

    #[serde(deserialize_with = "deserialize_dimension", alias = "embedding_dimension")]
    pub embedding_dimensions: u64,

    #[serde(default)]
    pub authentication: Authentication,
}

/// Batch size from the environment, falling back to the default.
pub fn batch_size_from_env() -> usize {
    std::env::var(BATCH_SIZE_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_BATCH_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_qdrant_json() {
        let json = r#"{
            "name": "Qdrant",
            "module_name": "qdrant",
            "connection_specification": {
                "url": "http://localhost:6334",
                "collection_name": "docs",
                "distance": {"distance": "cos"},
                "embedding_dimensions": "1536"
            }
        }"#;
        let config: DestinationConfig = serde_json::from_str(json).unwrap();
        let DestinationConfig::Qdrant(qdrant) = &config else {
            panic!("expected qdrant config");
        };
        assert_eq!(qdrant.embedding_dimensions, 1536);
        assert_eq!(qdrant.distance.distance, DistanceMetric::Cos);
        assert_eq!(config.module_name(), "qdrant");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_weaviate_authentication() {
        let json = r#"{
            "module_name": "weaviate",
            "connection_specification": {
                "cluster_url": "http://localhost:8080",
                "authentication": {"authentication": "api_key_authentication", "api_key": "k"}
            }
        }"#;
        let config: DestinationConfig = serde_json::from_str(json).unwrap();
        let DestinationConfig::Weaviate(weaviate) = config else {
            panic!("expected weaviate config");
        };
        assert_eq!(
            weaviate.authentication,
            Authentication::ApiKeyAuthentication {
                api_key: "k".to_string()
            }
        );
    }

    #[test]
    fn test_pinecone_defaults() {
        let json = r#"{
            "module_name": "pinecone",
            "connection_specification": {
                "pinecone_index": "idx",
                "pinecone_api_key": "key",
                "embedding_dimensions": 8
            }
        }"#;
        let config: DestinationConfig = serde_json::from_str(json).unwrap();
        let DestinationConfig::Pinecone(pinecone) = config else {
            panic!("expected pinecone config");
        };
        assert_eq!(pinecone.controller_url, DEFAULT_PINECONE_CONTROLLER_URL);
        assert_eq!(pinecone.delete_settle_secs, 20);
    }

    #[test]
    fn test_validation_rejects_zero_dimension() {
        let config = DestinationConfig::Milvus(MilvusConfig {
            uri: "http://localhost:19530".to_string(),
            collection_name: "c".to_string(),
            embedding_dimensions: 0,
            authentication: Authentication::NoAuthentication,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
name = "Milvus"
module_name = "milvus"

[connection_specification]
uri = "http://localhost:19530"
collection_name = "test_collection"
embedding_dimension = 1536
"#
        )
        .unwrap();

        let config = DestinationConfig::load(file.path()).unwrap();
        let DestinationConfig::Milvus(milvus) = config else {
            panic!("expected milvus config");
        };
        assert_eq!(milvus.embedding_dimensions, 1536);
        assert_eq!(milvus.authentication, Authentication::NoAuthentication);
    }

    #[test]
    fn test_load_json_file_rejects_empty_url() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"module_name": "weaviate", "connection_specification": {{"cluster_url": " "}}}}"#
        )
        .unwrap();

        assert!(DestinationConfig::load(file.path()).is_err());
    }
}
