mod catalog;
mod config;
mod filter;
mod message;

pub use catalog::{Catalog, DocumentStream, ReadSyncMode, StreamKey, WriteSyncMode};
pub use config::{
    Authentication, BATCH_SIZE_ENV, DEFAULT_BATCH_SIZE, DEFAULT_PINECONE_CONTROLLER_URL,
    DestinationConfig, DistanceMetric, DistanceSpec, MilvusConfig, PineconeConfig, QdrantConfig,
    WeaviateConfig, batch_size_from_env,
};
pub use filter::{FieldCondition, Match, MetadataFilter};
pub use message::{
    ConnectionStatus, Data, DocumentMessage, LogMessage, METADATA_RECORD_ID_FIELD,
    METADATA_RUN_ID_FIELD, METADATA_STREAM_FIELD, Message, StateMessage, Status, StreamState,
    StreamStatus,
};
