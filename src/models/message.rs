//! Protocol messages exchanged with the upstream source, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::catalog::{DocumentStream, StreamKey};

/// Metadata key carrying the stream name a chunk was read from.
pub const METADATA_STREAM_FIELD: &str = "dat_stream";
/// Metadata key carrying the stable id of the source entity a chunk belongs to.
pub const METADATA_RECORD_ID_FIELD: &str = "dat_record_id";
/// Metadata key carrying the id of the sync run that produced a chunk.
pub const METADATA_RUN_ID_FIELD: &str = "dat_run_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Record {
        record: DocumentMessage,
    },
    State {
        state: StateMessage,
    },
    Log {
        log: LogMessage,
    },
    ConnectionStatus {
        #[serde(rename = "connectionStatus")]
        connection_status: ConnectionStatus,
    },
}

impl Message {
    pub fn record(record: DocumentMessage) -> Self {
        Message::Record { record }
    }

    pub fn state(state: StateMessage) -> Self {
        Message::State { state }
    }
}

/// Payload of a document record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub document_chunk: String,
    pub vectors: Vec<f32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A single document chunk with its embedding, addressed to one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMessage {
    pub data: Data,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub stream: DocumentStream,
}

impl DocumentMessage {
    pub fn new(stream: &DocumentStream, data: Data) -> Self {
        Self {
            data,
            namespace: stream.namespace.clone(),
            stream: stream.clone(),
        }
    }

    /// The record's own namespace, falling back to its stream's.
    pub fn namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .unwrap_or_else(|| self.stream.namespace())
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.stream.name, self.namespace())
    }

    /// String-valued metadata entry, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.data.metadata.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamStatus {
    Started,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub data: Map<String, Value>,
    pub stream_status: StreamStatus,
}

/// Lifecycle control record for one stream, carrying a resumption payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub stream: DocumentStream,
    pub stream_state: StreamState,
}

impl StateMessage {
    pub fn new(stream: &DocumentStream, status: StreamStatus, data: Map<String, Value>) -> Self {
        Self {
            stream: stream.clone(),
            stream_state: StreamState {
                data,
                stream_status: status,
            },
        }
    }

    pub fn key(&self) -> StreamKey {
        self.stream.key()
    }

    pub fn status(&self) -> StreamStatus {
        self.stream_state.stream_status
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: Status,
    pub message: Option<String>,
}

impl ConnectionStatus {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            message: Some(message.into()),
        }
    }
}
