//! Configured catalog: the set of streams a sync run is expected to write.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use crate::error::SyncError;

/// How records of a stream interact with previously written records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteSyncMode {
    /// Always insert.
    Append,
    /// Delete every prior record of the stream before the first write of a run.
    Replace,
    /// Supersede prior versions of the same record.
    Upsert,
}

impl fmt::Display for WriteSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteSyncMode::Append => write!(f, "APPEND"),
            WriteSyncMode::Replace => write!(f, "REPLACE"),
            WriteSyncMode::Upsert => write!(f, "UPSERT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadSyncMode {
    FullRefresh,
    Incremental,
}

/// A stream descriptor as it appears in the catalog and on every message.
///
/// Keys this crate does not interpret are kept in `extra` so that messages
/// are forwarded downstream unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStream {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_sync_mode: Option<ReadSyncMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_sync_mode: Option<WriteSyncMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_field: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DocumentStream {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, mode: WriteSyncMode) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            read_sync_mode: Some(ReadSyncMode::Incremental),
            write_sync_mode: Some(mode),
            cursor_field: None,
            extra: Map::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.name, self.namespace())
    }
}

/// Identity of a logical sync target: `(stream name, namespace)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub name: String,
    pub namespace: String,
}

impl StreamKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub document_streams: Vec<DocumentStream>,
}

impl Catalog {
    pub fn new(document_streams: Vec<DocumentStream>) -> Self {
        Self { document_streams }
    }

    /// Resolve the write mode of every configured stream identity.
    ///
    /// Fails with `InvalidArgument` when an entry lacks a write mode or the
    /// same identity is configured twice with different modes.
    pub fn sync_modes(&self) -> Result<HashMap<StreamKey, WriteSyncMode>, SyncError> {
        let mut modes = HashMap::with_capacity(self.document_streams.len());

        for stream in &self.document_streams {
            let key = stream.key();
            let mode = stream.write_sync_mode.ok_or_else(|| {
                SyncError::InvalidArgument(format!("stream {} has no write_sync_mode", key))
            })?;

            if let Some(previous) = modes.insert(key.clone(), mode)
                && previous != mode
            {
                return Err(SyncError::InvalidArgument(format!(
                    "stream {} configured as both {} and {}",
                    key, previous, mode
                )));
            }
        }

        Ok(modes)
    }

    /// Streams configured with the given write mode.
    pub fn streams_with_mode(&self, mode: WriteSyncMode) -> impl Iterator<Item = &DocumentStream> {
        self.document_streams
            .iter()
            .filter(move |s| s.write_sync_mode == Some(mode))
    }
}
