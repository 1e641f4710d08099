//! Sync orchestration: buffers records per stream, flushes them through the
//! loader and acknowledges control messages once their effects are durable.

use futures::stream::{self, Stream, StreamExt};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::models::{
    Catalog, DocumentMessage, METADATA_RECORD_ID_FIELD, METADATA_RUN_ID_FIELD, Message,
    MetadataFilter, StateMessage, StreamKey, WriteSyncMode,
};
use crate::services::chunk::chunk;
use crate::services::loader::Loader;
use crate::services::sync_state::{SyncPhase, SyncTracker, Transition};

/// Drives one sync run against a [`Loader`].
///
/// `process` consumes the processor, so a single instance can never serve
/// two runs at once.
pub struct SyncProcessor {
    loader: Arc<dyn Loader>,
    batch_size: usize,
}

impl SyncProcessor {
    pub fn new(loader: Arc<dyn Loader>, batch_size: usize) -> Result<Self, SyncError> {
        if batch_size == 0 {
            return Err(SyncError::InvalidArgument(
                "batch size must be positive".to_string(),
            ));
        }
        Ok(Self { loader, batch_size })
    }

    /// Process `input` for the streams configured in `catalog`.
    ///
    /// The returned stream is lazy: each item pulls just enough input to
    /// produce it. Every input message is yielded after the backend work it
    /// triggers has completed. The first error ends the stream; buffered
    /// records that were not flushed by then are dropped.
    pub fn process<S>(
        self,
        catalog: Catalog,
        input: S,
    ) -> Result<impl Stream<Item = Result<Message, SyncError>>, SyncError>
    where
        S: Stream<Item = Message>,
    {
        let modes = catalog.sync_modes()?;
        let run = SyncRun {
            loader: self.loader,
            batch_size: self.batch_size,
            catalog,
            modes,
            tracker: SyncTracker::new(),
            buffers: IndexMap::new(),
            sync_initiated: false,
        };

        let state = Some((run, Box::pin(input)));
        Ok(stream::unfold(state, |state| async move {
            let Some((mut run, mut input)) = state else {
                return None;
            };
            loop {
                let Some(message) = input.next().await else {
                    return match run.finish().await {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), None)),
                    };
                };
                match run.handle(message).await {
                    Ok(Some(output)) => return Some((Ok(output), Some((run, input)))),
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        }))
    }
}

/// Mutable state of one run. Memory is bounded by
/// `batch_size * open streams` buffered records.
struct SyncRun {
    loader: Arc<dyn Loader>,
    batch_size: usize,
    catalog: Catalog,
    modes: HashMap<StreamKey, WriteSyncMode>,
    tracker: SyncTracker,
    buffers: IndexMap<StreamKey, Vec<DocumentMessage>>,
    sync_initiated: bool,
}

impl SyncRun {
    /// Apply one input message. `None` means the message is withheld from output.
    async fn handle(&mut self, message: Message) -> Result<Option<Message>, SyncError> {
        match message {
            Message::Record { record } => {
                self.on_record(&record).await?;
                Ok(Some(Message::Record { record }))
            }
            Message::State { state } => {
                if self.on_state(&state).await? {
                    Ok(Some(Message::State { state }))
                } else {
                    Ok(None)
                }
            }
            other => Ok(Some(other)),
        }
    }

    async fn on_record(&mut self, record: &DocumentMessage) -> Result<(), SyncError> {
        let key = record.key();
        if !self.modes.contains_key(&key) {
            debug!(stream = %key, "record for a stream outside the catalog, passing through");
            return Ok(());
        }

        if self.tracker.on_record(&key) == Transition::AlreadyCompleted {
            warn!(stream = %key, "record after COMPLETED, buffered until the next flush");
        }

        let buffer = self.buffers.entry(key.clone()).or_default();
        buffer.push(record.clone());
        if buffer.len() >= self.batch_size {
            self.flush(&key).await?;
        }
        Ok(())
    }

    /// Returns whether the control message should be forwarded.
    async fn on_state(&mut self, state: &StateMessage) -> Result<bool, SyncError> {
        let key = state.key();
        if !self.modes.contains_key(&key) {
            debug!(stream = %key, "state for a stream outside the catalog, passing through");
            return Ok(true);
        }

        match self
            .tracker
            .on_control(&key, state.status(), &state.stream_state.data)
        {
            Transition::Started => {
                debug!(stream = %key, "stream started");
                self.ensure_sync_initiated().await?;
            }
            Transition::Restarted => {
                info!(stream = %key, "stream restarted after COMPLETED");
            }
            Transition::Progressed => {}
            Transition::Completed => {
                self.flush(&key).await?;
                let records = self.tracker.progress(&key).map_or(0, |p| p.records);
                info!(stream = %key, records, "stream completed");
            }
            Transition::AlreadyCompleted => {
                warn!(stream = %key, "duplicate COMPLETED suppressed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn ensure_sync_initiated(&mut self) -> Result<(), SyncError> {
        if self.sync_initiated {
            return Ok(());
        }
        info!(backend = self.loader.name(), "initiating sync");
        self.loader.initiate_sync(&self.catalog).await?;
        self.sync_initiated = true;
        Ok(())
    }

    /// Hand the stream's buffered records to the loader and clear the buffer.
    async fn flush(&mut self, key: &StreamKey) -> Result<(), SyncError> {
        let records = match self.buffers.get_mut(key) {
            Some(buffer) if !buffer.is_empty() => std::mem::take(buffer),
            _ => return Ok(()),
        };
        self.ensure_sync_initiated().await?;

        let upsert = self.modes.get(key) == Some(&WriteSyncMode::Upsert);
        for batch in chunk(&records, self.batch_size)? {
            if upsert {
                self.delete_stale(key, batch).await?;
            }
            self.loader.load(batch, &key.namespace, &key.name).await?;
            debug!(stream = %key, records = batch.len(), "flushed batch");
        }
        Ok(())
    }

    /// UPSERT: remove chunks of the batch's records written by earlier runs.
    async fn delete_stale(
        &self,
        key: &StreamKey,
        batch: &[DocumentMessage],
    ) -> Result<(), SyncError> {
        let mut record_ids = IndexSet::new();
        let mut run_ids = IndexSet::new();
        for record in batch {
            let (Some(record_id), Some(run_id)) = (
                record.metadata_str(METADATA_RECORD_ID_FIELD),
                record.metadata_str(METADATA_RUN_ID_FIELD),
            ) else {
                warn!(stream = %key, "records without record or run id, skipping UPSERT delete");
                return Ok(());
            };
            record_ids.insert(record_id.to_string());
            run_ids.insert(run_id);
        }

        let mut run_ids = run_ids.into_iter();
        let (Some(run_id), None) = (run_ids.next(), run_ids.next()) else {
            warn!(stream = %key, "batch spans several runs, skipping UPSERT delete");
            return Ok(());
        };

        let filter = MetadataFilter::stale_records(&key.name, record_ids.into_iter().collect(), run_id);
        debug!(stream = %key, %filter, "deleting stale records");
        self.loader.delete(&filter, &key.namespace).await?;
        Ok(())
    }

    /// Flush every non-empty buffer at input exhaustion.
    async fn finish(&mut self) -> Result<(), SyncError> {
        let keys: Vec<StreamKey> = self.buffers.keys().cloned().collect();
        for key in keys {
            let pending = self.buffers.get(&key).map_or(0, Vec::len);
            if pending > 0 && self.tracker.phase(&key) != SyncPhase::Completed {
                info!(stream = %key, pending, "input ended before COMPLETED, flushing remaining records");
            }
            self.flush(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::models::{Data, DocumentStream, StreamStatus};
    use crate::services::loader::CheckResult;
    use async_trait::async_trait;
    use serde_json::{Map, json};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Initiate,
        Load {
            stream: String,
            namespace: String,
            chunks: Vec<String>,
        },
        Delete {
            filter: String,
            namespace: String,
        },
    }

    #[derive(Default)]
    struct RecordingLoader {
        calls: Mutex<Vec<Call>>,
        fail_load: bool,
    }

    impl RecordingLoader {
        fn failing() -> Self {
            Self {
                fail_load: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn loads(&self) -> Vec<Vec<String>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Load { chunks, .. } => Some(chunks),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Loader for RecordingLoader {
        async fn check(&self) -> Result<CheckResult, BackendError> {
            Ok(CheckResult::passed())
        }

        async fn initiate_sync(&self, _catalog: &Catalog) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(Call::Initiate);
            Ok(())
        }

        async fn load(
            &self,
            batch: &[DocumentMessage],
            namespace: &str,
            stream: &str,
        ) -> Result<(), BackendError> {
            if self.fail_load {
                return Err(BackendError::Unavailable("connection refused".to_string()));
            }
            self.calls.lock().unwrap().push(Call::Load {
                stream: stream.to_string(),
                namespace: namespace.to_string(),
                chunks: batch.iter().map(|r| r.data.document_chunk.clone()).collect(),
            });
            Ok(())
        }

        async fn delete(&self, filter: &MetadataFilter, namespace: &str) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(Call::Delete {
                filter: filter.to_string(),
                namespace: namespace.to_string(),
            });
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn doc_stream(name: &str, mode: WriteSyncMode) -> DocumentStream {
        DocumentStream::new(name, "ns", mode)
    }

    fn rec(stream: &DocumentStream, chunk: &str) -> Message {
        rec_with(stream, chunk, Map::new())
    }

    fn rec_with(stream: &DocumentStream, chunk: &str, metadata: Map<String, serde_json::Value>) -> Message {
        Message::record(DocumentMessage::new(
            stream,
            Data {
                document_chunk: chunk.to_string(),
                vectors: vec![0.1, 0.2],
                metadata,
            },
        ))
    }

    fn state(stream: &DocumentStream, status: StreamStatus) -> Message {
        Message::state(StateMessage::new(stream, status, Map::new()))
    }

    fn label(message: &Message) -> String {
        match message {
            Message::Record { record } => record.data.document_chunk.clone(),
            Message::State { state } => format!("{}:{:?}", state.stream.name, state.status()),
            Message::Log { log } => format!("log:{}", log.message),
            Message::ConnectionStatus { .. } => "status".to_string(),
        }
    }

    async fn run(
        loader: &Arc<RecordingLoader>,
        batch_size: usize,
        catalog: Catalog,
        input: Vec<Message>,
    ) -> (Vec<String>, Option<SyncError>) {
        let processor = SyncProcessor::new(loader.clone(), batch_size).unwrap();
        let output = processor
            .process(catalog, stream::iter(input))
            .unwrap();
        futures::pin_mut!(output);

        let mut labels = Vec::new();
        while let Some(item) = output.next().await {
            match item {
                Ok(message) => labels.push(label(&message)),
                Err(e) => return (labels, Some(e)),
            }
        }
        (labels, None)
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let loader: Arc<dyn Loader> = Arc::new(RecordingLoader::default());
        assert!(matches!(
            SyncProcessor::new(loader, 0),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_flush_then_completed() {
        let loader = Arc::new(RecordingLoader::default());
        let s = doc_stream("PDF", WriteSyncMode::Append);
        let catalog = Catalog::new(vec![s.clone()]);
        let input = vec![
            rec(&s, "a"),
            rec(&s, "b"),
            rec(&s, "c"),
            state(&s, StreamStatus::Completed),
        ];

        let processor = SyncProcessor::new(loader.clone(), 2).unwrap();
        let output = processor.process(catalog, stream::iter(input)).unwrap();
        futures::pin_mut!(output);

        assert_eq!(label(&output.next().await.unwrap().unwrap()), "a");
        assert!(loader.loads().is_empty());
        assert_eq!(label(&output.next().await.unwrap().unwrap()), "b");
        assert_eq!(loader.loads(), vec![vec!["a", "b"]]);
        assert_eq!(label(&output.next().await.unwrap().unwrap()), "c");
        assert_eq!(loader.loads().len(), 1);
        assert_eq!(label(&output.next().await.unwrap().unwrap()), "PDF:Completed");
        assert_eq!(loader.loads(), vec![vec!["a", "b"], vec!["c"]]);
        assert!(output.next().await.is_none());

        assert_eq!(
            loader.calls().last(),
            Some(&Call::Load {
                stream: "PDF".to_string(),
                namespace: "ns".to_string(),
                chunks: vec!["c".to_string()],
            })
        );
    }

    #[tokio::test]
    async fn test_interleaved_streams_complete_independently() {
        let loader = Arc::new(RecordingLoader::default());
        let pdf = doc_stream("PDF", WriteSyncMode::Append);
        let csv = doc_stream("CSV", WriteSyncMode::Append);
        let catalog = Catalog::new(vec![pdf.clone(), csv.clone()]);
        let input = vec![
            state(&pdf, StreamStatus::Started),
            state(&csv, StreamStatus::Started),
            rec(&pdf, "p1"),
            rec(&csv, "c1"),
            rec(&pdf, "p2"),
            state(&pdf, StreamStatus::Completed),
            rec(&csv, "c2"),
            state(&csv, StreamStatus::Completed),
        ];

        let (labels, err) = run(&loader, 1000, catalog, input).await;
        assert!(err.is_none());
        assert_eq!(
            labels,
            vec![
                "PDF:Started",
                "CSV:Started",
                "p1",
                "c1",
                "p2",
                "PDF:Completed",
                "c2",
                "CSV:Completed"
            ]
        );
        assert_eq!(
            loader.calls(),
            vec![
                Call::Initiate,
                Call::Load {
                    stream: "PDF".to_string(),
                    namespace: "ns".to_string(),
                    chunks: vec!["p1".to_string(), "p2".to_string()],
                },
                Call::Load {
                    stream: "CSV".to_string(),
                    namespace: "ns".to_string(),
                    chunks: vec!["c1".to_string(), "c2".to_string()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_replace_initiates_before_first_load() {
        let loader = Arc::new(RecordingLoader::default());
        let s = doc_stream("PDF", WriteSyncMode::Replace);
        let catalog = Catalog::new(vec![s.clone()]);

        let processor = SyncProcessor::new(loader.clone(), 10).unwrap();
        let output = processor
            .process(
                catalog,
                stream::iter(vec![
                    state(&s, StreamStatus::Started),
                    rec(&s, "a"),
                    state(&s, StreamStatus::Completed),
                ]),
            )
            .unwrap();
        futures::pin_mut!(output);

        output.next().await.unwrap().unwrap();
        assert_eq!(loader.calls(), vec![Call::Initiate]);
        output.next().await.unwrap().unwrap();
        assert_eq!(loader.calls().len(), 1);
        let completed = output.next().await.unwrap().unwrap();
        assert_eq!(label(&completed), "PDF:Completed");
        assert_eq!(loader.calls().len(), 2);
        assert_eq!(loader.calls()[0], Call::Initiate);
        assert_eq!(loader.loads(), vec![vec!["a"]]);
    }

    #[tokio::test]
    async fn test_final_flush_without_completed() {
        let loader = Arc::new(RecordingLoader::default());
        let s = doc_stream("PDF", WriteSyncMode::Append);
        let catalog = Catalog::new(vec![s.clone()]);

        let (labels, err) = run(&loader, 1000, catalog, vec![rec(&s, "only")]).await;
        assert!(err.is_none());
        assert_eq!(labels, vec!["only"]);
        // No STARTED arrived, so initiation happens lazily before the load.
        assert_eq!(loader.calls()[0], Call::Initiate);
        assert_eq!(loader.loads(), vec![vec!["only"]]);
    }

    #[tokio::test]
    async fn test_unknown_stream_passes_through() {
        let loader = Arc::new(RecordingLoader::default());
        let known = doc_stream("PDF", WriteSyncMode::Append);
        let unknown = doc_stream("Other", WriteSyncMode::Append);
        let catalog = Catalog::new(vec![known]);
        let input = vec![
            state(&unknown, StreamStatus::Started),
            rec(&unknown, "x"),
            state(&unknown, StreamStatus::Completed),
            state(&unknown, StreamStatus::Completed),
        ];

        let (labels, err) = run(&loader, 1, catalog, input).await;
        assert!(err.is_none());
        assert_eq!(
            labels,
            vec!["Other:Started", "x", "Other:Completed", "Other:Completed"]
        );
        assert!(loader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_withholds_completed() {
        let loader = Arc::new(RecordingLoader::failing());
        let s = doc_stream("PDF", WriteSyncMode::Append);
        let catalog = Catalog::new(vec![s.clone()]);
        let input = vec![
            state(&s, StreamStatus::Started),
            rec(&s, "a"),
            state(&s, StreamStatus::Completed),
            rec(&s, "never"),
        ];

        let (labels, err) = run(&loader, 1000, catalog, input).await;
        assert_eq!(labels, vec!["PDF:Started", "a"]);
        assert!(matches!(
            err,
            Some(SyncError::Backend(BackendError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_catalog_without_write_mode_is_rejected() {
        let loader: Arc<dyn Loader> = Arc::new(RecordingLoader::default());
        let mut s = doc_stream("PDF", WriteSyncMode::Append);
        s.write_sync_mode = None;

        let processor = SyncProcessor::new(loader, 10).unwrap();
        let result = processor.process(Catalog::new(vec![s]), stream::iter(Vec::<Message>::new()));
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_upsert_deletes_stale_records_before_load() {
        let loader = Arc::new(RecordingLoader::default());
        let s = doc_stream("PDF", WriteSyncMode::Upsert);
        let catalog = Catalog::new(vec![s.clone()]);
        let metadata = |id: &str| {
            json!({"dat_record_id": id, "dat_run_id": "run-2"})
                .as_object()
                .cloned()
                .unwrap()
        };
        let input = vec![
            rec_with(&s, "a1", metadata("/a.pdf")),
            rec_with(&s, "a2", metadata("/a.pdf")),
            rec_with(&s, "b1", metadata("/b.pdf")),
            state(&s, StreamStatus::Completed),
        ];

        let (_, err) = run(&loader, 1000, catalog, input).await;
        assert!(err.is_none());

        let calls = loader.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], Call::Initiate);
        assert_eq!(
            calls[1],
            Call::Delete {
                filter: MetadataFilter::stale_records(
                    "PDF",
                    vec!["/a.pdf".to_string(), "/b.pdf".to_string()],
                    "run-2"
                )
                .to_string(),
                namespace: "ns".to_string(),
            }
        );
        assert!(matches!(calls[2], Call::Load { .. }));
    }

    #[tokio::test]
    async fn test_upsert_without_record_ids_skips_delete() {
        let loader = Arc::new(RecordingLoader::default());
        let s = doc_stream("PDF", WriteSyncMode::Upsert);
        let catalog = Catalog::new(vec![s.clone()]);

        let (_, err) = run(&loader, 1000, catalog, vec![rec(&s, "a")]).await;
        assert!(err.is_none());
        assert!(
            !loader
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Delete { .. }))
        );
        assert_eq!(loader.loads(), vec![vec!["a"]]);
    }

    #[tokio::test]
    async fn test_duplicate_completed_suppressed_until_restart() {
        let loader = Arc::new(RecordingLoader::default());
        let s = doc_stream("PDF", WriteSyncMode::Append);
        let catalog = Catalog::new(vec![s.clone()]);
        let input = vec![
            state(&s, StreamStatus::Started),
            rec(&s, "a"),
            state(&s, StreamStatus::Completed),
            state(&s, StreamStatus::Completed),
            state(&s, StreamStatus::Started),
            rec(&s, "b"),
            state(&s, StreamStatus::Completed),
        ];

        let (labels, err) = run(&loader, 1000, catalog, input).await;
        assert!(err.is_none());
        assert_eq!(
            labels,
            vec![
                "PDF:Started",
                "a",
                "PDF:Completed",
                "PDF:Started",
                "b",
                "PDF:Completed"
            ]
        );
        assert_eq!(loader.loads(), vec![vec!["a"], vec!["b"]]);
    }

    #[tokio::test]
    async fn test_record_after_completed_does_not_reopen_stream() {
        let loader = Arc::new(RecordingLoader::default());
        let s = doc_stream("PDF", WriteSyncMode::Append);
        let catalog = Catalog::new(vec![s.clone()]);
        let input = vec![
            state(&s, StreamStatus::Started),
            rec(&s, "a"),
            state(&s, StreamStatus::Completed),
            rec(&s, "b"),
            state(&s, StreamStatus::Completed),
        ];

        let (labels, err) = run(&loader, 1000, catalog, input).await;
        assert!(err.is_none());
        assert_eq!(labels, vec!["PDF:Started", "a", "PDF:Completed", "b"]);
        // The late record still reaches the backend through the final flush.
        assert_eq!(loader.loads(), vec![vec!["a"], vec!["b"]]);
    }

    #[tokio::test]
    async fn test_completed_without_records_is_acknowledged() {
        let loader = Arc::new(RecordingLoader::default());
        let s = doc_stream("PDF", WriteSyncMode::Append);
        let catalog = Catalog::new(vec![s.clone()]);
        let input = vec![
            state(&s, StreamStatus::Started),
            state(&s, StreamStatus::Completed),
        ];

        let (labels, err) = run(&loader, 1000, catalog, input).await;
        assert!(err.is_none());
        assert_eq!(labels, vec!["PDF:Started", "PDF:Completed"]);
        assert_eq!(loader.calls(), vec![Call::Initiate]);
    }

    #[tokio::test]
    async fn test_initiate_sync_runs_once_per_run() {
        let loader = Arc::new(RecordingLoader::default());
        let pdf = doc_stream("PDF", WriteSyncMode::Replace);
        let csv = doc_stream("CSV", WriteSyncMode::Replace);
        let catalog = Catalog::new(vec![pdf.clone(), csv.clone()]);
        let input = vec![
            state(&pdf, StreamStatus::Started),
            state(&csv, StreamStatus::Started),
            rec(&pdf, "p"),
            rec(&csv, "c"),
        ];

        let (_, err) = run(&loader, 1, catalog, input).await;
        assert!(err.is_none());
        let initiations = loader
            .calls()
            .iter()
            .filter(|c| **c == Call::Initiate)
            .count();
        assert_eq!(initiations, 1);
        assert_eq!(loader.loads(), vec![vec!["p"], vec!["c"]]);
    }

    #[tokio::test]
    async fn test_log_messages_pass_through() {
        let loader = Arc::new(RecordingLoader::default());
        let input = vec![Message::Log {
            log: serde_json::from_value(json!({"level": "INFO", "message": "hello"})).unwrap(),
        }];

        let (labels, err) = run(&loader, 10, Catalog::default(), input).await;
        assert!(err.is_none());
        assert_eq!(labels, vec!["log:hello"]);
    }
}
