//! Per-stream sync lifecycle tracking.
//!
//! Each stream identity moves `Unseen -> Started -> Running -> Completed`.
//! A STARTED after COMPLETED opens a new sub-run for the same identity.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::models::{StreamKey, StreamStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Unseen,
    Started,
    Running,
    Completed,
}

/// What a message did to a stream's lifecycle; drives the processor's side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First STARTED seen for the identity in this run.
    Started,
    /// STARTED after COMPLETED: a new sub-run of the same identity.
    Restarted,
    /// Records flowing, or a STARTED/RUNNING that changes nothing.
    Progressed,
    /// The stream finished; its buffer must be flushed before acknowledging.
    Completed,
    /// COMPLETED, or a record, for a stream that is already completed.
    AlreadyCompleted,
}

#[derive(Debug, Clone, Default)]
pub struct StreamProgress {
    pub phase: SyncPhase,
    /// Records seen in the current sub-run.
    pub records: u64,
    /// Latest state payload received for the stream.
    pub payload: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct SyncTracker {
    streams: HashMap<StreamKey, StreamProgress>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a control record.
    pub fn on_control(
        &mut self,
        key: &StreamKey,
        status: StreamStatus,
        payload: &Map<String, Value>,
    ) -> Transition {
        let progress = self.streams.entry(key.clone()).or_default();
        progress.payload.clone_from(payload);

        match (status, progress.phase) {
            (StreamStatus::Started, SyncPhase::Unseen) => {
                progress.phase = SyncPhase::Started;
                Transition::Started
            }
            (StreamStatus::Started, SyncPhase::Completed) => {
                progress.phase = SyncPhase::Started;
                progress.records = 0;
                Transition::Restarted
            }
            (StreamStatus::Started, _) => Transition::Progressed,
            (StreamStatus::Running, SyncPhase::Unseen | SyncPhase::Started) => {
                progress.phase = SyncPhase::Running;
                Transition::Progressed
            }
            (StreamStatus::Running, _) => Transition::Progressed,
            (StreamStatus::Completed, SyncPhase::Completed) => Transition::AlreadyCompleted,
            (StreamStatus::Completed, _) => {
                progress.phase = SyncPhase::Completed;
                Transition::Completed
            }
        }
    }

    /// Account for a document record; implicitly moves the stream to RUNNING.
    ///
    /// COMPLETED is terminal until the next STARTED: a late record is counted
    /// but leaves the phase untouched.
    pub fn on_record(&mut self, key: &StreamKey) -> Transition {
        let progress = self.streams.entry(key.clone()).or_default();
        progress.records += 1;
        match progress.phase {
            SyncPhase::Completed => Transition::AlreadyCompleted,
            _ => {
                progress.phase = SyncPhase::Running;
                Transition::Progressed
            }
        }
    }

    pub fn phase(&self, key: &StreamKey) -> SyncPhase {
        self.streams
            .get(key)
            .map_or(SyncPhase::Unseen, |progress| progress.phase)
    }

    pub fn progress(&self, key: &StreamKey) -> Option<&StreamProgress> {
        self.streams.get(key)
    }
}
