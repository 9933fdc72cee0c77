//! The storage-backend seam (§6): `save_run` is consumed by an
//! auto-persistence observer external to this core. Persistence-to-disk
//! itself is an explicit Non-goal — only the trait boundary lives here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;

use crate::event::Event;
use crate::failure::outcome::TerminalStatus;
use crate::ids::RunId;

/// Summary of one completed (or still-running) pipeline run, handed to a
/// [`RunRecorder`] alongside its serialized event log.
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub run_id: RunId,
    pub pipe_name: String,
    pub status: Option<TerminalStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, Diagnostic)]
#[error("failed to persist run {run_id}: {message}")]
#[diagnostic(code(workweave::recorder::save_failed))]
pub struct RecorderError {
    pub run_id: RunId,
    pub message: String,
}

/// A storage backend for run history. The engine never calls this
/// directly — it is consumed by an external auto-persistence [`Observer`]
/// that subscribes to the event stream and forwards batches to
/// `save_run`, matching §6's "Environment / persistence collaborator".
///
/// [`Observer`]: crate::event::manager::Observer
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn save_run(
        &self,
        record: RunRecord,
        events: Vec<serde_json::Value>,
    ) -> Result<(), RecorderError>;
}

/// An in-memory [`RunRecorder`] suitable for tests and the `recorder-example`
/// feature's demos: appends every saved run to a `parking_lot`-guarded
/// `Vec`.
#[cfg(feature = "recorder-example")]
#[derive(Default)]
pub struct InMemoryRunRecorder {
    runs: parking_lot::Mutex<Vec<(RunRecord, Vec<serde_json::Value>)>>,
}

#[cfg(feature = "recorder-example")]
impl InMemoryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_runs(&self) -> Vec<(RunRecord, Vec<serde_json::Value>)> {
        self.runs.lock().clone()
    }
}

#[cfg(feature = "recorder-example")]
#[async_trait]
impl RunRecorder for InMemoryRunRecorder {
    async fn save_run(
        &self,
        record: RunRecord,
        events: Vec<serde_json::Value>,
    ) -> Result<(), RecorderError> {
        self.runs.lock().push((record, events));
        Ok(())
    }
}

/// Helper for building the `events` argument to `save_run` from a run's
/// published [`Event`]s.
pub fn serialize_events(events: &[Event]) -> Vec<serde_json::Value> {
    events.iter().map(Event::to_json_value).collect()
}
