//! The run's event stream: every lifecycle signal a run emits is one
//! [`Event`], total-ordered by `seq`, and externalizable as a stable JSON
//! wire shape.
//!
//! Carries an eleven-variant lifecycle alphabet covering everything a
//! scheduled run can emit, with a `to_json_value`/`Display` pair for
//! externalizing to observers.

pub mod manager;
pub mod span;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{InvocationId, RunId};

/// The eleven lifecycle event kinds a run can emit (§3/§6). Serializes to
/// the lowercase stable strings the wire shape promises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    StepStart,
    StepEnd,
    StepError,
    Token,
    MapStart,
    MapComplete,
    BarrierWait,
    BarrierRelease,
    Suspend,
    Finish,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::StepStart => "step_start",
            EventType::StepEnd => "step_end",
            EventType::StepError => "step_error",
            EventType::Token => "token",
            EventType::MapStart => "map_start",
            EventType::MapComplete => "map_complete",
            EventType::BarrierWait => "barrier_wait",
            EventType::BarrierRelease => "barrier_release",
            EventType::Suspend => "suspend",
            EventType::Finish => "finish",
            EventType::Error => "error",
        }
    }
}

/// Which kind of node emitted an event — carried separately from
/// [`crate::step::StepKind`] because `System` has no corresponding step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Step,
    Map,
    Switch,
    Sub,
    System,
}

impl From<crate::step::StepKind> for NodeKind {
    fn from(kind: crate::step::StepKind) -> Self {
        match kind {
            crate::step::StepKind::Step => NodeKind::Step,
            crate::step::StepKind::Map => NodeKind::Map,
            crate::step::StepKind::Switch => NodeKind::Switch,
            crate::step::StepKind::Sub => NodeKind::Sub,
        }
    }
}

pub const SYSTEM_STAGE: &str = "system";

/// One immutable lifecycle record (§3's `Event`). Construct with
/// [`Event::new`] plus builder methods, or one of the named constructors
/// covering the common cases; [`crate::event::manager::EventManager`]
/// stamps `seq`/`timestamp`/`scope` before it is observable to callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub stage: String,
    pub payload: Value,
    /// Seconds elapsed on a monotonic clock since the run started (§9.1:
    /// event timestamps never use wall-clock time, only `seq` establishes
    /// total order). Stamped by [`manager::EventManager::prepare`] from a
    /// `std::time::Instant` anchored at run start.
    pub timestamp: f64,
    pub run_id: Option<RunId>,
    pub origin_run_id: Option<RunId>,
    pub parent_run_id: Option<RunId>,
    pub seq: u64,
    pub node_kind: NodeKind,
    pub invocation_id: Option<InvocationId>,
    pub parent_invocation_id: Option<InvocationId>,
    pub owner_invocation_id: Option<InvocationId>,
    pub attempt: u32,
    pub scope: Vec<InvocationId>,
    pub meta: FxHashMap<String, Value>,
}

impl Event {
    /// Build a bare event of the given kind and stage, seq/timestamp left at
    /// placeholder values for [`manager::EventManager::prepare`] to stamp.
    pub fn new(kind: EventType, stage: impl Into<String>) -> Self {
        Self {
            kind,
            stage: stage.into(),
            payload: Value::Null,
            timestamp: 0.0,
            run_id: None,
            origin_run_id: None,
            parent_run_id: None,
            seq: 0,
            node_kind: NodeKind::System,
            invocation_id: None,
            parent_invocation_id: None,
            owner_invocation_id: None,
            attempt: 0,
            scope: Vec::new(),
            meta: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_node_kind(mut self, node_kind: NodeKind) -> Self {
        self.node_kind = node_kind;
        self
    }

    #[must_use]
    pub fn with_invocation(mut self, invocation_id: InvocationId) -> Self {
        self.invocation_id = Some(invocation_id);
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn start() -> Self {
        Event::new(EventType::Start, SYSTEM_STAGE)
    }

    pub fn finish(outcome: Value) -> Self {
        Event::new(EventType::Finish, SYSTEM_STAGE).with_payload(outcome)
    }

    pub fn step_start(step: impl Into<String>, node_kind: NodeKind) -> Self {
        Event::new(EventType::StepStart, step).with_node_kind(node_kind)
    }

    pub fn step_end(step: impl Into<String>, node_kind: NodeKind, result: Value) -> Self {
        Event::new(EventType::StepEnd, step)
            .with_node_kind(node_kind)
            .with_payload(result)
    }

    pub fn step_error(step: impl Into<String>, node_kind: NodeKind, message: impl Into<String>) -> Self {
        Event::new(EventType::StepError, step)
            .with_node_kind(node_kind)
            .with_payload(Value::String(message.into()))
    }

    /// Build a `TOKEN` event for a value streamed mid-step, per §4.2's
    /// async-generator protocol.
    pub fn token(step: impl Into<String>, value: Value) -> Self {
        Event::new(EventType::Token, step).with_payload(value)
    }

    pub fn map_start(step: impl Into<String>, item_count: usize) -> Self {
        Event::new(EventType::MapStart, step).with_payload(Value::from(item_count))
    }

    pub fn map_complete(step: impl Into<String>) -> Self {
        Event::new(EventType::MapComplete, step)
    }

    pub fn barrier_wait(step: impl Into<String>) -> Self {
        Event::new(EventType::BarrierWait, step)
    }

    pub fn barrier_release(step: impl Into<String>) -> Self {
        Event::new(EventType::BarrierRelease, step)
    }

    pub fn suspend(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Event::new(EventType::Suspend, step).with_payload(Value::String(reason.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::new(EventType::Error, SYSTEM_STAGE).with_payload(Value::String(message.into()))
    }

    /// The wire shape of §6: a stable JSON object with lowercase enum
    /// values, suitable for externalization by a persistence observer.
    pub fn to_json_value(&self) -> Value {
        serde_json::json!({
            "type": self.kind.as_str(),
            "stage": self.stage,
            "timestamp": self.timestamp,
            "run_id": self.run_id,
            "origin_run_id": self.origin_run_id,
            "parent_run_id": self.parent_run_id,
            "seq": self.seq,
            "node_kind": self.node_kind,
            "invocation_id": self.invocation_id,
            "parent_invocation_id": self.parent_invocation_id,
            "owner_invocation_id": self.owner_invocation_id,
            "attempt": self.attempt,
            "scope": self.scope,
            "meta": self.meta,
            "payload": self.payload,
        })
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_json_value())
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{}] {}", self.stage, self.seq, self.kind.as_str())
    }
}
