//! Pairs `STEP_START` with `STEP_END`/`STEP_ERROR` into completed spans for
//! timeline/tracing tooling built on top of the event stream. Not consumed
//! by the scheduler itself — purely an observability helper.

use crate::event::{Event, EventType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Error,
}

/// A completed step span, paired from a `STEP_START` and its matching
/// `STEP_END`/`STEP_ERROR`. `start`/`end` are monotonic seconds since run
/// start, matching [`Event::timestamp`](crate::event::Event::timestamp).
#[derive(Clone, Debug, PartialEq)]
pub struct StepSpan {
    pub step_name: String,
    pub start: f64,
    pub end: f64,
    pub duration_secs: f64,
    pub status: StepStatus,
}

/// Pair `STEP_START` events with their `STEP_END`/`STEP_ERROR` counterpart.
///
/// Pairing keys on `invocation_id` when both sides carry one, which is the
/// only sound way to match concurrent map workers sharing a step name: two
/// workers can complete in either order relative to when they started, so a
/// stack (LIFO) pairing by name alone would silently mismatch them whenever
/// completion order isn't the reverse of start order. Events without an
/// `invocation_id` (e.g. hand-built in a test, or from a log line stripped
/// of identity) fall back to a LIFO stack per step name.
pub fn pair_step_events(events: &[Event]) -> Vec<StepSpan> {
    use rustc_hash::FxHashMap;

    let mut starts_by_invocation: FxHashMap<&str, f64> = FxHashMap::default();
    let mut starts_by_name: FxHashMap<&str, Vec<f64>> = FxHashMap::default();
    let mut spans = Vec::new();

    for event in events {
        match event.kind {
            EventType::StepStart => {
                if let Some(id) = event.invocation_id.as_ref() {
                    starts_by_invocation.insert(id.as_str(), event.timestamp);
                } else {
                    starts_by_name.entry(event.stage.as_str()).or_default().push(event.timestamp);
                }
            }
            EventType::StepEnd | EventType::StepError => {
                let start = event
                    .invocation_id
                    .as_ref()
                    .and_then(|id| starts_by_invocation.remove(id.as_str()))
                    .or_else(|| {
                        let stack = starts_by_name.get_mut(event.stage.as_str())?;
                        let start = stack.pop()?;
                        if stack.is_empty() {
                            starts_by_name.remove(event.stage.as_str());
                        }
                        Some(start)
                    });
                if let Some(start) = start {
                    let status = if event.kind == EventType::StepEnd {
                        StepStatus::Success
                    } else {
                        StepStatus::Error
                    };
                    spans.push(StepSpan {
                        step_name: event.stage.clone(),
                        start,
                        end: event.timestamp,
                        duration_secs: event.timestamp - start,
                        status,
                    });
                }
            }
            _ => {}
        }
    }

    spans
}
