//! In-memory runtime metrics (§4.7): subscribes to the event stream and
//! maintains counters a `FINISH` payload snapshots on demand. Never
//! persisted — the explicit Non-goal is metric exporters beyond this
//! snapshot.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventType};

/// Running (count, total, min, max) for one step's observed latencies.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StepTiming {
    pub count: u64,
    pub total_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
}

impl StepTiming {
    fn observe(&mut self, secs: f64) {
        if self.count == 0 {
            self.min_secs = secs;
            self.max_secs = secs;
        } else {
            self.min_secs = self.min_secs.min(secs);
            self.max_secs = self.max_secs.max(secs);
        }
        self.count += 1;
        self.total_secs += secs;
    }
}

/// Per-barrier wait/release/timeout counters keyed by the waiting step.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BarrierMetrics {
    pub waits: u64,
    pub releases: u64,
    pub timeouts: u64,
    pub total_wait_secs: f64,
    pub max_wait_secs: f64,
}

/// Map fan-out counters keyed by the owning map step.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MapMetrics {
    pub maps_started: u64,
    pub maps_completed: u64,
    pub workers_started: u64,
    pub peak_workers: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub high_water_mark: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub started: u64,
    pub completed: u64,
    pub peak_active: u64,
}

/// A point-in-time snapshot of everything [`RuntimeMetricsRecorder`] has
/// accumulated over the lifetime of a run. Embedded verbatim in the
/// `FINISH` event payload (§6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub event_counts: FxHashMap<String, u64>,
    pub token_count: u64,
    pub suspend_count: u64,
    pub step_timings: FxHashMap<String, StepTiming>,
    pub barrier_metrics: FxHashMap<String, BarrierMetrics>,
    pub map_metrics: FxHashMap<String, MapMetrics>,
    pub queue: QueueMetrics,
    pub tasks: TaskMetrics,
}

/// Accumulates counters from every event the scheduler publishes. One
/// instance per run, fed by [`RuntimeMetricsRecorder::on_event`] from the
/// same consumer-loop thread of control that owns everything else in §3 —
/// no internal locking is needed.
#[derive(Debug, Default)]
pub struct RuntimeMetricsRecorder {
    snapshot: RuntimeMetrics,
    step_starts: FxHashMap<String, f64>,
    active_tasks: u64,
    active_workers: FxHashMap<String, u64>,
}

impl RuntimeMetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `count` worker tasks are now queued/spawned for `owner`,
    /// updating the high-water mark for total active tasks.
    pub fn on_task_spawned(&mut self, owner: &str, is_map_worker: bool) {
        self.active_tasks += 1;
        self.snapshot.tasks.started += 1;
        self.snapshot.tasks.peak_active = self.snapshot.tasks.peak_active.max(self.active_tasks);
        if is_map_worker {
            let entry = self.snapshot.map_metrics.entry(owner.to_string()).or_default();
            entry.workers_started += 1;
            let active = self.active_workers.entry(owner.to_string()).or_insert(0);
            *active += 1;
            entry.peak_workers = entry.peak_workers.max(*active);
        }
    }

    pub fn on_task_completed(&mut self, owner: &str, is_map_worker: bool) {
        self.active_tasks = self.active_tasks.saturating_sub(1);
        self.snapshot.tasks.completed += 1;
        if is_map_worker {
            if let Some(active) = self.active_workers.get_mut(owner) {
                *active = active.saturating_sub(1);
            }
        }
    }

    pub fn on_queue_depth(&mut self, depth: u64) {
        self.snapshot.queue.high_water_mark = self.snapshot.queue.high_water_mark.max(depth);
    }

    pub fn on_barrier_wait(&mut self, step: &str) {
        self.snapshot.barrier_metrics.entry(step.to_string()).or_default().waits += 1;
    }

    pub fn on_barrier_release(&mut self, step: &str, waited_secs: f64) {
        let entry = self.snapshot.barrier_metrics.entry(step.to_string()).or_default();
        entry.releases += 1;
        entry.total_wait_secs += waited_secs;
        entry.max_wait_secs = entry.max_wait_secs.max(waited_secs);
    }

    pub fn on_barrier_timeout(&mut self, step: &str) {
        self.snapshot.barrier_metrics.entry(step.to_string()).or_default().timeouts += 1;
    }

    /// Feed one published event into the accumulators. Per-invocation
    /// timing is keyed by `invocation_id` when present, falling back to
    /// `stage`, so concurrent map workers sharing a step name still time
    /// independently.
    pub fn on_event(&mut self, event: &Event) {
        *self.snapshot.event_counts.entry(event.kind.as_str().to_string()).or_insert(0) += 1;

        let timing_key = event
            .invocation_id
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| event.stage.clone());

        match event.kind {
            EventType::StepStart => {
                self.step_starts.insert(timing_key, event.timestamp);
            }
            EventType::StepEnd | EventType::StepError => {
                if let Some(start) = self.step_starts.remove(&timing_key) {
                    let end = event.timestamp;
                    self.snapshot
                        .step_timings
                        .entry(event.stage.clone())
                        .or_default()
                        .observe((end - start).max(0.0));
                }
            }
            EventType::Token => self.snapshot.token_count += 1,
            EventType::Suspend => self.snapshot.suspend_count += 1,
            EventType::MapStart => {
                self.snapshot.map_metrics.entry(event.stage.clone()).or_default().maps_started += 1;
            }
            EventType::MapComplete => {
                self.snapshot.map_metrics.entry(event.stage.clone()).or_default().maps_completed += 1;
            }
            EventType::BarrierWait => self.on_barrier_wait(&event.stage),
            _ => {}
        }
    }

    /// Produce a clone of the accumulated metrics for embedding in the
    /// `FINISH` payload.
    pub fn snapshot(&self) -> RuntimeMetrics {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeKind;

    #[test]
    fn step_timing_tracks_count_and_bounds() {
        let mut recorder = RuntimeMetricsRecorder::new();
        let mut start = Event::step_start("a", NodeKind::Step);
        start.invocation_id = None;
        recorder.on_event(&start);
        let mut end = Event::step_end("a", NodeKind::Step, serde_json::Value::Null);
        end.timestamp = start.timestamp + 0.25;
        recorder.on_event(&end);
        let snap = recorder.snapshot();
        let timing = snap.step_timings.get("a").unwrap();
        assert_eq!(timing.count, 1);
        assert!(timing.total_secs > 0.0);
    }

    #[test]
    fn token_and_suspend_counts_increment() {
        let mut recorder = RuntimeMetricsRecorder::new();
        recorder.on_event(&Event::token("a", serde_json::json!("x")));
        recorder.on_event(&Event::token("a", serde_json::json!("y")));
        recorder.on_event(&Event::suspend("a", "waiting"));
        let snap = recorder.snapshot();
        assert_eq!(snap.token_count, 2);
        assert_eq!(snap.suspend_count, 1);
    }

    #[test]
    fn map_fan_out_tracks_peak_workers() {
        let mut recorder = RuntimeMetricsRecorder::new();
        recorder.on_task_spawned("m", true);
        recorder.on_task_spawned("m", true);
        recorder.on_task_completed("m", true);
        let snap = recorder.snapshot();
        assert_eq!(snap.map_metrics["m"].workers_started, 2);
        assert_eq!(snap.map_metrics["m"].peak_workers, 2);
    }

    #[test]
    fn task_counters_track_peak_active() {
        let mut recorder = RuntimeMetricsRecorder::new();
        recorder.on_task_spawned("a", false);
        recorder.on_task_spawned("b", false);
        recorder.on_task_completed("a", false);
        let snap = recorder.snapshot();
        assert_eq!(snap.tasks.started, 2);
        assert_eq!(snap.tasks.completed, 1);
        assert_eq!(snap.tasks.peak_active, 2);
    }
}
