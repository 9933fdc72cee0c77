//! Test-support helpers for asserting over a completed run's event log.

use crate::event::{Event, EventType};
use crate::failure::outcome::{ResolvedOutcome, TerminalStatus};

/// The full recorded output of one `run()` call: every published event in
/// emission order plus the resolved outcome carried by `FINISH`. Built by
/// draining a run's event stream to completion in a test harness.
pub struct TestRun {
    pub events: Vec<Event>,
    pub outcome: ResolvedOutcome,
}

impl TestRun {
    pub fn new(events: Vec<Event>, outcome: ResolvedOutcome) -> Self {
        Self { events, outcome }
    }

    pub fn events_of_kind(&self, kind: EventType) -> Vec<&Event> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }

    pub fn events_for_stage(&self, stage: &str) -> Vec<&Event> {
        self.events.iter().filter(|e| e.stage == stage).collect()
    }

    pub fn step_end_count(&self, stage: &str) -> usize {
        self.events
            .iter()
            .filter(|e| e.kind == EventType::StepEnd && e.stage == stage)
            .count()
    }

    pub fn step_start_count(&self, stage: &str) -> usize {
        self.events
            .iter()
            .filter(|e| e.kind == EventType::StepStart && e.stage == stage)
            .count()
    }

    /// Assert invariant 1 (§8): exactly one `START`/`FINISH`, `START.seq
    /// == 1`, `FINISH` last, `seq` strictly increasing throughout.
    pub fn assert_well_formed(&self) {
        assert_eq!(self.events_of_kind(EventType::Start).len(), 1, "expected exactly one START");
        assert_eq!(self.events_of_kind(EventType::Finish).len(), 1, "expected exactly one FINISH");
        assert_eq!(self.events.first().unwrap().seq, 1, "START.seq must be 1");
        assert_eq!(
            self.events.last().unwrap().kind,
            EventType::Finish,
            "FINISH must be the last event"
        );
        for pair in self.events.windows(2) {
            assert!(pair[0].seq < pair[1].seq, "seq must strictly increase");
        }
    }

    pub fn assert_succeeded(&self) {
        assert_eq!(
            self.outcome.status,
            TerminalStatus::Success,
            "expected run to succeed, got status {:?} reason {:?}",
            self.outcome.status,
            self.outcome.reason
        );
    }

    pub fn assert_failed_at(&self, step: &str) {
        assert_eq!(self.outcome.status, TerminalStatus::Failed);
        assert_eq!(self.outcome.failed_step.as_deref(), Some(step));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeKind;
    use crate::failure::{FailureKind, FailureSource};

    fn outcome(status: TerminalStatus) -> ResolvedOutcome {
        ResolvedOutcome {
            status,
            reason: None,
            failure_kind: FailureKind::None,
            failure_source: FailureSource::None,
            failed_step: None,
            pipeline_error: None,
            errors: Vec::new(),
        }
    }

    #[test]
    fn assert_well_formed_passes_for_minimal_valid_run() {
        let mut start = Event::start();
        start.seq = 1;
        let mut step_start = Event::step_start("a", NodeKind::Step);
        step_start.seq = 2;
        let mut step_end = Event::step_end("a", NodeKind::Step, serde_json::Value::Null);
        step_end.seq = 3;
        let mut finish = Event::finish(serde_json::json!({}));
        finish.seq = 4;
        let run = TestRun::new(vec![start, step_start, step_end, finish], outcome(TerminalStatus::Success));
        run.assert_well_formed();
        run.assert_succeeded();
        assert_eq!(run.step_end_count("a"), 1);
    }

    #[test]
    #[should_panic(expected = "exactly one START")]
    fn assert_well_formed_catches_missing_start() {
        let mut finish = Event::finish(serde_json::json!({}));
        finish.seq = 1;
        let run = TestRun::new(vec![finish], outcome(TerminalStatus::Success));
        run.assert_well_formed();
    }
}
