//! Integration coverage for the full registration-to-outcome path: every
//! scenario drives a real [`PipelineRunner`] to completion and asserts on
//! its published event stream and resolved outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;

use workweave::event::manager::{Observer, ObserverMeta};
use workweave::event::{Event, EventType};
use workweave::failure::outcome::{FailureKind, FailureSource, ResolvedOutcome, TerminalStatus};
use workweave::scheduler::{Pipeline, PipelineBuilder, PipelineRunner};
use workweave::step::registry::ErrorHandler;
use workweave::step::{Directive, Step, StepConfig, StepError, StepKind, StepPayload, SwitchRoutes};
use workweave::testing::TestRun;

async fn drive<S, C>(pipeline: Arc<Pipeline<S, C>>, state: Arc<S>, context: Arc<C>) -> TestRun
where
    S: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let runner = PipelineRunner::new(pipeline);
    let events: Vec<Event> = runner.run(state, context, None).collect().await;
    let outcome = resolved_outcome_from_finish(events.last().expect("at least FINISH"));
    TestRun::new(events, outcome)
}

fn resolved_outcome_from_finish(finish: &Event) -> ResolvedOutcome {
    assert_eq!(finish.kind, EventType::Finish);
    let status = match finish.payload["status"].as_str().unwrap() {
        "success" => TerminalStatus::Success,
        "failed" => TerminalStatus::Failed,
        "timeout" => TerminalStatus::Timeout,
        "cancelled" => TerminalStatus::Cancelled,
        "client_closed" => TerminalStatus::ClientClosed,
        other => panic!("unknown terminal status '{other}'"),
    };
    ResolvedOutcome {
        status,
        reason: None,
        failure_kind: FailureKind::None,
        failure_source: FailureSource::None,
        failed_step: finish.payload["failed_step"].as_str().map(String::from),
        pipeline_error: None,
        errors: Vec::new(),
    }
}

struct NextStep(&'static str);

#[async_trait]
impl Step<(), ()> for NextStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Ok(Directive::Next(self.0.to_string()))
    }
}

struct StopStep;

#[async_trait]
impl Step<(), ()> for StopStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Ok(Directive::Stop)
    }
}

#[tokio::test]
async fn linear_two_step_run_succeeds() {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("linear");
    builder.add_step(StepConfig::new("a", StepKind::Step).with_to(vec!["b".to_string()]), Arc::new(NextStep("b"))).unwrap();
    builder.add_step(StepConfig::new("b", StepKind::Step), Arc::new(StopStep)).unwrap();
    let pipeline = Arc::new(builder.build().unwrap());

    let run = drive(pipeline, Arc::new(()), Arc::new(())).await;
    run.assert_well_formed();
    run.assert_succeeded();
    assert_eq!(run.step_start_count("a"), 1);
    assert_eq!(run.step_end_count("b"), 1);
}

struct SwitchStep;

#[async_trait]
impl Step<(), ()> for SwitchStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Ok(Directive::Value(serde_json::json!("unrouted")))
    }
}

#[tokio::test]
async fn switch_step_falls_back_to_default_route() {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("switch");
    let routes = SwitchRoutes::new();
    builder
        .add_step(
            StepConfig::new("route", StepKind::Switch).with_switch(routes, Some("fallback".to_string())),
            Arc::new(SwitchStep),
        )
        .unwrap();
    builder.add_step(StepConfig::new("fallback", StepKind::Step), Arc::new(StopStep)).unwrap();
    let pipeline = Arc::new(builder.build().unwrap());

    let run = drive(pipeline, Arc::new(()), Arc::new(())).await;
    run.assert_succeeded();
    assert_eq!(run.step_end_count("fallback"), 1);
}

#[derive(Default)]
struct Counter {
    seen: AtomicUsize,
}

struct FanOutStep;

#[async_trait]
impl Step<Counter, ()> for FanOutStep {
    async fn call(&self, _s: Arc<Counter>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Ok(Directive::Value(serde_json::json!([1, 2, 3])))
    }
}

struct WorkerStep;

#[async_trait]
impl Step<Counter, ()> for WorkerStep {
    async fn call(&self, state: Arc<Counter>, _c: Arc<()>, payload: StepPayload) -> Result<Directive, StepError> {
        if let StepPayload::Item(_) = payload {
            state.seen.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Directive::Stop)
    }
}

#[tokio::test]
async fn map_fan_out_invokes_worker_once_per_item() {
    let mut builder: PipelineBuilder<Counter, ()> = PipelineBuilder::new("map");
    builder
        .add_step(StepConfig::new("split", StepKind::Map).with_map_target("worker"), Arc::new(FanOutStep))
        .unwrap();
    builder.add_step(StepConfig::new("worker", StepKind::Step), Arc::new(WorkerStep)).unwrap();
    let pipeline = Arc::new(builder.build().unwrap());

    let state = Arc::new(Counter::default());
    let run = drive(pipeline, state.clone(), Arc::new(())).await;
    run.assert_succeeded();
    assert_eq!(state.seen.load(Ordering::SeqCst), 3);
    assert_eq!(run.step_start_count("worker"), 3);
    assert_eq!(run.events_of_kind(EventType::MapComplete).len(), 1);
}

struct SlowStep(std::time::Duration);

#[async_trait]
impl Step<(), ()> for SlowStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        tokio::time::sleep(self.0).await;
        Ok(Directive::Stop)
    }
}

#[tokio::test]
async fn barrier_timeout_fires_when_a_parent_is_still_outstanding() {
    // `join` has two parents; `a` completes immediately but `b` is still
    // running when `join`'s barrier timeout elapses, so the barrier must
    // resolve via the timeout rather than waiting on `b` indefinitely.
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("barrier");
    builder
        .add_step(StepConfig::new("a", StepKind::Step).with_to(vec!["join".to_string()]), Arc::new(StopStep))
        .unwrap();
    builder
        .add_step(
            StepConfig::new("b", StepKind::Step).with_to(vec!["join".to_string()]),
            Arc::new(SlowStep(std::time::Duration::from_millis(80))),
        )
        .unwrap();
    builder
        .add_step(StepConfig::new("join", StepKind::Step).with_barrier_timeout_ms(20), Arc::new(StopStep))
        .unwrap();
    let pipeline = Arc::new(builder.build().unwrap());

    let runner = PipelineRunner::new(pipeline);
    let events: Vec<Event> = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        runner.run(Arc::new(()), Arc::new(()), None).collect(),
    )
    .await
    .expect("run completes within timeout");

    assert!(events.iter().any(|e| e.kind == EventType::BarrierWait && e.stage == "join"));
    assert!(events.iter().any(|e| e.kind == EventType::StepError && e.stage == "join"));
}

struct RaisingStep;

#[async_trait]
impl Step<(), ()> for RaisingStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Err(StepError::message("boom"))
    }
}

struct RecoveringHandler;

#[async_trait]
impl ErrorHandler<(), ()> for RecoveringHandler {
    async fn handle(
        &self,
        _state: Arc<()>,
        _context: Arc<()>,
        _error: &StepError,
        _step_name: &str,
    ) -> Result<Directive, StepError> {
        Ok(Directive::Stop)
    }
}

#[tokio::test]
async fn local_error_handler_recovers_the_run() {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("recover");
    builder
        .add_step_with_error_handler(
            StepConfig::new("flaky", StepKind::Step),
            Arc::new(RaisingStep),
            Some(Arc::new(RecoveringHandler)),
        )
        .unwrap();
    let pipeline = Arc::new(builder.build().unwrap());

    let run = drive(pipeline, Arc::new(()), Arc::new(())).await;
    run.assert_succeeded();
    assert!(run.events_of_kind(EventType::StepError).is_empty());
}

#[tokio::test]
async fn unhandled_raise_fails_the_run_at_the_raising_step() {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("unrecovered");
    builder.add_step(StepConfig::new("flaky", StepKind::Step), Arc::new(RaisingStep)).unwrap();
    let pipeline = Arc::new(builder.build().unwrap());

    let run = drive(pipeline, Arc::new(()), Arc::new(())).await;
    run.assert_failed_at("flaky");
}

struct SuspendingStep;

#[async_trait]
impl Step<(), ()> for SuspendingStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Ok(Directive::Suspend("waiting on human approval".to_string()))
    }
}

#[tokio::test]
async fn suspend_directive_emits_suspend_event_and_stops_cleanly() {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("suspend");
    builder.add_step(StepConfig::new("gate", StepKind::Step), Arc::new(SuspendingStep)).unwrap();
    let pipeline = Arc::new(builder.build().unwrap());

    let run = drive(pipeline, Arc::new(()), Arc::new(())).await;
    run.assert_succeeded();
    let suspends = run.events_of_kind(EventType::Suspend);
    assert_eq!(suspends.len(), 1);
    assert_eq!(suspends[0].payload, serde_json::json!("waiting on human approval"));
}

struct CountingRetryStep {
    failures_left: AtomicUsize,
}

#[async_trait]
impl Step<(), ()> for CountingRetryStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
            Err(StepError::message("transient"))
        } else {
            Ok(Directive::Stop)
        }
    }
}

#[tokio::test]
async fn retry_policy_recovers_after_transient_failures() {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("retry");
    builder
        .add_step(
            StepConfig::new("flaky", StepKind::Step).with_retries(3, 1, 2),
            Arc::new(CountingRetryStep { failures_left: AtomicUsize::new(2) }),
        )
        .unwrap();
    let pipeline = Arc::new(builder.build().unwrap());

    let run = drive(pipeline, Arc::new(()), Arc::new(())).await;
    run.assert_succeeded();
    assert_eq!(run.step_start_count("flaky"), 3);
}

#[test]
fn self_routing_step_is_rejected_at_build_time() {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("cyclic");
    builder
        .add_step(StepConfig::new("a", StepKind::Step).with_to(vec!["a".to_string()]), Arc::new(StopStep))
        .unwrap();
    assert!(builder.build().is_err());
}

struct SubCallerStep;

#[async_trait]
impl Step<(), ()> for SubCallerStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Ok(Directive::Value(serde_json::json!({"seed": true})))
    }
}

#[tokio::test]
async fn sub_pipeline_events_are_nested_under_the_owning_step() {
    let mut child_builder: PipelineBuilder<(), ()> = PipelineBuilder::new("child");
    child_builder.add_step(StepConfig::new("inner", StepKind::Step), Arc::new(StopStep)).unwrap();
    let child = Arc::new(child_builder.build().unwrap());

    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("parent");
    builder
        .add_step(StepConfig::new("delegate", StepKind::Sub).with_sub_pipeline("child"), Arc::new(SubCallerStep))
        .unwrap();
    builder.add_sub_pipeline("child", child);
    let pipeline = Arc::new(builder.build().unwrap());

    let run = drive(pipeline, Arc::new(()), Arc::new(())).await;
    run.assert_succeeded();
    assert!(run.events.iter().any(|e| e.stage == "delegate:inner"));
}

struct ExplodingObserver;

#[async_trait]
impl Observer for ExplodingObserver {
    async fn on_event(&self, _meta: &ObserverMeta, event: &Event) {
        if event.kind == EventType::StepEnd {
            panic!("observer exploded on step_end");
        }
    }
}

#[tokio::test]
async fn observer_panic_is_swallowed_and_never_affects_the_outcome() {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("observed");
    builder.add_step(StepConfig::new("a", StepKind::Step), Arc::new(StopStep)).unwrap();
    builder.add_observer(Arc::new(ExplodingObserver));
    let pipeline = Arc::new(builder.build().unwrap());

    let run = drive(pipeline, Arc::new(()), Arc::new(())).await;
    run.assert_well_formed();
    run.assert_succeeded();
}
