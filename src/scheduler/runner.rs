//! The scheduler (§4.3): owns the work queue, spawns step tasks inside a
//! structured-concurrency scope, and drives the `run()` control loop from
//! startup hooks through the single `FINISH` event.
//!
//! Workers only ever *append* to the queue (§3's ownership rule): every
//! mutation of scheduling state — the dependency graph's completion
//! bookkeeping, the failure journal, the event sequence — happens on this
//! single consumer's thread of control, even though many worker tasks run
//! concurrently underneath it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::task::JoinSet;

use crate::event::manager::EventManager;
use crate::event::{Event, NodeKind};
use crate::failure::outcome::{resolve_outcome, ExecutionLog, TerminalSignal};
use crate::failure::{FailureEntry, FailureKind, FailureReason, FailureSource};
use crate::graph::RunProgress;
use crate::ids::InvocationId;
use crate::meta::{with_step_scope, StepMeta};
use crate::metrics::RuntimeMetricsRecorder;
use crate::runstate::{RunContext, RunPhase};
use crate::scheduler::pipeline::Pipeline;
use crate::step::invoker::{finalize_directive, InvokeError, StepInvoker};
use crate::step::{Directive, StepError, StepPayload};

/// A worker's raw outcome before the scheduler finalizes it into a
/// directive or a failure (§4.2's timeout wrapping sits above the step
/// implementation's own [`StepError`]).
#[derive(Debug)]
enum WorkerError {
    Timeout(String, Duration),
    Step(StepError),
}

impl From<InvokeError> for WorkerError {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::TimedOut(name, dur) => WorkerError::Timeout(name, dur),
            InvokeError::Step(e) => WorkerError::Step(e),
        }
    }
}

/// One invocation's identity fields (§3/§9): a fresh `invocation_id` for
/// every scheduled call, the invocation that caused it, the owning step's
/// own invocation (differs from `invocation_id` only for map/sub workers),
/// and the ordered ancestor chain. Carried alongside a worker's result so
/// every event it emits — `STEP_START`, `TOKEN`, `STEP_END`/`STEP_ERROR` —
/// can be stamped consistently even though many workers run concurrently
/// under names the scheduler's bookkeeping maps alone can't disambiguate.
#[derive(Debug, Clone, Default)]
struct InvocationIdentity {
    invocation_id: Option<InvocationId>,
    parent_invocation_id: Option<InvocationId>,
    owner_invocation_id: Option<InvocationId>,
    scope: Vec<InvocationId>,
    attempt: u32,
}

fn stamp_identity(mut event: Event, identity: &InvocationIdentity) -> Event {
    event.invocation_id = identity.invocation_id.clone();
    event.parent_invocation_id = identity.parent_invocation_id.clone();
    event.owner_invocation_id = identity.owner_invocation_id.clone();
    event.scope = identity.scope.clone();
    event.attempt = identity.attempt;
    event
}

/// Posted by a worker once its invocation (or the sub-pipeline wrapper)
/// finishes. One envelope per worker task, regardless of whether the
/// outcome is a directive or a failure — the consumer decrements counters
/// and dispatches exactly once per envelope (§4.3.2).
struct StepOutcome {
    owner: String,
    name: String,
    directive: Result<Directive, WorkerError>,
    identity: InvocationIdentity,
}

/// One unit of work a worker (or the scheduler itself, for barrier
/// watchers) posts back to the consumer loop.
enum QueueItem {
    StepStarting { name: String, owner: String, node_kind: NodeKind, identity: InvocationIdentity },
    Token(Event, InvocationIdentity),
    Result(StepOutcome),
    /// A nested sub-pipeline event, already stage-rewritten to
    /// `"{owner}:{inner_stage}"`; the consumer re-stamps its seq/run
    /// identity before yielding it (§9).
    Nested(Event),
    BarrierTimeout(String),
}

/// What the failure pipeline (§4.3.3) ended up classifying a worker's
/// abnormal outcome as, before trying local/global error handlers.
struct FailureInfo {
    reason: FailureReason,
    message: String,
}

fn failure_info(err: WorkerError) -> FailureInfo {
    match err {
        WorkerError::Timeout(step, dur) => FailureInfo {
            reason: FailureReason::StepTimeout,
            message: format!("step '{step}' timed out after {dur:?}"),
        },
        WorkerError::Step(e) => FailureInfo { reason: FailureReason::StepRaised, message: e.to_string() },
    }
}

/// Exponential backoff bounded by `[wait_min_ms, wait_max_ms]`, jittered
/// uniformly within the doubled window so that a burst of sibling retries
/// doesn't resynchronize on the same tick (§9's retry policy).
fn backoff_delay(attempt: u32, wait_min_ms: u64, wait_max_ms: u64) -> Duration {
    let wait_max_ms = wait_max_ms.max(wait_min_ms);
    let doubled = wait_min_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let bound = doubled.clamp(wait_min_ms, wait_max_ms);
    let jittered =
        if bound > wait_min_ms { rand::Rng::random_range(&mut rand::rng(), wait_min_ms..=bound) } else { bound };
    Duration::from_millis(jittered)
}

/// Drives one run of a [`Pipeline`]. Cheap to construct; all per-run state
/// lives in the stack frame of [`PipelineRunner::run`]'s generator.
pub struct PipelineRunner<S, C> {
    pipeline: Arc<Pipeline<S, C>>,
}

impl<S, C> PipelineRunner<S, C>
where
    S: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    pub fn new(pipeline: Arc<Pipeline<S, C>>) -> Self {
        Self { pipeline }
    }

    /// Execute the pipeline once, producing the event stream described in
    /// §4.3: `START` (or a lone startup `ERROR`), the run's lifecycle
    /// events in `seq` order, and exactly one `FINISH`.
    pub fn run(
        &self,
        state: Arc<S>,
        context: Arc<C>,
        start: Option<String>,
    ) -> impl Stream<Item = Event> + 'static {
        let pipeline = self.pipeline.clone();
        stream! {
            let mut ctx = RunContext::new(state.clone(), context.clone());
            let mut event_manager = EventManager::with_dispatch(
                ctx.id_gen.clone(),
                pipeline.name().to_string(),
                pipeline.config.observer_dispatch,
            );
            for (hook_name, hook) in &pipeline.event_hooks {
                let hook = hook.clone();
                event_manager.add_hook(hook_name.clone(), move |e| hook(e));
            }
            for observer in &pipeline.observers {
                event_manager.add_observer(observer.clone());
            }
            event_manager.notify_start().await;

            let (tx, rx) = match pipeline.config.bounded_capacity() {
                Some(cap) => flume::bounded(cap),
                None => flume::unbounded(),
            };

            let mut runner = Runner {
                pipeline: pipeline.clone(),
                state: state.clone(),
                context: context.clone(),
                join_set: JoinSet::new(),
                tx,
                progress: RunProgress::new(),
                logical_active: FxHashMap::default(),
                total_active_tasks: 0,
                stopping: false,
                skipped_owners: FxHashSet::default(),
                barrier_watchers: FxHashMap::default(),
                barrier_wait_started: FxHashMap::default(),
                metrics: RuntimeMetricsRecorder::new(),
                current_invocation: FxHashMap::default(),
            };

            let mut startup_failed = false;

            ctx.phase.transition(RunPhase::Startup).expect("Init -> Startup always allowed");

            for hook in &pipeline.startup_hooks {
                if let Err(err) = hook.call(state.clone(), context.clone()).await {
                    pipeline.failure_journal.record_failure(
                        &mut ctx.log,
                        FailureKind::Startup,
                        FailureSource::User,
                        FailureReason::StartupFailed,
                        Some(err.to_string()),
                        None,
                        None,
                    );
                    for raw in vec![Event::error(err.to_string()).with_payload(serde_json::json!({"stage": "startup"}))] {
                        let event = yield_finalized(&event_manager, &mut ctx, &mut runner.metrics, raw).await;
                        yield event;
                    }
                    startup_failed = true;
                    break;
                }
            }

            if !startup_failed {
                match pipeline.graph.get_roots(start.as_deref()) {
                    Ok(roots) => {
                        ctx.log.mark_started();
                        ctx.phase.transition(RunPhase::Executing).expect("Startup -> Executing always allowed");
                        let event = yield_finalized(&event_manager, &mut ctx, &mut runner.metrics, Event::start()).await;
                        yield event;
                        for root in roots {
                            let events = runner.schedule(&ctx, root, None, StepPayload::None, None);
                            for raw in events {
                                let event = yield_finalized(&event_manager, &mut ctx, &mut runner.metrics, raw).await;
                                yield event;
                            }
                        }
                    }
                    Err(err) => {
                        pipeline.failure_journal.record_failure(
                            &mut ctx.log,
                            FailureKind::Startup,
                            FailureSource::Framework,
                            FailureReason::Other,
                            Some(err.to_string()),
                            None,
                            None,
                        );
                        let event = yield_finalized(
                            &event_manager,
                            &mut ctx,
                            &mut runner.metrics,
                            Event::error(err.to_string()),
                        ).await;
                        yield event;
                        startup_failed = true;
                    }
                }
            }

            if !startup_failed {
                loop {
                    if runner.total_active_tasks == 0 {
                        break;
                    }
                    let events = tokio::select! {
                        item = rx.recv_async() => {
                            match item {
                                Ok(QueueItem::StepStarting { name, owner, node_kind, identity }) => {
                                    let event = Event::step_start(name, node_kind)
                                        .with_node_kind(node_kind)
                                        .with_payload(serde_json::json!({"owner": owner}));
                                    vec![stamp_identity(event, &identity)]
                                }
                                Ok(QueueItem::Token(event, identity)) => vec![stamp_identity(event, &identity)],
                                Ok(QueueItem::Nested(mut event)) => {
                                    event.run_id = None;
                                    event.parent_run_id = Some(ctx.run_id.clone());
                                    if event.origin_run_id.is_none() {
                                        event.origin_run_id = Some(ctx.run_id.clone());
                                    }
                                    vec![event]
                                }
                                Ok(QueueItem::Result(outcome)) => runner.handle_worker_result(&mut ctx, outcome).await,
                                Ok(QueueItem::BarrierTimeout(step)) => runner.handle_barrier_timeout(&mut ctx, step).await,
                                Err(_) => Vec::new(),
                            }
                        }
                        joined = runner.join_set.join_next(), if !runner.join_set.is_empty() => {
                            if let Some(Err(join_err)) = joined {
                                if join_err.is_panic() {
                                    pipeline.failure_journal.record_failure(
                                        &mut ctx.log,
                                        FailureKind::Infra,
                                        FailureSource::Framework,
                                        FailureReason::Other,
                                        Some(format!("worker task panicked: {join_err}")),
                                        None,
                                        None,
                                    );
                                    runner.stopping = true;
                                }
                            }
                            Vec::new()
                        }
                    };
                    for raw in events {
                        let event = yield_finalized(&event_manager, &mut ctx, &mut runner.metrics, raw).await;
                        yield event;
                    }
                }
            }

            ctx.phase.transition(RunPhase::Shutdown).expect("Startup/Executing -> Shutdown always allowed");
            for hook in &pipeline.shutdown_hooks {
                if let Err(err) = hook.call(state.clone(), context.clone()).await {
                    pipeline.failure_journal.record_failure(
                        &mut ctx.log,
                        FailureKind::Shutdown,
                        FailureSource::User,
                        FailureReason::ShutdownFailed,
                        Some(err.to_string()),
                        None,
                        None,
                    );
                    let event = yield_finalized(
                        &event_manager,
                        &mut ctx,
                        &mut runner.metrics,
                        Event::error(err.to_string()).with_payload(serde_json::json!({"stage": "shutdown"})),
                    ).await;
                    yield event;
                }
            }

            ctx.phase.transition(RunPhase::Terminal).expect("Shutdown -> Terminal always allowed");
            let log = std::mem::take(&mut ctx.log);
            let outcome = resolve_outcome(log);
            let terminal_status = crate::runstate::TerminalRecord {
                status: outcome.status,
                reason: outcome.reason,
                duration_secs: ctx.session.elapsed_secs(),
            };
            ctx.session.close(terminal_status.status, terminal_status.reason);

            let finish_payload = serde_json::json!({
                "status": status_str(outcome.status),
                "duration_s": ctx.session.terminal().map(|t| t.duration_secs).unwrap_or(0.0),
                "error": outcome.pipeline_error.as_ref().map(|e| e.to_string()),
                "reason": outcome.reason,
                "failed_step": outcome.failed_step,
                "failure_kind": format!("{:?}", outcome.failure_kind),
                "failure_source": format!("{:?}", outcome.failure_source),
                "errors": outcome.errors.iter().map(|e| serde_json::json!({
                    "kind": format!("{:?}", e.kind),
                    "source": format!("{:?}", e.source),
                    "reason": e.reason.as_str(),
                    "error": e.error,
                    "step": e.step,
                })).collect::<Vec<_>>(),
                "metrics": runner.metrics.snapshot(),
            });

            event_manager.notify_end(ctx.session.terminal().map(|t| t.duration_secs).unwrap_or(0.0)).await;
            let event = yield_finalized(&event_manager, &mut ctx, &mut runner.metrics, Event::finish(finish_payload)).await;
            yield event;
        }
    }
}

fn status_str(status: crate::failure::outcome::TerminalStatus) -> &'static str {
    use crate::failure::outcome::TerminalStatus::*;
    match status {
        Success => "success",
        Failed => "failed",
        Timeout => "timeout",
        Cancelled => "cancelled",
        ClientClosed => "client_closed",
    }
}

/// Stamp, hook, notify, and feed one raw event into the metrics recorder.
/// Not a macro: `async-stream`'s `yield` must appear lexically inside the
/// `stream!` block, so every call site re-does the final `yield` itself;
/// this helper only prepares the event.
async fn yield_finalized<S, C>(
    event_manager: &EventManager,
    ctx: &mut RunContext<S, C>,
    metrics: &mut RuntimeMetricsRecorder,
    raw: Event,
) -> Event {
    let scope = raw.scope.clone();
    let prepared = event_manager.prepare(raw, scope);
    let event = match event_manager.apply_hooks(prepared.clone()) {
        Ok(hooked) => hooked,
        Err(err) => {
            ctx.log.record_failure(FailureEntry {
                kind: FailureKind::Infra,
                source: FailureSource::Framework,
                reason: FailureReason::Other,
                error_message: Some(err.to_string()),
                step: None,
                error: None,
            });
            prepared
        }
    };
    event_manager.notify_event(&event).await;
    metrics.on_event(&event);
    event
}

/// The scheduler's mutable per-run bookkeeping: the dependency graph's
/// completion state, active-task counters, and the barrier-watcher table.
/// Everything here is touched only from the consumer's thread of control.
struct Runner<S, C> {
    pipeline: Arc<Pipeline<S, C>>,
    state: Arc<S>,
    context: Arc<C>,
    join_set: JoinSet<()>,
    tx: flume::Sender<QueueItem>,
    progress: RunProgress,
    logical_active: FxHashMap<String, u32>,
    total_active_tasks: u32,
    stopping: bool,
    skipped_owners: FxHashSet<String>,
    barrier_watchers: FxHashMap<String, tokio::task::AbortHandle>,
    barrier_wait_started: FxHashMap<String, Instant>,
    metrics: RuntimeMetricsRecorder,
    /// The most recent invocation id assigned to each *owner-level* step
    /// name (a standard step, or a map/switch/sub step's own invocation —
    /// never a map worker's, since those share one name across concurrent
    /// items and would corrupt this lookup). Used only to resolve
    /// `owner_invocation_id` for workers and the owner-level identity used
    /// by `STEP_END`/`MAP_COMPLETE`/barrier events.
    current_invocation: FxHashMap<String, InvocationId>,
}

impl<S, C> Runner<S, C>
where
    S: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    fn node_kind_of(&self, name: &str) -> NodeKind {
        self.pipeline
            .registry
            .get(name)
            .map(|r| NodeKind::from(r.config.kind))
            .unwrap_or(NodeKind::System)
    }

    /// Allocate a fresh [`InvocationIdentity`] for invoking `name` on behalf
    /// of `owner`. `parent` is the identity of the invocation that caused
    /// this scheduling (`None` for roots); its own id becomes
    /// `parent_invocation_id` and its scope, extended by its id, becomes the
    /// new invocation's `scope` (§9's ancestor chain). `owner_invocation_id`
    /// is this invocation's own id when `owner == name` (the common case),
    /// otherwise the owner's last recorded invocation (map/sub workers).
    fn make_identity(
        &mut self,
        ctx: &RunContext<S, C>,
        name: &str,
        owner: &str,
        attempt: u32,
        parent: Option<&InvocationIdentity>,
    ) -> InvocationIdentity {
        let invocation_id = ctx.id_gen.next_invocation_id();
        let (parent_invocation_id, scope) = match parent {
            Some(p) => {
                let mut scope = p.scope.clone();
                if let Some(id) = &p.invocation_id {
                    scope.push(id.clone());
                }
                (p.invocation_id.clone(), scope)
            }
            None => (None, Vec::new()),
        };
        let owner_invocation_id = if owner == name {
            Some(invocation_id.clone())
        } else {
            self.current_invocation.get(owner).cloned()
        };
        if owner == name {
            self.current_invocation.insert(name.to_string(), invocation_id.clone());
        }
        InvocationIdentity { invocation_id: Some(invocation_id), parent_invocation_id, owner_invocation_id, scope, attempt }
    }

    /// The owner-level identity recorded the last time `owner` itself (not
    /// one of its workers) was invoked. Used to stamp `STEP_END`,
    /// `MAP_COMPLETE`, and barrier events, which describe the owner as a
    /// whole rather than any one worker.
    fn owner_identity(&self, owner: &str) -> InvocationIdentity {
        let invocation_id = self.current_invocation.get(owner).cloned();
        InvocationIdentity {
            invocation_id: invocation_id.clone(),
            parent_invocation_id: None,
            owner_invocation_id: invocation_id,
            scope: Vec::new(),
            attempt: 0,
        }
    }

    /// §4.3.1: increment counters, post the `STEP_START` intent, and spawn
    /// the worker that will execute the step and post its [`StepOutcome`].
    /// Dropped silently once [`Self::stopping`] is set (no new work).
    fn schedule(
        &mut self,
        ctx: &RunContext<S, C>,
        name: String,
        owner: Option<String>,
        payload: StepPayload,
        parent: Option<&InvocationIdentity>,
    ) -> Vec<Event> {
        self.schedule_after(ctx, name, owner, payload, None, parent)
    }

    /// Same as [`Self::schedule`], but the worker sleeps for `delay` (if
    /// any) before invoking the step. Counters are reserved up front, so the
    /// pending backoff still counts as active work and won't let
    /// `total_active_tasks` hit zero and end the run early (§9's retry
    /// backoff).
    fn schedule_after(
        &mut self,
        ctx: &RunContext<S, C>,
        name: String,
        owner: Option<String>,
        payload: StepPayload,
        delay: Option<Duration>,
        parent: Option<&InvocationIdentity>,
    ) -> Vec<Event> {
        if self.stopping {
            return Vec::new();
        }
        let Some(registration) = self.pipeline.registry.get(&name) else {
            return Vec::new();
        };
        let owner = owner.unwrap_or_else(|| name.clone());
        let is_map_worker = owner != name;
        *self.logical_active.entry(owner.clone()).or_insert(0) += 1;
        self.total_active_tasks += 1;
        self.metrics.on_task_spawned(&owner, is_map_worker);

        let node_kind = NodeKind::from(registration.config.kind);
        let timeout = registration.config.timeout_ms.map(Duration::from_millis);
        let attempt = ctx.attempt_of(&name);
        let identity = self.make_identity(ctx, &name, &owner, attempt, parent);
        let _ = self.tx.send(QueueItem::StepStarting {
            name: name.clone(),
            owner: owner.clone(),
            node_kind,
            identity: identity.clone(),
        });

        let pipeline = self.pipeline.clone();
        let state = self.state.clone();
        let context = self.context.clone();
        let tx = self.tx.clone();
        let owner_for_task = owner.clone();
        let name_for_task = name.clone();
        let identity_for_task = identity.clone();

        self.join_set.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let meta = StepMeta::new(name_for_task.clone(), attempt);
            let directive = with_step_scope(meta, async {
                let Some(registration) = pipeline.registry.get(&name_for_task) else {
                    return Err(WorkerError::Step(StepError::message(format!(
                        "step '{name_for_task}' vanished from the registry mid-run"
                    ))));
                };
                let (tok_tx, tok_rx) = flume::unbounded::<Event>();
                let result = StepInvoker::execute(
                    &name_for_task,
                    &registration.implementation,
                    state,
                    context,
                    payload,
                    tok_tx,
                    timeout,
                )
                .await;
                while let Ok(ev) = tok_rx.try_recv() {
                    let _ = tx.send(QueueItem::Token(ev, identity_for_task.clone()));
                }
                match result {
                    Ok(directive) => finalize_directive(&registration.config, directive).map_err(WorkerError::Step),
                    Err(invoke_err) => Err(invoke_err.into()),
                }
            })
            .await;
            let _ = tx.send(QueueItem::Result(StepOutcome {
                owner: owner_for_task,
                name: name_for_task,
                directive,
                identity,
            }));
        });
        Vec::new()
    }

    fn cancel_watcher(&mut self, step: &str) {
        if let Some(handle) = self.barrier_watchers.remove(step) {
            handle.abort();
            self.total_active_tasks = self.total_active_tasks.saturating_sub(1);
        }
        if let Some(start) = self.barrier_wait_started.remove(step) {
            self.metrics.on_barrier_release(step, start.elapsed().as_secs_f64());
        }
    }

    fn arm_watcher(&mut self, step: String, timeout_ms: u64) {
        self.total_active_tasks += 1;
        self.barrier_wait_started.insert(step.clone(), Instant::now());
        let tx = self.tx.clone();
        let step_for_task = step.clone();
        let abort_handle = self.join_set.spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let _ = tx.send(QueueItem::BarrierTimeout(step_for_task));
        });
        self.barrier_watchers.insert(step, abort_handle);
    }

    /// §4.3.4: walk `owner`'s successors, advancing barrier bookkeeping and
    /// scheduling whichever become ready.
    fn schedule_successors(&mut self, ctx: &RunContext<S, C>, owner: &str) -> Vec<Event> {
        let mut events = Vec::new();
        let successors: Vec<String> = self.pipeline.graph.topology().successors(owner).to_vec();
        let parent = self.owner_identity(owner);
        for succ in successors {
            let signal = self.progress.mark_completed(&self.pipeline.graph, owner, &succ);
            let parents_count = self.pipeline.graph.parents_of(&succ).len();
            if signal.cancel_timeout {
                self.cancel_watcher(&succ);
            }
            if signal.is_ready {
                if parents_count > 1 {
                    events.push(Event::barrier_release(succ.clone()));
                }
                events.extend(self.schedule(ctx, succ, None, StepPayload::None, Some(&parent)));
            } else if signal.schedule_timeout {
                let timeout_ms = self
                    .pipeline
                    .registry
                    .get(&succ)
                    .and_then(|r| r.config.barrier_timeout_ms)
                    .or(self.pipeline.config.default_barrier_timeout_ms);
                if let Some(ms) = timeout_ms {
                    events.push(Event::barrier_wait(succ.clone()));
                    self.metrics.on_barrier_wait(&succ);
                    self.arm_watcher(succ, ms);
                }
            }
        }
        events
    }

    /// §4.3.2's post-dispatch rule: emit `STEP_END(owner)` (plus
    /// `MAP_COMPLETE` for map owners) and schedule successors, unless
    /// `owner` was marked skipped — in which case neither happens and the
    /// mark is consumed (invariant 4).
    fn maybe_complete(&mut self, ctx: &RunContext<S, C>, owner: &str) -> Vec<Event> {
        if *self.logical_active.get(owner).unwrap_or(&0) != 0 {
            return Vec::new();
        }
        if self.skipped_owners.remove(owner) {
            return Vec::new();
        }
        let identity = self.owner_identity(owner);
        let node_kind = self.node_kind_of(owner);
        let mut events =
            vec![stamp_identity(Event::step_end(owner.to_string(), node_kind, serde_json::Value::Null), &identity)];
        if node_kind == NodeKind::Map {
            events.push(stamp_identity(Event::map_complete(owner.to_string()), &identity));
        }
        events.extend(self.schedule_successors(ctx, owner));
        events
    }

    fn decrement(&mut self, owner: &str) {
        self.total_active_tasks = self.total_active_tasks.saturating_sub(1);
        if let Some(count) = self.logical_active.get_mut(owner) {
            *count = count.saturating_sub(1);
        }
    }

    /// §4.3.3: try the step's local `on_error` handler, then the pipeline's
    /// global handler. Returns the recovering directive, or `None` once
    /// both have been exhausted (logged via the standard tracing sink with
    /// structured fields, per spec).
    async fn run_error_handlers(&self, step_name: &str, error: &StepError) -> Option<Directive> {
        if let Some(registration) = self.pipeline.registry.get(step_name) {
            if let Some(handler) = &registration.on_error {
                match handler.handle(self.state.clone(), self.context.clone(), error, step_name).await {
                    Ok(directive) => return Some(directive),
                    Err(local_err) => {
                        tracing::debug!(
                            step = step_name,
                            local_handler_error = %local_err,
                            original_error = %error,
                            "local error handler raised; falling back to global handler"
                        );
                    }
                }
            }
        }
        if let Some(global) = &self.pipeline.global_error_handler {
            match global.handle(self.state.clone(), self.context.clone(), error, step_name).await {
                Ok(directive) => return Some(directive),
                Err(global_err) => {
                    tracing::error!(
                        step_name = step_name,
                        error_type = std::any::type_name_of_val(&global_err),
                        state_type = std::any::type_name::<S>(),
                        "{global_err}"
                    );
                }
            }
        }
        None
    }

    /// §4.3.2's dispatch switch, applied once a worker's outcome has been
    /// confirmed to be a routable [`Directive`] (not a failure). `identity`
    /// is the just-completed invocation's own identity, used both to stamp
    /// events constructed here (`SUSPEND`, `MAP_START`) and as the `parent`
    /// for anything this directive schedules.
    fn process_directive(
        &mut self,
        ctx: &mut RunContext<S, C>,
        owner: &str,
        name: &str,
        directive: Directive,
        identity: &InvocationIdentity,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        match directive {
            Directive::Skip => {
                self.skipped_owners.insert(owner.to_string());
                return events;
            }
            Directive::Retry => {
                ctx.next_attempt(name);
                events.extend(self.schedule(
                    ctx,
                    name.to_string(),
                    Some(owner.to_string()),
                    StepPayload::None,
                    Some(identity),
                ));
                return events;
            }
            Directive::Stop => {
                self.stopping = true;
            }
            Directive::Suspend(reason) => {
                events.push(stamp_identity(Event::suspend(name.to_string(), reason), identity));
                self.stopping = true;
            }
            Directive::Next(target) => {
                events.extend(self.schedule(ctx, target, None, StepPayload::None, Some(identity)));
            }
            Directive::Map(items, target) => {
                events.push(stamp_identity(Event::map_start(owner.to_string(), items.len()), identity));
                for item in items {
                    events.extend(self.schedule(
                        ctx,
                        target.clone(),
                        Some(owner.to_string()),
                        StepPayload::Item(item),
                        Some(identity),
                    ));
                }
            }
            Directive::Run(sub_pipeline_ref, sub_state) => {
                events.extend(self.spawn_sub_pipeline(owner.to_string(), sub_pipeline_ref, sub_state));
                return events;
            }
            Directive::Value(_) => {}
            Directive::Raise(_) => unreachable!("Raise is classified as a failure before process_directive"),
        }
        events.extend(self.maybe_complete(ctx, owner));
        events
    }

    /// A sub-pipeline step returned `Run(pipe, sub_state)` (§9): run the
    /// child pipeline to completion on the same state/context, rewriting
    /// every nested event's stage to `"{owner}:{inner_stage}"`. The child's
    /// own resolved status becomes the owner's completion value.
    fn spawn_sub_pipeline(&mut self, owner: String, sub_pipeline_ref: String, sub_state: serde_json::Value) -> Vec<Event> {
        *self.logical_active.entry(owner.clone()).or_insert(0) += 1;
        self.total_active_tasks += 1;
        let identity = self.owner_identity(&owner);

        let Some(sub_pipeline) = self.pipeline.sub_pipelines.get(&sub_pipeline_ref).cloned() else {
            let _ = self.tx.send(QueueItem::Result(StepOutcome {
                owner: owner.clone(),
                name: owner,
                directive: Err(WorkerError::Step(StepError::message(format!(
                    "unknown sub-pipeline reference '{sub_pipeline_ref}'"
                )))),
                identity,
            }));
            return Vec::new();
        };

        let state = self.state.clone();
        let context = self.context.clone();
        let tx = self.tx.clone();
        let owner_for_task = owner.clone();
        let identity_for_task = identity.clone();

        self.join_set.spawn(async move {
            let sub_runner = PipelineRunner::new(sub_pipeline);
            let stream = sub_runner.run(state, context, None);
            tokio::pin!(stream);
            let mut last_payload = serde_json::json!({ "seed": sub_state });
            while let Some(mut nested) = stream.next().await {
                nested.stage = format!("{owner_for_task}:{}", nested.stage);
                nested.parent_invocation_id = identity_for_task.invocation_id.clone();
                let mut scope = identity_for_task.scope.clone();
                if let Some(id) = &identity_for_task.invocation_id {
                    scope.push(id.clone());
                }
                scope.extend(nested.scope.clone());
                nested.scope = scope;
                last_payload = nested.payload.clone();
                let _ = tx.send(QueueItem::Nested(nested));
            }
            let _ = tx.send(QueueItem::Result(StepOutcome {
                owner: owner_for_task.clone(),
                name: owner_for_task,
                directive: Ok(Directive::Value(last_payload)),
                identity: identity_for_task,
            }));
        });
        Vec::new()
    }

    /// One [`StepOutcome`] dequeued from the consumer's channel: decrement
    /// counters once, then classify and dispatch (§4.3.2/§4.3.3).
    async fn handle_worker_result(&mut self, ctx: &mut RunContext<S, C>, outcome: StepOutcome) -> Vec<Event> {
        let StepOutcome { owner, name, directive, identity } = outcome;
        self.decrement(&owner);
        self.metrics.on_task_completed(&owner, owner != name);

        // An explicit `Directive::Retry` always reschedules unconditionally
        // (§3, invariant 5); auto-retry-on-raise only applies to the two
        // failure shapes below and is tried before any handler runs.
        let failure = match directive {
            Err(worker_err) => Some(failure_info(worker_err)),
            Ok(Directive::Raise(message)) => Some(FailureInfo {
                reason: FailureReason::StepRaised,
                message: message.unwrap_or_else(|| format!("step '{name}' raised")),
            }),
            Ok(directive) => return self.process_directive(ctx, &owner, &name, directive, &identity),
        };
        let info = failure.expect("Ok(directive) branch returns above");

        if self.retry_budget_remaining(ctx, &name) {
            let delay = self.pipeline.registry.get(&name).and_then(|r| match r.config.retries {
                crate::step::RetryPolicy::Count { wait_min_ms, wait_max_ms, .. } => {
                    Some(backoff_delay(ctx.attempt_of(&name), wait_min_ms, wait_max_ms))
                }
                crate::step::RetryPolicy::Disabled => None,
            });
            ctx.next_attempt(&name);
            return self.schedule_after(ctx, name, Some(owner), StepPayload::None, delay, Some(&identity));
        }

        let step_error = StepError::message(info.message.clone());
        let mut events = Vec::new();
        match self.run_error_handlers(&name, &step_error).await {
            Some(directive) => {
                events.extend(self.process_directive(ctx, &owner, &name, directive, &identity));
            }
            None => {
                events.push(stamp_identity(
                    Event::step_error(name.clone(), self.node_kind_of(&name), info.message.clone()),
                    &identity,
                ));
                self.pipeline.failure_journal.record_failure(
                    &mut ctx.log,
                    FailureKind::Step,
                    FailureSource::User,
                    info.reason,
                    Some(info.message),
                    Some(name),
                    None,
                );
                events.extend(self.maybe_complete(ctx, &owner));
            }
        }
        events
    }

    fn retry_budget_remaining(&self, ctx: &RunContext<S, C>, name: &str) -> bool {
        matches!(
            self.pipeline.registry.get(name).map(|r| r.config.retries),
            Some(crate::step::RetryPolicy::Count { attempts, .. }) if ctx.attempt_of(name) < attempts
        )
    }

    /// Barrier timeout fired and the barrier is still unsatisfied (§4.3.4):
    /// route the synthesized timeout error through the same local/global
    /// handler trial as a normal step failure (§4.3.3). `succ` never
    /// started, so recovery schedules it fresh; non-recovery emits
    /// `STEP_ERROR` with no `STEP_END` (it never ran).
    async fn handle_barrier_timeout(&mut self, ctx: &mut RunContext<S, C>, step: String) -> Vec<Event> {
        let was_armed = self.barrier_watchers.remove(&step).is_some();
        if !was_armed {
            return Vec::new();
        }
        self.total_active_tasks = self.total_active_tasks.saturating_sub(1);
        if self.barrier_wait_started.remove(&step).is_some() {
            self.metrics.on_barrier_timeout(&step);
        }
        if self.progress.is_barrier_satisfied(&self.pipeline.graph, &step) {
            return Vec::new();
        }

        let timeout_ms = self
            .pipeline
            .registry
            .get(&step)
            .and_then(|r| r.config.barrier_timeout_ms)
            .or(self.pipeline.config.default_barrier_timeout_ms)
            .unwrap_or(0);
        let timeout_secs = Duration::from_millis(timeout_ms).as_secs_f64();
        let message = format!("Barrier timeout for step '{step}' after {timeout_secs}s");
        let identity = self.owner_identity(&step);
        let error = StepError::message(message.clone());
        let mut events = Vec::new();
        match self.run_error_handlers(&step, &error).await {
            Some(directive) => {
                events.extend(self.process_directive(ctx, &step, &step, directive, &identity));
            }
            None => {
                events.push(stamp_identity(
                    Event::step_error(step.clone(), self.node_kind_of(&step), message.clone()),
                    &identity,
                ));
                self.pipeline.failure_journal.record_failure(
                    &mut ctx.log,
                    FailureKind::Step,
                    FailureSource::Framework,
                    FailureReason::StepTimeout,
                    Some(message),
                    Some(step),
                    None,
                );
            }
        }
        events
    }
}
