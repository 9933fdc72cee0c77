//! Event preparation, hook application, and observer fan-out (§4.4).
//!
//! A broadcast-style observer transport layered under a three-stage publish
//! pipeline (`prepare` → `apply_hooks` → `notify_event`): each event is
//! stamped with its sequence number and scope before observers or hooks
//! ever see it.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::ObserverDispatch;
use crate::event::Event;
use crate::ids::{IdGen, InvocationId, RunId};

/// Snapshot handed to observer lifecycle callbacks, mirroring the bits of
/// `RunContext` an observer is allowed to see without taking a lock on it.
#[derive(Clone, Debug)]
pub struct ObserverMeta {
    pub run_id: RunId,
    pub pipe_name: String,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A pipeline-lifecycle listener. All methods default to no-ops so an
/// observer only needs to implement what it cares about. Per §4.4, any
/// error an observer raises is caught, logged, and swallowed — observers
/// must never affect run outcome.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_pipeline_start(&self, meta: &ObserverMeta) {
        let _ = meta;
    }
    async fn on_event(&self, meta: &ObserverMeta, event: &Event) {
        let _ = (meta, event);
    }
    async fn on_pipeline_end(&self, meta: &ObserverMeta, duration_secs: f64) {
        let _ = (meta, duration_secs);
    }
    async fn on_pipeline_error(&self, meta: &ObserverMeta, message: &str) {
        let _ = (meta, message);
    }
}

/// Raised by [`EventManager::apply_hooks`] when a hook misbehaves. This is
/// the one caller-visible failure mode of the publisher (§4.4); it is a
/// definition-time error, not a run-time one, and is expected to be fatal to
/// registration rather than swallowed like observer errors.
#[derive(Debug, Error, Diagnostic)]
#[error("event hook '{hook}' returned no event")]
#[diagnostic(
    code(workweave::event::hook_dropped_event),
    help("Event hooks must return Some(event); return the event unmodified to pass it through.")
)]
pub struct HookError {
    pub hook: String,
}

type Hook = Box<dyn Fn(Event) -> Option<Event> + Send + Sync>;

/// Owns the registered hooks and observers, and the broadcast channel
/// observers subscribe through. One instance per run, constructed fresh by
/// the scheduler alongside the run's [`crate::runstate::RunContext`].
pub struct EventManager {
    hooks: Vec<(String, Hook)>,
    observers: Vec<Arc<dyn Observer>>,
    broadcast: broadcast::Sender<Event>,
    id_gen: Arc<IdGen>,
    meta: ObserverMeta,
    dispatch: ObserverDispatch,
    started: std::time::Instant,
}

impl EventManager {
    pub fn new(id_gen: Arc<IdGen>, pipe_name: impl Into<String>) -> Self {
        Self::with_dispatch(id_gen, pipe_name, ObserverDispatch::Serial)
    }

    /// Per §5: observers are serialized per event by default; a caller that
    /// opts into [`ObserverDispatch::Parallel`] is asserting its observers
    /// tolerate concurrent invocation.
    pub fn with_dispatch(id_gen: Arc<IdGen>, pipe_name: impl Into<String>, dispatch: ObserverDispatch) -> Self {
        let (broadcast, _) = broadcast::channel(1024);
        let meta = ObserverMeta {
            run_id: id_gen.run_id().clone(),
            pipe_name: pipe_name.into(),
            started_at: None,
        };
        Self {
            hooks: Vec::new(),
            observers: Vec::new(),
            broadcast,
            id_gen,
            meta,
            dispatch,
            started: std::time::Instant::now(),
        }
    }

    pub fn add_hook(&mut self, name: impl Into<String>, hook: impl Fn(Event) -> Option<Event> + Send + Sync + 'static) {
        self.hooks.push((name.into(), Box::new(hook)));
    }

    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    /// Stamp `event` with its sequence number, a monotonic timestamp, and
    /// this run's identity. Scope (the ordered ancestor-invocation chain) is
    /// supplied by the caller, which already has it from the ambient
    /// [`crate::meta`] binding.
    pub fn prepare(&self, mut event: Event, scope: Vec<InvocationId>) -> Event {
        event.seq = self.id_gen.next_event_seq();
        event.timestamp = self.started.elapsed().as_secs_f64();
        event.run_id = Some(self.id_gen.run_id().clone());
        event.scope = scope;
        event
    }

    /// Thread `event` through every registered hook in registration order.
    pub fn apply_hooks(&self, mut event: Event) -> Result<Event, HookError> {
        for (name, hook) in &self.hooks {
            event = hook(event).ok_or_else(|| HookError { hook: name.clone() })?;
        }
        Ok(event)
    }

    /// Broadcast `event` to every subscriber and notify in-process
    /// observers, swallowing and logging any observer error. An observer
    /// that panics is caught via `catch_unwind` so one misbehaving
    /// observer can never abort the run (§4.4).
    pub async fn notify_event(&self, event: &Event) {
        let _ = self.broadcast.send(event.clone());
        match self.dispatch {
            ObserverDispatch::Serial => {
                for observer in &self.observers {
                    let call = std::panic::AssertUnwindSafe(observer.on_event(&self.meta, event)).catch_unwind();
                    if let Err(panic) = call.await {
                        tracing::error!(
                            stage = %event.stage,
                            panic = %panic_message(&panic),
                            "observer panicked handling an event; swallowing"
                        );
                    }
                }
            }
            ObserverDispatch::Parallel => {
                let calls = self.observers.iter().map(|observer| {
                    std::panic::AssertUnwindSafe(observer.on_event(&self.meta, event)).catch_unwind()
                });
                for result in futures_util::future::join_all(calls).await {
                    if let Err(panic) = result {
                        tracing::error!(
                            stage = %event.stage,
                            panic = %panic_message(&panic),
                            "observer panicked handling an event; swallowing"
                        );
                    }
                }
            }
        }
    }

    /// Full publish pipeline for one event: prepare, apply hooks, notify,
    /// return the (possibly hook-transformed) event for the caller to yield.
    pub async fn publish(&self, event: Event, scope: Vec<InvocationId>) -> Result<Event, HookError> {
        let event = self.prepare(event, scope);
        let event = self.apply_hooks(event)?;
        self.notify_event(&event).await;
        Ok(event)
    }

    pub async fn notify_start(&mut self) {
        self.meta.started_at = Some(chrono::Utc::now());
        for observer in &self.observers {
            let call = std::panic::AssertUnwindSafe(observer.on_pipeline_start(&self.meta)).catch_unwind();
            if let Err(panic) = call.await {
                tracing::error!(panic = %panic_message(&panic), "observer panicked on pipeline start; swallowing");
            }
        }
    }

    pub async fn notify_end(&self, duration_secs: f64) {
        for observer in &self.observers {
            let call =
                std::panic::AssertUnwindSafe(observer.on_pipeline_end(&self.meta, duration_secs)).catch_unwind();
            if let Err(panic) = call.await {
                tracing::error!(panic = %panic_message(&panic), "observer panicked on pipeline end; swallowing");
            }
        }
    }

    pub async fn notify_error(&self, message: &str) {
        for observer in &self.observers {
            let call =
                std::panic::AssertUnwindSafe(observer.on_pipeline_error(&self.meta, message)).catch_unwind();
            if let Err(panic) = call.await {
                tracing::error!(panic = %panic_message(&panic), "observer panicked on pipeline error; swallowing");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RunId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn prepare_stamps_seq_strictly_increasing() {
        let id_gen = Arc::new(IdGen::new(RunId::generate()));
        let manager = EventManager::new(id_gen, "test");
        let first = manager.prepare(Event::start(), Vec::new());
        let second = manager.prepare(Event::new(crate::event::EventType::StepStart, "a"), Vec::new());
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn apply_hooks_threads_through_registration_order() {
        let id_gen = Arc::new(IdGen::new(RunId::generate()));
        let mut manager = EventManager::new(id_gen, "test");
        manager.add_hook("tag", |mut event| {
            event.meta.insert("tagged".to_string(), serde_json::json!(true));
            Some(event)
        });
        let event = manager.apply_hooks(Event::start()).unwrap();
        assert_eq!(event.meta.get("tagged"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn apply_hooks_surfaces_misbehaving_hook() {
        let id_gen = Arc::new(IdGen::new(RunId::generate()));
        let mut manager = EventManager::new(id_gen, "test");
        manager.add_hook("broken", |_event| None);
        let err = manager.apply_hooks(Event::start()).unwrap_err();
        assert_eq!(err.hook, "broken");
    }

    struct CountingObserver {
        events: AtomicUsize,
    }

    #[async_trait]
    impl Observer for CountingObserver {
        async fn on_event(&self, _meta: &ObserverMeta, _event: &Event) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn notify_event_reaches_observers_without_affecting_caller() {
        let id_gen = Arc::new(IdGen::new(RunId::generate()));
        let mut manager = EventManager::new(id_gen, "test");
        let observer = Arc::new(CountingObserver { events: AtomicUsize::new(0) });
        manager.add_observer(observer.clone());
        manager.notify_event(&Event::start()).await;
        assert_eq!(observer.events.load(Ordering::SeqCst), 1);
    }
}
