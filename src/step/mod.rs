//! Step configuration, directives, and the step registry.
//!
//! Rust has no runtime signature introspection, so the dependency-injection
//! descriptor of the original design (matching parameter names/types against
//! `state`/`context`/`error`/`step_name` aliases) is replaced by an explicit
//! [`Step`] trait: every step kind receives exactly the arguments its kind
//! implies (state, context, and — for map workers only — a payload item).
//! See `DESIGN.md` Open Question 1.

pub mod invoker;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

/// The four step kinds described in §3's `StepConfig`. Each kind determines
/// which routing fields of [`StepConfig`] are populated and how the
/// invoker interprets the step's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Step,
    Map,
    Switch,
    Sub,
}

/// Declarative retry policy. An integer count implies up to N+1 attempts
/// with exponential backoff bounded by `wait_min`/`wait_max` (§9); a
/// `Disabled` policy is forced onto streaming steps, which cannot be
/// rewound (the generator already consumed its source).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    Disabled,
    Count { attempts: u32, wait_min_ms: u64, wait_max_ms: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Disabled
    }
}

/// Static routing target for a switch step: either a fixed mapping from a
/// returned key to a target step, or left to [`StepConfig::switch_default`].
#[derive(Debug, Clone, Default)]
pub struct SwitchRoutes {
    routes: FxHashMap<String, String>,
}

impl SwitchRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, target: impl Into<String>) {
        self.routes.insert(key.into(), target.into());
    }

    pub fn resolve(&self, key: &str) -> Option<&str> {
        self.routes.get(key).map(String::as_str)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.routes.values().map(String::as_str)
    }
}

/// One registered step's static configuration (§3's `StepConfig`).
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub name: String,
    pub kind: StepKind,
    pub to: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub retries: RetryPolicy,
    pub barrier_timeout_ms: Option<u64>,
    pub has_error_handler: bool,
    pub map_target: Option<String>,
    pub switch_routes: SwitchRoutes,
    pub switch_default: Option<String>,
    pub sub_pipeline_ref: Option<String>,
    pub extra: Value,
}

impl StepConfig {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            to: Vec::new(),
            timeout_ms: None,
            retries: RetryPolicy::default(),
            barrier_timeout_ms: None,
            has_error_handler: false,
            map_target: None,
            switch_routes: SwitchRoutes::default(),
            switch_default: None,
            sub_pipeline_ref: None,
            extra: Value::Null,
        }
    }

    #[must_use]
    pub fn with_to(mut self, to: Vec<String>) -> Self {
        self.to = to;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_barrier_timeout_ms(mut self, barrier_timeout_ms: u64) -> Self {
        self.barrier_timeout_ms = Some(barrier_timeout_ms);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, attempts: u32, wait_min_ms: u64, wait_max_ms: u64) -> Self {
        self.retries = RetryPolicy::Count { attempts, wait_min_ms, wait_max_ms };
        self
    }

    #[must_use]
    pub fn with_map_target(mut self, target: impl Into<String>) -> Self {
        self.map_target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_switch(mut self, routes: SwitchRoutes, default: Option<String>) -> Self {
        self.switch_routes = routes;
        self.switch_default = default;
        self
    }

    #[must_use]
    pub fn with_sub_pipeline(mut self, pipeline_ref: impl Into<String>) -> Self {
        self.sub_pipeline_ref = Some(pipeline_ref.into());
        self
    }

    /// Every step name this step's static configuration can route to,
    /// across `to`, `map_target`, and `switch_routes`/`switch_default`.
    /// Used by [`crate::graph::DependencyGraph`] to build the topology and
    /// parents map.
    ///
    /// `sub_pipeline_ref` is deliberately excluded: it names an entry in
    /// the separate `sub_pipelines` namespace, not a step, and is resolved
    /// at runtime rather than against step names.
    pub fn all_targets(&self) -> Vec<String> {
        let mut targets = self.to.clone();
        if let Some(map_target) = &self.map_target {
            targets.push(map_target.clone());
        }
        targets.extend(self.switch_routes.targets().map(str::to_string));
        if let Some(default) = &self.switch_default {
            targets.push(default.clone());
        }
        targets
    }
}

/// The payload a worker is invoked with: nothing for standard/switch/sub
/// steps, a single fanned-out item for map workers.
#[derive(Debug, Clone)]
pub enum StepPayload {
    None,
    Item(Value),
}

/// A value a step implementation may yield while streaming (see
/// [`invoker`]): either a token to emit immediately as a `TOKEN` event, or a
/// directive that becomes the step's eventual result.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Token(Value),
    Directive(Directive),
}

/// Tagged values a step may return to instruct the scheduler (§3).
#[derive(Debug, Clone)]
pub enum Directive {
    Next(String),
    Map(Vec<Value>, String),
    Run(String, Value),
    Suspend(String),
    Stop,
    Retry,
    Skip,
    Raise(Option<String>),
    Value(Value),
}

impl Directive {
    /// A bare string return value is coerced to `Next` (§3).
    pub fn from_string(s: impl Into<String>) -> Self {
        Directive::Next(s.into())
    }
}

/// Errors a [`Step`] implementation may raise. Carries enough context for
/// the scheduler's failure pipeline (§4.3.3) to classify and journal it.
#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    #[error("{message}")]
    #[diagnostic(code(workweave::step::failed))]
    Failed { message: String, #[source] source: Option<Box<dyn std::error::Error + Send + Sync>> },
    #[error("step cancelled: {0}")]
    #[diagnostic(code(workweave::step::cancelled))]
    Cancelled(#[from] crate::cancel::CancelledError),
}

impl StepError {
    pub fn message(message: impl Into<String>) -> Self {
        StepError::Failed { message: message.into(), source: None }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        StepError::Failed { message: message.into(), source: Some(Box::new(source)) }
    }
}

/// The unit of user-supplied work. One implementation per step name,
/// invoked with exactly the inputs its [`StepKind`] implies — standard
/// Rust generics in place of the original's reflection-based injection.
#[async_trait]
pub trait Step<S, C>: Send + Sync
where
    S: Send + Sync,
    C: Send + Sync,
{
    async fn call(
        &self,
        state: Arc<S>,
        context: Arc<C>,
        payload: StepPayload,
    ) -> Result<Directive, StepError>;
}

/// A step implementation that streams tokens before producing its final
/// directive, via the async-generator protocol of §4.2.
#[async_trait]
pub trait StreamingStep<S, C>: Send + Sync
where
    S: Send + Sync,
    C: Send + Sync,
{
    fn call_stream(
        &self,
        state: Arc<S>,
        context: Arc<C>,
        payload: StepPayload,
    ) -> futures_util::stream::BoxStream<'static, StreamItem>;
}
