//! Registration-time collection of steps: binds each [`StepConfig`] to its
//! user-supplied implementation and, optionally, a local error handler,
//! then hands the whole set to [`crate::graph::DependencyGraph`] for
//! validation (§6's `add_step` surface).

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::graph::{DependencyGraph, GraphError};
use crate::step::invoker::Invocable;
use crate::step::{Directive, Step, StepConfig, StepError, StepKind, StepPayload, StreamingStep};

/// Raised by [`StepRegistry::register`] for malformed registration, before
/// any run ever starts (§7: "Validation errors are raised synchronously
/// from `validate()` / registration time, never during a run").
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("step '{0}' is already registered")]
    #[diagnostic(code(workweave::registry::duplicate_name))]
    DuplicateName(String),
    #[error("map step '{0}' must declare a map_target")]
    #[diagnostic(code(workweave::registry::missing_map_target))]
    MissingMapTarget(String),
    #[error("switch step '{0}' must declare at least one route or a default")]
    #[diagnostic(code(workweave::registry::empty_switch))]
    EmptySwitch(String),
    #[error("sub-pipeline step '{0}' must declare a sub_pipeline_ref")]
    #[diagnostic(code(workweave::registry::missing_sub_pipeline_ref))]
    MissingSubPipelineRef(String),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),
}

/// A local `on_error` handler, tried before the pipeline's global handler
/// (§4.3.3). Receives the same injectable arguments as a standard step
/// plus the error that triggered it.
#[async_trait]
pub trait ErrorHandler<S, C>: Send + Sync
where
    S: Send + Sync,
    C: Send + Sync,
{
    async fn handle(
        &self,
        state: Arc<S>,
        context: Arc<C>,
        error: &StepError,
        step_name: &str,
    ) -> Result<Directive, StepError>;
}

/// A startup or shutdown hook (§6's `add_startup_hook`/`add_shutdown_hook`).
#[async_trait]
pub trait LifecycleHook<S, C>: Send + Sync
where
    S: Send + Sync,
    C: Send + Sync,
{
    async fn call(&self, state: Arc<S>, context: Arc<C>) -> Result<(), StepError>;
}

/// Either shape of step implementation a registration may carry. Adapted
/// into a uniform [`Invocable`] at invocation time so the scheduler never
/// needs to distinguish them.
pub enum Implementation<S, C> {
    Standard(Arc<dyn Step<S, C>>),
    Streaming(Arc<dyn StreamingStep<S, C>>),
}

impl<S, C> Clone for Implementation<S, C> {
    fn clone(&self) -> Self {
        match self {
            Implementation::Standard(step) => Implementation::Standard(step.clone()),
            Implementation::Streaming(step) => Implementation::Streaming(step.clone()),
        }
    }
}

#[async_trait]
impl<S, C> Invocable<S, C> for Implementation<S, C>
where
    S: Send + Sync,
    C: Send + Sync,
{
    async fn invoke(
        &self,
        state: Arc<S>,
        context: Arc<C>,
        payload: StepPayload,
        tokens: flume::Sender<crate::event::Event>,
        step_name: &str,
    ) -> Result<Directive, StepError> {
        match self {
            Implementation::Standard(step) => step.call(state, context, payload).await,
            Implementation::Streaming(step) => {
                let stream = step.call_stream(state, context, payload);
                let last =
                    crate::step::invoker::StepInvoker::drain_stream(step_name, stream, &tokens)
                        .await;
                Ok(last.unwrap_or(Directive::Value(serde_json::Value::Null)))
            }
        }
    }
}

/// One fully registered step: its static configuration, implementation,
/// and (optional) local error handler.
pub struct Registration<S, C> {
    pub config: StepConfig,
    pub implementation: Implementation<S, C>,
    pub on_error: Option<Arc<dyn ErrorHandler<S, C>>>,
}

/// The set of steps declared for one pipeline, in registration order.
/// `build_graph` is the one synchronous validation pass §7 requires before
/// any run may start.
pub struct StepRegistry<S, C> {
    order: Vec<String>,
    registrations: FxHashMap<String, Registration<S, C>>,
}

impl<S, C> Default for StepRegistry<S, C> {
    fn default() -> Self {
        Self { order: Vec::new(), registrations: FxHashMap::default() }
    }
}

impl<S, C> StepRegistry<S, C>
where
    S: Send + Sync,
    C: Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn check_kind_fields(config: &StepConfig) -> Result<(), RegistrationError> {
        match config.kind {
            StepKind::Map if config.map_target.is_none() => {
                Err(RegistrationError::MissingMapTarget(config.name.clone()))
            }
            StepKind::Switch
                if config.switch_default.is_none()
                    && config.switch_routes.targets().next().is_none() =>
            {
                Err(RegistrationError::EmptySwitch(config.name.clone()))
            }
            StepKind::Sub if config.sub_pipeline_ref.is_none() => {
                Err(RegistrationError::MissingSubPipelineRef(config.name.clone()))
            }
            _ => Ok(()),
        }
    }

    pub fn register(
        &mut self,
        config: StepConfig,
        implementation: Implementation<S, C>,
        on_error: Option<Arc<dyn ErrorHandler<S, C>>>,
    ) -> Result<(), RegistrationError> {
        if self.registrations.contains_key(&config.name) {
            return Err(RegistrationError::DuplicateName(config.name.clone()));
        }
        Self::check_kind_fields(&config)?;
        self.order.push(config.name.clone());
        self.registrations
            .insert(config.name.clone(), Registration { config, implementation, on_error });
        Ok(())
    }

    pub fn configs(&self) -> Vec<StepConfig> {
        self.order.iter().map(|name| self.registrations[name].config.clone()).collect()
    }

    pub(crate) fn configs_names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Registration<S, C>> {
        self.registrations.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Build and validate the dependency graph from the registered configs
    /// (§4.1's `validate`): every routing target must exist, no step may
    /// route to itself in the static topology, and the combined graph must
    /// be acyclic.
    pub fn build_graph(&self) -> Result<DependencyGraph, RegistrationError> {
        let configs = self.configs();
        let graph = DependencyGraph::build(&configs);
        graph.validate(&configs)?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopStep;

    #[async_trait]
    impl Step<(), ()> for NoopStep {
        async fn call(
            &self,
            _state: Arc<()>,
            _context: Arc<()>,
            _payload: StepPayload,
        ) -> Result<Directive, StepError> {
            Ok(Directive::Stop)
        }
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let mut registry: StepRegistry<(), ()> = StepRegistry::new();
        registry
            .register(StepConfig::new("a", StepKind::Step), Implementation::Standard(Arc::new(NoopStep)), None)
            .unwrap();
        let err = registry
            .register(StepConfig::new("a", StepKind::Step), Implementation::Standard(Arc::new(NoopStep)), None)
            .unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateName("a".to_string()));
    }

    #[test]
    fn register_rejects_map_step_without_target() {
        let mut registry: StepRegistry<(), ()> = StepRegistry::new();
        let err = registry
            .register(
                StepConfig::new("m", StepKind::Map),
                Implementation::Standard(Arc::new(NoopStep)),
                None,
            )
            .unwrap_err();
        assert_eq!(err, RegistrationError::MissingMapTarget("m".to_string()));
    }

    #[test]
    fn build_graph_validates_topology() {
        let mut registry: StepRegistry<(), ()> = StepRegistry::new();
        registry
            .register(
                StepConfig::new("a", StepKind::Step).with_to(vec!["a".to_string()]),
                Implementation::Standard(Arc::new(NoopStep)),
                None,
            )
            .unwrap();
        assert!(matches!(
            registry.build_graph(),
            Err(RegistrationError::Graph(GraphError::SelfRouting { .. }))
        ));
    }
}
