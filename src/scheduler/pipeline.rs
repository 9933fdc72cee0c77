//! The registration surface (§6): a [`PipelineBuilder`] accumulates steps,
//! lifecycle hooks, observers, and sub-pipelines, then [`PipelineBuilder::build`]
//! performs the one synchronous validation pass (§7) and hands back an
//! immutable [`Pipeline`] ready to be driven by [`super::PipelineRunner`].

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::EngineConfig;
use crate::event::manager::Observer;
use crate::event::Event;
use crate::failure::{FailureClassificationConfig, FailureJournal, FailureSourceClassifier};
use crate::graph::DependencyGraph;
use crate::step::registry::{ErrorHandler, Implementation, LifecycleHook, RegistrationError, StepRegistry};
use crate::step::{Step, StepConfig, StepKind, StreamingStep};

type EventHook = Arc<dyn Fn(Event) -> Option<Event> + Send + Sync>;
type StepMiddleware<S, C> = Arc<dyn Fn(Arc<dyn Step<S, C>>) -> Arc<dyn Step<S, C>> + Send + Sync>;

/// Accumulates registrations before the one-time validation pass.
pub struct PipelineBuilder<S, C> {
    name: String,
    registry: StepRegistry<S, C>,
    startup_hooks: Vec<Arc<dyn LifecycleHook<S, C>>>,
    shutdown_hooks: Vec<Arc<dyn LifecycleHook<S, C>>>,
    global_error_handler: Option<Arc<dyn ErrorHandler<S, C>>>,
    event_hooks: Vec<(String, EventHook)>,
    observers: Vec<Arc<dyn Observer>>,
    sub_pipelines: FxHashMap<String, Arc<Pipeline<S, C>>>,
    middlewares: Vec<StepMiddleware<S, C>>,
    failure_config: FailureClassificationConfig,
    config: EngineConfig,
}

impl<S, C> PipelineBuilder<S, C>
where
    S: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: StepRegistry::new(),
            startup_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
            global_error_handler: None,
            event_hooks: Vec::new(),
            observers: Vec::new(),
            sub_pipelines: FxHashMap::default(),
            middlewares: Vec::new(),
            failure_config: FailureClassificationConfig::default(),
            config: EngineConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a middleware that composes around every standard step
    /// registered *after* this call (§6's `add_middleware`): retry
    /// policies, logging wrappers, and similar cross-cutting transforms
    /// are applied in registration order, innermost-first.
    pub fn add_middleware<F>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Arc<dyn Step<S, C>>) -> Arc<dyn Step<S, C>> + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    fn apply_middlewares(&self, step: Arc<dyn Step<S, C>>) -> Arc<dyn Step<S, C>> {
        self.middlewares.iter().fold(step, |acc, mw| mw(acc))
    }

    pub fn add_step(
        &mut self,
        config: StepConfig,
        step: Arc<dyn Step<S, C>>,
    ) -> Result<&mut Self, RegistrationError> {
        self.add_step_with_error_handler(config, step, None)
    }

    pub fn add_step_with_error_handler(
        &mut self,
        config: StepConfig,
        step: Arc<dyn Step<S, C>>,
        on_error: Option<Arc<dyn ErrorHandler<S, C>>>,
    ) -> Result<&mut Self, RegistrationError> {
        let step = self.apply_middlewares(step);
        self.registry.register(config, Implementation::Standard(step), on_error)?;
        Ok(self)
    }

    /// Register a token-streaming step (§4.2's async-generator protocol).
    /// Streaming steps cannot be auto-retried (the generator cannot be
    /// rewound); if `config.retries` requests retries they are ignored
    /// with a warning, per §9.
    pub fn add_streaming_step(
        &mut self,
        mut config: StepConfig,
        step: Arc<dyn StreamingStep<S, C>>,
        on_error: Option<Arc<dyn ErrorHandler<S, C>>>,
    ) -> Result<&mut Self, RegistrationError> {
        if !matches!(config.retries, crate::step::RetryPolicy::Disabled) {
            tracing::warn!(
                step = %config.name,
                "streaming steps cannot be auto-retried; disabling configured retry policy"
            );
            config.retries = crate::step::RetryPolicy::Disabled;
        }
        self.registry.register(config, Implementation::Streaming(step), on_error)?;
        Ok(self)
    }

    pub fn add_startup_hook(&mut self, hook: Arc<dyn LifecycleHook<S, C>>) -> &mut Self {
        self.startup_hooks.push(hook);
        self
    }

    pub fn add_shutdown_hook(&mut self, hook: Arc<dyn LifecycleHook<S, C>>) -> &mut Self {
        self.shutdown_hooks.push(hook);
        self
    }

    pub fn set_global_error_handler(&mut self, handler: Arc<dyn ErrorHandler<S, C>>) -> &mut Self {
        self.global_error_handler = Some(handler);
        self
    }

    pub fn add_event_hook(
        &mut self,
        name: impl Into<String>,
        hook: impl Fn(Event) -> Option<Event> + Send + Sync + 'static,
    ) -> &mut Self {
        self.event_hooks.push((name.into(), Arc::new(hook)));
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) -> &mut Self {
        self.observers.push(observer);
        self
    }

    pub fn add_sub_pipeline(&mut self, name: impl Into<String>, pipeline: Arc<Pipeline<S, C>>) -> &mut Self {
        self.sub_pipelines.insert(name.into(), pipeline);
        self
    }

    pub fn add_external_dependency_prefix(&mut self, prefix: &'static str) -> &mut Self {
        self.failure_config.external_dependency_prefixes.push(prefix);
        self
    }

    pub fn set_source_classifier(&mut self, classifier: FailureSourceClassifier) -> &mut Self {
        self.failure_config.source_classifier = Some(classifier);
        self
    }

    /// Validate the registered topology and freeze the builder into an
    /// immutable, runnable [`Pipeline`].
    pub fn build(self) -> Result<Pipeline<S, C>, RegistrationError> {
        let graph = self.registry.build_graph()?;
        Ok(Pipeline {
            name: self.name,
            registry: self.registry,
            graph,
            startup_hooks: self.startup_hooks,
            shutdown_hooks: self.shutdown_hooks,
            global_error_handler: self.global_error_handler,
            event_hooks: self.event_hooks,
            observers: self.observers,
            sub_pipelines: self.sub_pipelines,
            failure_journal: FailureJournal::new(self.failure_config),
            config: self.config,
        })
    }
}

/// An immutable, validated pipeline definition, ready to be driven
/// repeatedly by [`super::PipelineRunner::run`]. Everything here is
/// read-only once built; per-run mutable state lives entirely in the
/// runner's local scheduling loop (§3's ownership rule).
pub struct Pipeline<S, C> {
    pub(crate) name: String,
    pub(crate) registry: StepRegistry<S, C>,
    pub(crate) graph: DependencyGraph,
    pub(crate) startup_hooks: Vec<Arc<dyn LifecycleHook<S, C>>>,
    pub(crate) shutdown_hooks: Vec<Arc<dyn LifecycleHook<S, C>>>,
    pub(crate) global_error_handler: Option<Arc<dyn ErrorHandler<S, C>>>,
    pub(crate) event_hooks: Vec<(String, EventHook)>,
    pub(crate) observers: Vec<Arc<dyn Observer>>,
    pub(crate) sub_pipelines: FxHashMap<String, Arc<Pipeline<S, C>>>,
    pub(crate) failure_journal: FailureJournal,
    pub(crate) config: EngineConfig,
}

impl<S, C> Pipeline<S, C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.registry.configs_ref_names()
    }
}

// Small helper kept next to the registry rather than duplicating the
// `order` field's visibility; `configs_ref_names` walks registered names
// without cloning every `StepConfig` just to list them.
impl<S, C> StepRegistry<S, C> {
    pub(crate) fn configs_ref_names(&self) -> std::vec::IntoIter<&str> {
        self.configs_names().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::step::{Directive, StepError, StepPayload};

    struct NoopStep;

    #[async_trait]
    impl Step<(), ()> for NoopStep {
        async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
            Ok(Directive::Stop)
        }
    }

    #[test]
    fn build_fails_on_invalid_topology() {
        let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("p");
        builder
            .add_step(
                StepConfig::new("a", StepKind::Step).with_to(vec!["ghost".to_string()]),
                Arc::new(NoopStep),
            )
            .unwrap();
        assert!(builder.build().is_err());
    }

    #[test]
    fn build_succeeds_for_linear_topology() {
        let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("p");
        builder
            .add_step(StepConfig::new("a", StepKind::Step).with_to(vec!["b".to_string()]), Arc::new(NoopStep))
            .unwrap();
        builder.add_step(StepConfig::new("b", StepKind::Step), Arc::new(NoopStep)).unwrap();
        let pipeline = builder.build().unwrap();
        assert_eq!(pipeline.name(), "p");
    }
}
