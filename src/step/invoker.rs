//! Dispatches a single step invocation: resolves the registered
//! implementation, wraps it in the configured timeout, and drains its token
//! stream (if any) into the event channel before returning its directive.

use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use futures_util::StreamExt;
use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::event::Event;
use crate::step::{Directive, StepConfig, StepError, StepKind, StepPayload, StreamItem};

/// Raised by [`StepInvoker::execute`] itself, as opposed to [`StepError`]
/// raised by the step implementation.
#[derive(Debug, Error, Diagnostic)]
pub enum InvokeError {
    #[error("step '{0}' timed out after {1:?}")]
    #[diagnostic(
        code(workweave::step::timed_out),
        help("Raise the step's configured timeout or make it cheaper.")
    )]
    TimedOut(String, Duration),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Step(#[from] StepError),
}

/// A step callable, abstracted over whether it streams tokens or returns a
/// single directive directly. [`crate::step::Step`] implementations are
/// adapted into this shape by the registry at registration time.
#[async_trait::async_trait]
pub trait Invocable<S, C>: Send + Sync
where
    S: Send + Sync,
    C: Send + Sync,
{
    async fn invoke(
        &self,
        state: Arc<S>,
        context: Arc<C>,
        payload: StepPayload,
        tokens: Sender<Event>,
        step_name: &str,
    ) -> Result<Directive, StepError>;
}

/// Runs one step to completion, applying its timeout (if any) and draining
/// any streamed tokens as `TOKEN` events ahead of the final directive.
pub struct StepInvoker;

impl StepInvoker {
    /// Execute `invocable`, emitting `TOKEN` events for every non-directive
    /// item it streams and returning the last directive it yields (or its
    /// single returned directive, for non-streaming steps).
    #[instrument(skip(invocable, state, context, payload, tokens), err)]
    pub async fn execute<S, C>(
        step_name: &str,
        invocable: &dyn Invocable<S, C>,
        state: Arc<S>,
        context: Arc<C>,
        payload: StepPayload,
        tokens: Sender<Event>,
        timeout: Option<Duration>,
    ) -> Result<Directive, InvokeError>
    where
        S: Send + Sync,
        C: Send + Sync,
    {
        let call = invocable.invoke(state, context, payload, tokens, step_name);
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, call).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(InvokeError::TimedOut(step_name.to_string(), duration)),
            },
            None => Ok(call.await?),
        }
    }

    /// Drain a token-streaming step's output into `tokens`, returning the
    /// last directive it yields (`None` if it never yielded one).
    pub async fn drain_stream(
        step_name: &str,
        mut stream: futures_util::stream::BoxStream<'static, StreamItem>,
        tokens: &Sender<Event>,
    ) -> Option<Directive> {
        let mut last = None;
        while let Some(item) = stream.next().await {
            match item {
                StreamItem::Token(value) => {
                    if tokens.send(Event::token(step_name, value)).is_err() {
                        tracing::warn!(step = step_name, "token receiver dropped mid-stream");
                    }
                }
                StreamItem::Directive(directive) => last = Some(directive),
            }
        }
        last
    }
}

/// Reinterprets a raw returned [`Directive`] according to the step's
/// [`StepKind`] (§4.2): map steps return items to fan out, switch steps
/// return a key to resolve against the route table, sub-pipeline steps
/// return the child's initial state. Standard steps pass their directive
/// through unchanged — any directive variant is meaningful coming
/// straight from user code.
pub fn finalize_directive(config: &StepConfig, directive: Directive) -> Result<Directive, StepError> {
    match config.kind {
        StepKind::Step => Ok(directive),
        StepKind::Map => match directive {
            already @ Directive::Map(..) => Ok(already),
            Directive::Value(serde_json::Value::Array(items)) => {
                let target = config
                    .map_target
                    .clone()
                    .ok_or_else(|| StepError::message(format!("map step '{}' has no map_target", config.name)))?;
                Ok(Directive::Map(items, target))
            }
            other @ (Directive::Stop
            | Directive::Retry
            | Directive::Skip
            | Directive::Suspend(_)
            | Directive::Raise(_)) => Ok(other),
            other => Err(StepError::message(format!(
                "map step '{}' must return a list of items, got {other:?}",
                config.name
            ))),
        },
        StepKind::Switch => match directive {
            already @ Directive::Next(_) => Ok(already),
            already @ (Directive::Stop
            | Directive::Retry
            | Directive::Skip
            | Directive::Suspend(_)
            | Directive::Raise(_)) => Ok(already),
            Directive::Value(value) => resolve_switch_key(config, &value),
            other => Err(StepError::message(format!(
                "switch step '{}' must return a routing key, got {other:?}",
                config.name
            ))),
        },
        StepKind::Sub => match directive {
            already @ Directive::Run(..) => Ok(already),
            already @ (Directive::Stop
            | Directive::Retry
            | Directive::Skip
            | Directive::Suspend(_)
            | Directive::Raise(_)) => Ok(already),
            Directive::Value(sub_state) => {
                let pipe = config.sub_pipeline_ref.clone().ok_or_else(|| {
                    StepError::message(format!("sub-pipeline step '{}' has no sub_pipeline_ref", config.name))
                })?;
                Ok(Directive::Run(pipe, sub_state))
            }
            other => Err(StepError::message(format!(
                "sub-pipeline step '{}' must return its child state, got {other:?}",
                config.name
            ))),
        },
    }
}

fn resolve_switch_key(config: &StepConfig, key: &serde_json::Value) -> Result<Directive, StepError> {
    let key_str = match key {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => {
            return Err(StepError::message(format!(
                "switch step '{}' returned a non-scalar key: {other:?}",
                config.name
            )))
        }
    };
    if let Some(target) = config.switch_routes.resolve(&key_str) {
        return Ok(Directive::Next(target.to_string()));
    }
    if let Some(default) = &config.switch_default {
        return Ok(Directive::Next(default.clone()));
    }
    Err(StepError::message(format!(
        "switch step '{}' returned unresolved key '{key_str}' with no default route",
        config.name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Invocable<(), ()> for Echo {
        async fn invoke(
            &self,
            _state: Arc<()>,
            _context: Arc<()>,
            _payload: StepPayload,
            _tokens: Sender<Event>,
            _step_name: &str,
        ) -> Result<Directive, StepError> {
            Ok(Directive::Next("b".to_string()))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Invocable<(), ()> for Sleepy {
        async fn invoke(
            &self,
            _state: Arc<()>,
            _context: Arc<()>,
            _payload: StepPayload,
            _tokens: Sender<Event>,
            _step_name: &str,
        ) -> Result<Directive, StepError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Directive::Stop)
        }
    }

    #[tokio::test]
    async fn executes_without_timeout() {
        let (tx, _rx) = flume::unbounded();
        let directive = StepInvoker::execute(
            "a",
            &Echo,
            Arc::new(()),
            Arc::new(()),
            StepPayload::None,
            tx,
            None,
        )
        .await
        .unwrap();
        assert!(matches!(directive, Directive::Next(name) if name == "b"));
    }

    #[tokio::test]
    async fn timeout_fires_before_completion() {
        let (tx, _rx) = flume::unbounded();
        let err = StepInvoker::execute(
            "slow",
            &Sleepy,
            Arc::new(()),
            Arc::new(()),
            StepPayload::None,
            tx,
            Some(Duration::from_millis(5)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, InvokeError::TimedOut(name, _) if name == "slow"));
    }

    #[tokio::test]
    async fn drain_stream_emits_tokens_and_returns_last_directive() {
        let (tx, rx) = flume::unbounded();
        let stream = Box::pin(futures_util::stream::iter(vec![
            StreamItem::Token(serde_json::json!("hello")),
            StreamItem::Token(serde_json::json!("world")),
            StreamItem::Directive(Directive::Stop),
        ]));
        let last = StepInvoker::drain_stream("a", stream, &tx).await;
        assert!(matches!(last, Some(Directive::Stop)));
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn switch_key_resolves_through_route_table() {
        use crate::step::SwitchRoutes;
        let mut routes = SwitchRoutes::new();
        routes.insert("1", "x");
        let config = StepConfig::new("r", crate::step::StepKind::Switch)
            .with_switch(routes, Some("z".to_string()));
        let directive = finalize_directive(&config, Directive::Value(serde_json::json!(1))).unwrap();
        assert!(matches!(directive, Directive::Next(t) if t == "x"));
    }

    #[test]
    fn switch_key_falls_back_to_default() {
        use crate::step::SwitchRoutes;
        let mut routes = SwitchRoutes::new();
        routes.insert("1", "x");
        let config = StepConfig::new("r", crate::step::StepKind::Switch)
            .with_switch(routes, Some("z".to_string()));
        let directive = finalize_directive(&config, Directive::Value(serde_json::json!(3))).unwrap();
        assert!(matches!(directive, Directive::Next(t) if t == "z"));
    }

    #[test]
    fn switch_key_unresolved_without_default_fails() {
        use crate::step::SwitchRoutes;
        let mut routes = SwitchRoutes::new();
        routes.insert("1", "x");
        let config = StepConfig::new("r", crate::step::StepKind::Switch).with_switch(routes, None);
        assert!(finalize_directive(&config, Directive::Value(serde_json::json!(3))).is_err());
    }

    #[test]
    fn map_step_wraps_array_value_into_map_directive() {
        let config = StepConfig::new("m", crate::step::StepKind::Map).with_map_target("w");
        let directive =
            finalize_directive(&config, Directive::Value(serde_json::json!([1, 2, 3]))).unwrap();
        match directive {
            Directive::Map(items, target) => {
                assert_eq!(items.len(), 3);
                assert_eq!(target, "w");
            }
            other => panic!("expected Map, got {other:?}"),
        }
    }

    #[test]
    fn sub_step_wraps_value_into_run_directive() {
        let config = StepConfig::new("s", crate::step::StepKind::Sub).with_sub_pipeline("child");
        let directive =
            finalize_directive(&config, Directive::Value(serde_json::json!({"k": "v"}))).unwrap();
        assert!(matches!(directive, Directive::Run(pipe, _) if pipe == "child"));
    }
}
