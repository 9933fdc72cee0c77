//! # workweave: a dependency-graph workflow scheduler
//!
//! A workflow is a [`scheduler::Pipeline`]: a set of named steps wired
//! together by `to` edges, compiled once by a [`scheduler::PipelineBuilder`]
//! and then driven, any number of times, by a [`scheduler::PipelineRunner`].
//! Each run publishes an ordered stream of [`event::Event`]s ending in
//! exactly one `FINISH`.
//!
//! ## Core Concepts
//!
//! - **Steps**: async units of work ([`step::Step`]) that receive shared
//!   state/context and return a routing [`step::Directive`]
//! - **Graph**: the dependency structure between steps
//!   ([`graph::DependencyGraph`]), validated once at build time
//! - **Scheduler**: concurrent execution with barrier joins, retries, and
//!   failure handling ([`scheduler::PipelineRunner`])
//! - **Events**: the append-only, strictly-ordered record of a run
//!   ([`event::Event`], [`event::manager::EventManager`])
//! - **Outcome**: every run resolves to exactly one terminal status
//!   ([`failure::outcome::resolve_outcome`])
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use futures_util::StreamExt;
//! use workweave::scheduler::{PipelineBuilder, PipelineRunner};
//! use workweave::step::{Directive, Step, StepConfig, StepError, StepKind, StepPayload};
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl Step<(), ()> for Greet {
//!     async fn call(
//!         &self,
//!         _state: Arc<()>,
//!         _context: Arc<()>,
//!         _payload: StepPayload,
//!     ) -> Result<Directive, StepError> {
//!         Ok(Directive::Stop)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("greeting");
//! builder.add_step(StepConfig::new("greet", StepKind::Step), Arc::new(Greet)).unwrap();
//! let pipeline = Arc::new(builder.build().unwrap());
//!
//! let runner = PipelineRunner::new(pipeline);
//! let events: Vec<_> = runner.run(Arc::new(()), Arc::new(()), None).collect().await;
//! assert_eq!(events.last().unwrap().kind, workweave::event::EventType::Finish);
//! # }
//! ```
//!
//! ### Error Handling
//!
//! Every fallible surface returns a `thiserror`-derived error that also
//! implements `miette::Diagnostic`, so a caller can render a rich report
//! with `miette`'s fancy formatter or fall back to `{}`/`{:?}`:
//!
//! ```
//! use workweave::graph::{DependencyGraph, GraphError};
//! use workweave::step::{StepConfig, StepKind};
//!
//! let configs = vec![StepConfig::new("a", StepKind::Step).with_to(vec!["missing".to_string()])];
//! let graph = DependencyGraph::build(&configs);
//! let err: GraphError = graph.validate(&configs).unwrap_err();
//! eprintln!("{:?}", miette::Report::new(err));
//! ```
//!
//! ## Module Guide
//!
//! - [`graph`] - dependency graph construction, validation, and barrier joins
//! - [`step`] - step trait, directives, retry policy, and the registry
//! - [`event`] - the event envelope and its publish pipeline
//! - [`failure`] - failure classification and outcome resolution
//! - [`runstate`] - run phase state machine and per-run context
//! - [`scheduler`] - pipeline registration and the execution loop
//! - [`metrics`] - in-memory run metrics
//! - [`cancel`] - cooperative cancellation token
//! - [`meta`] - ambient per-task/per-run metadata
//! - [`ids`] - run/invocation/event id generation
//! - [`recorder`] - the run-history storage seam
//! - [`config`] - engine-wide tunables
//! - [`testing`] - assertions over a completed run's event log
//! - [`telemetry`] - optional `tracing` subscriber setup for embedders

pub mod cancel;
pub mod config;
pub mod event;
pub mod failure;
pub mod graph;
pub mod ids;
pub mod meta;
pub mod metrics;
pub mod recorder;
pub mod runstate;
pub mod scheduler;
pub mod step;
pub mod telemetry;
pub mod testing;
