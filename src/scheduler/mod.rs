//! The scheduler (§4.3): registration (`pipeline`) and execution (`runner`)
//! split into graph *construction* and graph *compilation* stages.

pub mod pipeline;
pub mod runner;

pub use pipeline::{Pipeline, PipelineBuilder};
pub use runner::PipelineRunner;
