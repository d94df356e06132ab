//! rollcall daemon library: configuration, the pipeline controller and its
//! detection loop, overlay rendering, and a still-image replay source.

pub mod annotate;
pub mod config;
mod engine;
pub mod pipeline;
pub mod replay;

pub use annotate::AnnotatedFrame;
pub use config::{Config, ConfigError};
pub use pipeline::{Pipeline, PipelineError, PipelineState, Statistics};
pub use replay::ReplayOpener;
