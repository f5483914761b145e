pub mod cli;
pub mod commands;
pub mod env_loader;
pub mod error;
pub mod logging;
pub mod prebake;

pub use prebake::orchestrator::{Orchestrator, PipelineOptions, PrebakeResult};
