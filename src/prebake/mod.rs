pub mod accuracy;
pub mod audit;
pub mod checkpoint;
pub mod classify;
pub mod condense;
pub mod config;
pub mod entry;
pub mod evaluator;
pub mod integrity;
pub mod oracle;
pub mod orchestrator;
pub mod paths;
pub mod progress;
pub mod ratio;
pub mod reader;
pub mod stages;
pub mod store;
pub mod util;
