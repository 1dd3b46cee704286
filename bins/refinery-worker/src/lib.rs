pub mod batch;
pub mod config;
pub mod controller;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod metrics;
pub mod oracle;
pub mod prompts;
