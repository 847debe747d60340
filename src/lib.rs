pub mod action;
pub mod client;
pub mod config;
pub mod config_validation;
pub mod context;
pub mod errors;
pub mod extractor;
pub mod journey;
pub mod metrics;
pub mod outcome;
pub mod plan;
pub mod pool;
pub mod scheduler;
pub mod stats;
pub mod transport;
pub mod user;
pub mod utils;
