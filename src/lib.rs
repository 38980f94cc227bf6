pub mod api;
pub mod breaker;
pub mod budget;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod store;
