//! pureza-api - versioned catalog API with pooled storage, a circuit breaker and health aggregation

pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod health;
pub mod pool;

pub use crate::config::Config;
pub use crate::core::Core;
