// Core modules
pub mod api;
pub mod config;
pub mod control_loop;
pub mod dashboard;
pub mod execution;
pub mod indicators;
pub mod journal;
pub mod models;
pub mod risk;
pub mod strategy;
pub mod telemetry;

// Re-export commonly used types
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
