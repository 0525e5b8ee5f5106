// Core modules
pub mod broker;
pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod strategy;
pub mod timing;
pub mod trader;

// Re-export commonly used types
pub use error::{BrokerError, EngineError};
pub use models::*;
pub use strategy::Strategy;
pub use trader::{CycleReport, Trader};
