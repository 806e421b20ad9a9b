pub mod config;
pub mod control;
pub mod decimal_utils;
pub mod domain;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod funding_tracker;
pub mod market_data;
pub mod observability;
pub mod opportunity;
pub mod position;
pub mod reconciler;
pub mod store;
pub mod supervisor;

pub use errors::{EngineError, EngineResult};
