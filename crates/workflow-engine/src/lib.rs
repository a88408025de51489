//! Workflow Engine
//!
//! Runs one workflow program against a capability network.
//!
//! This crate provides:
//! - Trigger subscription with all-or-nothing registration
//! - Bounded admission of trigger events into time-limited executions
//! - Per-execution credit metering with billing receipts
//! - Secrets retrieval through the vault capability
//! - Per-owner and global workflow limits

pub mod billing;
pub mod capabilities;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod limits;
pub mod metering;
pub mod module;
pub mod secrets;
pub mod semaphore;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, EngineLimits, LifecycleHooks};
pub use engine::{Engine, EngineState};
pub use error::{EngineError, EngineResult};
