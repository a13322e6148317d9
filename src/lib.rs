//! Crewline: a task-orchestration core.
//!
//! Tasks form a dependency graph and are dispatched by a priority scheduler
//! with bounded concurrency. Agent instances are grouped into pools guarded
//! by circuit breakers, and a coordinator loop turns scheduler and pool
//! health into scaling advice and conflict resolutions.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod metrics;
pub mod orchestration;
pub mod util;
pub mod workflow;

pub use error::{Error, Result};
