//! Integration test suite for crewline.
//!
//! These tests drive the public API end to end: the scheduler loop against
//! scripted executors, the failover manager against scripted probes, and
//! the coordinator and workflow runner on top of both.
//!
//! # Test Categories
//!
//! - `scheduling`: dispatch order, dependency gating, concurrency bound
//! - `retry`: per-attempt retries and backoff timing
//! - `failover`: circuit breaker and pool failover scenarios
//! - `conflict_resolution`: strategy determinism
//! - `coordinator`: crews, scaling and conflict handling together
//! - `workflow_e2e`: workflow files run through shell commands
//!
//! Time-dependent tests run on a paused tokio clock.

mod fixtures;

mod conflict_resolution;
mod coordinator;
mod retry;
mod scheduling;
mod workflow_e2e;
