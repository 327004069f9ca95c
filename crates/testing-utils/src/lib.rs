//! # Scheduler Testing Utils
//!
//! Shared test doubles for the schedule execution engine:
//!
//! - **MockTaskStore**: in-memory store with the same compare-and-swap claim semantics
//!   as the SQL stores
//! - **MockTransport**: scripted transport that tracks concurrency
//! - **TaskBuilder**: task fixtures with sensible defaults

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
