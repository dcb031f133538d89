//! Testing utilities and mock implementations
//!
//! Scripted agents let tests drive the orchestrator through success, error,
//! hang and slow-reply paths without any external service.

pub mod mocks;

pub use mocks::*;
