//! Test utilities and helpers
//!
//! Fixtures for building channels and managers, plus a checker for the
//! structural rules of a channel tree. Used by unit tests, integration tests
//! and benchmarks.

pub mod fixtures;

pub use fixtures::*;
