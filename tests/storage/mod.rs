//! Shared state store contract tests.
//!
//! Tests the StateStore interface against every implementation.
//! Each implementation module imports these test functions and runs them.

pub mod state_store_tests;
