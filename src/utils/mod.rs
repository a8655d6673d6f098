//! Shared helpers for the worker binaries.

pub mod bootstrap;
pub mod retry;
