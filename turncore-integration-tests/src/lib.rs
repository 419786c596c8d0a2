//! Integration tests for TurnCore.
//!
//! This crate has no library code; the tests under `tests/` run the
//! executors, the persistent entity store and both repositories together.

#![cfg(test)]
