//! End-to-end tests for exit-pass.
//!
//! Each test runs a customer device and a staff terminal as separate
//! deployments that share only a storage backend, a signing secret and a
//! manually driven clock.

mod harness;

mod cross_actor;
mod scenarios;

pub use harness::TestHarness;
