//! volrep test and validation crate
//!
//! End-to-end scenarios and property tests for the replication controller, driving a
//! simulated storage backend either in-process or through the TCP sidecar protocol.

pub mod harness;
pub mod idempotency_tests;
pub mod registry_tests;

pub use harness::{init_tracing, remote_adapter, start_sidecar, OverlapDriver, TestBed, TestBedOptions};
