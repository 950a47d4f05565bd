//! Library surface for the `queryshield` binary.
//!
//! Dataset loading and the persisted-ledger service live here so the binary
//! stays a thin argument parser and the integration tests can drive the same
//! code paths.

pub mod dataset;
pub mod service;
