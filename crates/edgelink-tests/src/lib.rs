//! EdgeLink test & validation infrastructure.
//!
//! Provides an in-memory platform harness (edge directory, both event
//! backends, registry, server, recording collaborators) and the end-to-end
//! session scenarios exercising connect/reject, offline delivery, sync
//! requests, ordering and replacement semantics.

pub mod harness;
mod scenarios;

pub use harness::{init_tracing, ConnectedEdge, TestPlatform};
