//! Gangway scheduler backends.
//!
//! # Components
//!
//! - **`rest`**: `HttpBackend`: client for a scheduler control plane's REST API
//! - **`memory`**: `MemoryBackend`: in-process scheduler with revision
//!   families, drain progress and injectable failures

pub mod memory;
pub mod rest;

pub use memory::{MemoryBackend, MemoryOp, SimulatedUnit};
pub use rest::HttpBackend;
