//! Collaborator contracts.
//!
//! The orchestration engine talks to the outside world only through
//! these two traits. Implementations are shared as `Arc<dyn _>` across
//! the per-unit tasks of a stage, so they must be `Send + Sync`.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::unit::{Deployed, Unit, UnitStatus};

/// Errors reported by a cluster scheduler backend.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Errors reported by a version prober.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error("request to {0} failed")]
    Transport(String),

    #[error("received status {status} from {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("failed to read body from {0}")]
    Body(String),

    #[error("request to {0} timed out")]
    Timeout(String),
}

/// The cluster scheduler: the only thing that mutates running workloads.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Register (or pick) a revision running `unit.target_version`,
    /// honoring the unit's update strategy and container filter, and
    /// make it active.
    async fn update_unit(&self, unit: &Unit) -> Result<Deployed, BackendError>;

    /// Make `unit.revision` active as-is, without deriving a new revision.
    async fn revert_unit(&self, unit: &Unit) -> Result<(), BackendError>;

    /// Report which revision is active and how far its rollout has got.
    async fn describe_unit_status(&self, unit: &Unit) -> Result<UnitStatus, BackendError>;
}

/// Observes which version a running unit actually serves.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Fetch the version marker served at `endpoint`.
    async fn fetch_deployed_version(&self, endpoint: &str) -> Result<String, ProbeError>;

    /// Run a post-deploy smoke test against `endpoint`.
    async fn smoke_test(&self, endpoint: &str) -> Result<(), ProbeError>;
}
