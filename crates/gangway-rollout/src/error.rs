//! Per-unit error taxonomy.
//!
//! Every failure a stage can record for a unit is one of these. They are
//! `Clone + Serialize` because they travel inside stage reports all the
//! way up to the caller.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use gangway_core::{BackendError, ProbeError};

/// One phase of a run, applied to every unit with a shared barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Trigger the update to the target version.
    Deploy,
    /// Re-activate the previous revision during a rollback.
    Revert,
    /// Wait until the unit serves the target version.
    VerifyDeployed,
    /// Wait until the old revision has fully retired.
    VerifyDrained,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Deploy => "deploy",
            Stage::Revert => "revert",
            Stage::VerifyDeployed => "verify-deployed",
            Stage::VerifyDrained => "verify-drained",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend operation a `UnitError::Backend` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    UpdateUnit,
    RevertUnit,
    DescribeUnitStatus,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::UpdateUnit => "update",
            Operation::RevertUnit => "revert",
            Operation::DescribeUnitStatus => "describe status",
        })
    }
}

/// Why a unit failed a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitError {
    /// The backend itself reported an error. Never retried within a stage.
    #[error("{unit}: {operation} failed: {source}")]
    Backend {
        unit: String,
        operation: Operation,
        #[source]
        source: BackendError,
    },

    /// The stage deadline elapsed before the unit converged. Whether the
    /// operation would eventually have worked is unknown.
    #[error("{unit}: {stage} timed out after {after_ms}ms")]
    TimedOut {
        unit: String,
        stage: Stage,
        after_ms: u64,
    },

    /// The new revision is failing health checks.
    #[error("{unit}: unhealthy: {detail}")]
    Unhealthy { unit: String, detail: String },

    /// The post-deploy smoke test rejected the new version.
    #[error("{unit}: smoke test failed: {source}")]
    SmokeTest {
        unit: String,
        #[source]
        source: ProbeError,
    },

    /// The unit's task ended without reporting.
    #[error("{unit}: {stage} task aborted: {reason}")]
    Aborted {
        unit: String,
        stage: Stage,
        reason: String,
    },
}

impl UnitError {
    pub fn backend(unit: &str, operation: Operation, source: BackendError) -> Self {
        UnitError::Backend {
            unit: unit.to_string(),
            operation,
            source,
        }
    }

    pub fn timed_out(unit: &str, stage: Stage, after: Duration) -> Self {
        UnitError::TimedOut {
            unit: unit.to_string(),
            stage,
            after_ms: after.as_millis() as u64,
        }
    }

    /// Name of the unit this error belongs to.
    pub fn unit(&self) -> &str {
        match self {
            UnitError::Backend { unit, .. }
            | UnitError::TimedOut { unit, .. }
            | UnitError::Unhealthy { unit, .. }
            | UnitError::SmokeTest { unit, .. }
            | UnitError::Aborted { unit, .. } => unit,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, UnitError::TimedOut { .. })
    }
}
