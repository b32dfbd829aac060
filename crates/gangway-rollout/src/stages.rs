//! The per-unit stages of a run.
//!
//! Each function drives one stage over a set of units through the
//! `StageExecutor` and returns a `StageReport` holding exactly one result
//! per unit.

use std::sync::Arc;

use tracing::{Instrument, debug, info, info_span, warn};

use gangway_core::{Backend, Prober, Unit};

use crate::error::{Operation, Stage, UnitError};
use crate::executor::{CheckError, StageExecutor};
use crate::outcome::{StageReport, StageResult};

/// Shortest probed token that may count as a version match. Seven is the
/// usual abbreviated git SHA; anything shorter is too easy to hit by accident.
pub const MIN_VERSION_TOKEN_LEN: usize = 7;

/// Whether a probed version token identifies `target`.
///
/// The token may be an abbreviation of the full version, so it matches
/// when `target` starts with it.
pub fn matches_version(target: &str, token: &str) -> bool {
    let token = token.trim();
    token.len() >= MIN_VERSION_TOKEN_LEN && target.starts_with(token)
}

/// Update every unit to its target version and record the new history on
/// the units that succeeded.
pub async fn deploy(
    executor: &StageExecutor,
    backend: &Arc<dyn Backend>,
    units: &mut [Unit],
) -> StageReport {
    let span = info_span!("stage", stage = %Stage::Deploy);
    async {
        info!(units = units.len(), "deploying");
        let backend = backend.clone();
        let outcomes = executor
            .run_once(Stage::Deploy, units, move |unit| {
                let backend = backend.clone();
                async move {
                    info!(version = %unit.target_version, strategy = %unit.update_strategy, "updating unit");
                    backend
                        .update_unit(&unit)
                        .await
                        .map_err(|source| UnitError::backend(&unit.name, Operation::UpdateUnit, source))
                }
            })
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (name, outcome) in outcomes {
            match outcome {
                Ok(deployed) => {
                    info!(
                        unit = %name,
                        revision = %deployed.revision,
                        previous_revision = %deployed.previous_revision,
                        previous_version = %deployed.previous_version,
                        "unit updated"
                    );
                    if let Some(unit) = units.iter_mut().find(|u| u.name == name) {
                        unit.apply_deployed(deployed);
                    }
                    results.push(StageResult::succeeded(&name));
                }
                Err(error) => {
                    warn!(%error, "deploy failed");
                    results.push(StageResult::failed(error));
                }
            }
        }

        StageReport::new(Stage::Deploy, results)
    }
    .instrument(span)
    .await
}

/// Re-activate each unit's (already swapped) revision. Units whose
/// previous version equals their target are left untouched and succeed.
pub async fn revert(
    executor: &StageExecutor,
    backend: &Arc<dyn Backend>,
    units: &[Unit],
) -> StageReport {
    let span = info_span!("stage", stage = %Stage::Revert);
    async {
        info!(units = units.len(), "reverting");
        let backend = backend.clone();
        let outcomes = executor
            .run_once(Stage::Revert, units, move |unit| {
                let backend = backend.clone();
                async move {
                    if unit.is_rollback_noop() || !unit.has_history() {
                        info!(version = %unit.target_version, "already on previous version, nothing to revert");
                        return Ok(());
                    }
                    info!(
                        version = %unit.target_version,
                        revision = unit.revision.as_deref().unwrap_or("-"),
                        "reverting unit"
                    );
                    backend
                        .revert_unit(&unit)
                        .await
                        .map_err(|source| UnitError::backend(&unit.name, Operation::RevertUnit, source))
                }
            })
            .await;

        let results = outcomes
            .into_iter()
            .map(|(name, outcome)| match outcome {
                Ok(()) => StageResult::succeeded(&name),
                Err(error) => {
                    warn!(%error, "revert failed");
                    StageResult::failed(error)
                }
            })
            .collect();

        StageReport::new(Stage::Revert, results)
    }
    .instrument(span)
    .await
}

/// Poll each unit's check endpoint until it serves the target version.
///
/// Units without a check endpoint are recorded as `NoCheckConfigured`.
/// Probe errors are retried until the stage deadline; a failed smoke test
/// is final.
pub async fn verify_deployed(
    executor: &StageExecutor,
    prober: &Arc<dyn Prober>,
    units: &[Unit],
) -> StageReport {
    let span = info_span!("stage", stage = %Stage::VerifyDeployed);
    async {
        let (checked, exempt): (Vec<Unit>, Vec<Unit>) = units
            .iter()
            .cloned()
            .partition(|u| u.check_endpoint.is_some());

        let mut results: Vec<StageResult> = exempt
            .iter()
            .map(|u| {
                info!(unit = %u.name, "no check endpoint configured, skipping version check");
                StageResult::no_check_configured(&u.name)
            })
            .collect();

        info!(units = checked.len(), "checking for newly deployed version");
        let prober = prober.clone();
        let polled = executor
            .run_polling(Stage::VerifyDeployed, &checked, move |unit| {
                let prober = prober.clone();
                async move { check_deployed_version(prober.as_ref(), &unit).await }
            })
            .await;

        for result in &polled {
            if let Some(error) = result.error() {
                warn!(%error, "version check failed");
            }
        }
        results.extend(polled);

        StageReport::new(Stage::VerifyDeployed, results)
    }
    .instrument(span)
    .await
}

async fn check_deployed_version(prober: &dyn Prober, unit: &Unit) -> Result<bool, CheckError> {
    let Some(endpoint) = unit.check_endpoint.as_deref() else {
        return Ok(true);
    };

    let token = prober
        .fetch_deployed_version(endpoint)
        .await
        .map_err(|e| CheckError::Retry(format!("could not read a version from {endpoint}: {e}")))?;
    debug!(token = %token.trim(), %endpoint, "fetched deployed version");

    if !matches_version(&unit.target_version, &token) {
        return Ok(false);
    }

    if let Some(smoke) = unit.smoke_endpoint.as_deref() {
        info!(endpoint = %smoke, "running smoke test");
        prober.smoke_test(smoke).await.map_err(|source| {
            CheckError::Abort(UnitError::SmokeTest {
                unit: unit.name.clone(),
                source,
            })
        })?;
    }

    info!(version = %unit.target_version, "traffic showing new version, waiting for old versions to stop");
    Ok(true)
}

/// Which way a run is moving when verify-drained checks a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// After a deploy: the revision the update returned must become primary.
    Forward,
    /// After a revert. A unit whose revert was skipped keeps the revision
    /// its forward update activated.
    Rollback,
}

/// Poll the backend until each unit's new revision is primary and fully
/// scaled. Any backend error or unhealthy replica fails the unit at once.
pub async fn verify_drained(
    executor: &StageExecutor,
    backend: &Arc<dyn Backend>,
    units: &[Unit],
    direction: Direction,
) -> StageReport {
    let span = info_span!("stage", stage = %Stage::VerifyDrained);
    async {
        info!(units = units.len(), "checking if old versions are gone");
        let backend = backend.clone();
        let results = executor
            .run_polling(Stage::VerifyDrained, units, move |unit| {
                let backend = backend.clone();
                async move { check_drained(backend.as_ref(), &unit, direction).await }
            })
            .await;

        for result in &results {
            match result.error() {
                Some(error) => warn!(%error, "drain check failed"),
                None => info!(unit = %result.unit, "old versions drained"),
            }
        }

        StageReport::new(Stage::VerifyDrained, results)
    }
    .instrument(span)
    .await
}

async fn check_drained(
    backend: &dyn Backend,
    unit: &Unit,
    direction: Direction,
) -> Result<bool, CheckError> {
    let status = backend.describe_unit_status(unit).await.map_err(|source| {
        CheckError::Abort(UnitError::backend(
            &unit.name,
            Operation::DescribeUnitStatus,
            source,
        ))
    })?;

    // A skipped revert left the forward revision (now `previous_revision`
    // after the swap) primary. Without any recorded revision, whatever the
    // scheduler made primary is what the last update asked for.
    let recorded = match direction {
        Direction::Rollback if unit.is_rollback_noop() => unit.previous_revision.as_deref(),
        _ => unit.revision.as_deref(),
    };
    let expected = recorded.unwrap_or(status.active_revision.as_str());
    if status.active_revision != expected {
        debug!(active = %status.active_revision, %expected, "new revision not primary yet");
        return Ok(false);
    }

    if status.unhealthy > 0 {
        return Err(CheckError::Abort(UnitError::Unhealthy {
            unit: unit.name.clone(),
            detail: format!(
                "{} of {} replicas of {} failing health checks",
                status.unhealthy, status.desired, status.active_revision
            ),
        }));
    }

    debug!(running = status.running, desired = status.desired, "rollout progress");
    Ok(status.is_settled())
}
