//! Run controller: sequences deploy → verify-deployed → verify-drained
//! for a whole unit set and decides when a failure calls for a rollback.
//!
//! ```text
//! deploy ──any failed──▶ rollback(succeeded subset) ──▶ RolledBack / RollbackFailed
//!   │                    (nothing succeeded ──▶ Failed)
//!   ▼
//! verify-deployed ──any failed/timed out──▶ rollback(all units)
//!   │
//!   ▼
//! verify-drained ──any failed──▶ Degraded (no rollback: new version is live)
//!   │
//!   ▼
//! Succeeded
//! ```

use std::sync::Arc;

use tracing::{error, info, warn};

use gangway_core::{Backend, Prober, Unit};

use crate::error::Stage;
use crate::executor::{StageConfig, StageExecutor};
use crate::outcome::{RollbackOutcome, RunOutcome, RunStatus, StageReport};
use crate::stages::{self, Direction};

/// Drives whole deployment runs against a backend and a prober.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) executor: StageExecutor,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) prober: Arc<dyn Prober>,
}

impl Orchestrator {
    pub fn new(config: StageConfig, backend: Arc<dyn Backend>, prober: Arc<dyn Prober>) -> Self {
        Self {
            executor: StageExecutor::new(config),
            backend,
            prober,
        }
    }

    pub fn config(&self) -> StageConfig {
        self.executor.config()
    }

    /// Deploy services and scheduled tasks together.
    ///
    /// Both lists go through every stage as one batch; scheduled tasks
    /// carry no check endpoint, so they skip the version check.
    pub async fn run_deployment(&self, services: Vec<Unit>, scheduled_tasks: Vec<Unit>) -> RunOutcome {
        let mut units = services;
        units.extend(scheduled_tasks);
        self.run(units).await
    }

    /// Run every stage over `units`, rolling back when needed.
    pub async fn run(&self, mut units: Vec<Unit>) -> RunOutcome {
        info!(
            units = units.len(),
            timeout_ms = self.config().timeout.as_millis() as u64,
            check_interval_ms = self.config().check_interval.as_millis() as u64,
            "starting deployment"
        );

        let deploy = stages::deploy(&self.executor, &self.backend, &mut units).await;
        if deploy.failed {
            let succeeded = deploy.succeeded_units();
            if succeeded.is_empty() {
                error!(failed = ?deploy.failed_units(), "deploy failed for every unit, nothing to roll back");
                return finish(RunStatus::Failed, deploy, None, None, None, units);
            }

            warn!(
                failed = ?deploy.failed_units(),
                rolling_back = succeeded.len(),
                "deploy failed, rolling back units that were updated"
            );
            let rollback = self
                .rollback_where(&mut units, Stage::Deploy, |u| succeeded.contains(&u.name))
                .await;
            return finish(rollback_status(&rollback), deploy, None, None, Some(rollback), units);
        }

        let verify_deployed = stages::verify_deployed(&self.executor, &self.prober, &units).await;
        if verify_deployed.failed {
            warn!(
                failed = ?verify_deployed.failed_units(),
                timed_out = verify_deployed.timed_out(),
                "new version not confirmed, rolling back every unit"
            );
            let rollback = self.rollback(&mut units, Stage::VerifyDeployed).await;
            return finish(
                rollback_status(&rollback),
                deploy,
                Some(verify_deployed),
                None,
                Some(rollback),
                units,
            );
        }

        let verify_drained =
            stages::verify_drained(&self.executor, &self.backend, &units, Direction::Forward).await;
        let status = if verify_drained.failed {
            warn!(
                failed = ?verify_drained.failed_units(),
                "new version is live but old versions did not drain"
            );
            RunStatus::Degraded
        } else {
            RunStatus::Succeeded
        };

        finish(
            status,
            deploy,
            Some(verify_deployed),
            Some(verify_drained),
            None,
            units,
        )
    }

    /// Roll back only the units matching `select`, leaving the rest (and
    /// the overall unit order) untouched.
    async fn rollback_where<P>(&self, units: &mut Vec<Unit>, trigger: Stage, select: P) -> RollbackOutcome
    where
        P: Fn(&Unit) -> bool,
    {
        let order: Vec<String> = units.iter().map(|u| u.name.clone()).collect();
        let (mut selected, rest): (Vec<Unit>, Vec<Unit>) = units.drain(..).partition(|u| select(u));

        let outcome = self.rollback(&mut selected, trigger).await;

        units.extend(selected);
        units.extend(rest);
        units.sort_by_key(|u| order.iter().position(|n| *n == u.name));
        outcome
    }
}

fn rollback_status(rollback: &RollbackOutcome) -> RunStatus {
    if rollback.status.is_recovered() {
        RunStatus::RolledBack
    } else {
        RunStatus::RollbackFailed
    }
}

fn finish(
    status: RunStatus,
    deploy: StageReport,
    verify_deployed: Option<StageReport>,
    verify_drained: Option<StageReport>,
    rollback: Option<RollbackOutcome>,
    units: Vec<Unit>,
) -> RunOutcome {
    match status {
        RunStatus::Succeeded => info!(status = status.as_str(), "deployment finished"),
        RunStatus::Degraded => warn!(status = status.as_str(), "deployment finished"),
        _ => error!(status = status.as_str(), "deployment failed"),
    }
    RunOutcome {
        status,
        deploy,
        verify_deployed,
        verify_drained,
        rollback,
        units,
    }
}
