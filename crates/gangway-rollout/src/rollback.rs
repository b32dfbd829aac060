//! Rollback controller.
//!
//! Points every unit back at the version and revision it ran before the
//! deploy, then re-enters the same stage machine: revert, verify-deployed,
//! verify-drained. Each polling stage gets a fresh deadline.
//!
//! There is no fallback beyond this. A revert that fails, or a previous
//! version that never shows up, leaves the run in `RollbackFailed`.

use tracing::{Instrument, error, info, info_span, warn};

use gangway_core::Unit;

use crate::controller::Orchestrator;
use crate::error::Stage;
use crate::outcome::{RollbackOutcome, RollbackStatus};
use crate::stages::{self, Direction};

impl Orchestrator {
    /// Roll back `units` after `trigger` failed.
    pub async fn rollback(&self, units: &mut [Unit], trigger: Stage) -> RollbackOutcome {
        let span = info_span!("rollback", %trigger);
        async {
            let names: Vec<String> = units.iter().map(|u| u.name.clone()).collect();
            warn!(units = ?names, "rolling back");

            for unit in units.iter_mut() {
                if !unit.swap_for_rollback() {
                    warn!(unit = %unit.name, "no previous version recorded, leaving unit as is");
                }
            }

            let revert = stages::revert(&self.executor, &self.backend, units).await;
            if revert.failed {
                error!(failed = ?revert.failed_units(), "rollback failed, operator action required");
                return RollbackOutcome {
                    trigger,
                    units: names,
                    revert,
                    verify_deployed: None,
                    verify_drained: None,
                    status: RollbackStatus::Failed,
                };
            }

            let verify_deployed = stages::verify_deployed(&self.executor, &self.prober, units).await;
            if verify_deployed.failed {
                error!(
                    failed = ?verify_deployed.failed_units(),
                    "previous version never observed, rollback unconfirmed"
                );
                return RollbackOutcome {
                    trigger,
                    units: names,
                    revert,
                    verify_deployed: Some(verify_deployed),
                    verify_drained: None,
                    status: RollbackStatus::Unconfirmed,
                };
            }

            let verify_drained =
                stages::verify_drained(&self.executor, &self.backend, units, Direction::Rollback)
                    .await;
            let status = if verify_drained.failed {
                warn!(
                    failed = ?verify_drained.failed_units(),
                    "rolled back, but the abandoned revision is still draining"
                );
                RollbackStatus::Draining
            } else {
                info!("rollback confirmed");
                RollbackStatus::Confirmed
            };

            RollbackOutcome {
                trigger,
                units: names,
                revert,
                verify_deployed: Some(verify_deployed),
                verify_drained: Some(verify_drained),
                status,
            }
        }
        .instrument(span)
        .await
    }
}
