//! Stage executor: fan a per-unit operation out over every unit and
//! fan the results back in.
//!
//! Two modes share the same collection model (one task per unit, results
//! sent over a channel, consumed in arrival order, at most once per unit):
//!
//! - **one-shot**: each operation runs exactly once and the executor
//!   waits for all of them; the backend bounds each call.
//! - **polling**: each task sleeps `check_interval`, asks whether the unit
//!   has converged, and repeats. One deadline, armed when the stage
//!   starts, covers the whole batch. When it fires every task is told to
//!   stop and units that never reported get a `TimedOut` result.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info_span, warn};

use gangway_core::Unit;

use crate::error::{Stage, UnitError};
use crate::outcome::StageResult;

/// Timing shared by every polling stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageConfig {
    /// Deadline for a whole polling stage, restarted for every stage.
    pub timeout: Duration,
    /// Sleep before each check.
    pub check_interval: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(15),
        }
    }
}

/// Why a single check did not converge.
#[derive(Debug, Clone)]
pub enum CheckError {
    /// Transient problem; log it and check again next interval.
    Retry(String),
    /// Definitive failure; the unit stops polling with this error.
    Abort(UnitError),
}

/// Runs one operation per unit concurrently and collects one result per unit.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    config: StageConfig,
}

impl StageExecutor {
    pub fn new(config: StageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> StageConfig {
        self.config
    }

    /// Run `op` exactly once for every unit and wait for all of them.
    ///
    /// Results come back in completion order. A task that dies without
    /// reporting yields `UnitError::Aborted` for its unit.
    pub async fn run_once<T, F, Fut>(
        &self,
        stage: Stage,
        units: &[Unit],
        op: F,
    ) -> Vec<(String, Result<T, UnitError>)>
    where
        F: Fn(Unit) -> Fut,
        Fut: Future<Output = Result<T, UnitError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let mut owners = HashMap::with_capacity(units.len());

        for unit in units {
            let span = info_span!("unit", unit = %unit.name, kind = %unit.kind, tags = ?unit.tags);
            let name = unit.name.clone();
            let tx = tx.clone();
            let fut = op(unit.clone());
            let handle = tasks.spawn(
                async move {
                    let result = fut.await;
                    let _ = tx.send((name, result));
                }
                .instrument(span),
            );
            owners.insert(handle.id(), unit.name.clone());
        }
        drop(tx);

        let mut reported = HashSet::with_capacity(units.len());
        let mut results = Vec::with_capacity(units.len());
        while let Some((name, result)) = rx.recv().await {
            if reported.insert(name.clone()) {
                results.push((name, result));
            }
        }

        // The channel only closes once every task is gone, so anything
        // missing here died without sending.
        let mut reasons = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if let Some(name) = owners.remove(&e.id()) {
                    reasons.insert(name, join_failure(e));
                }
            }
        }
        for unit in units.iter().filter(|u| !reported.contains(&u.name)) {
            let reason = reasons
                .remove(&unit.name)
                .unwrap_or_else(|| "task exited without reporting".to_string());
            error!(unit = %unit.name, %stage, %reason, "unit task aborted");
            results.push((
                unit.name.clone(),
                Err(UnitError::Aborted {
                    unit: unit.name.clone(),
                    stage,
                    reason,
                }),
            ));
        }

        results
    }

    /// Poll `check` for every unit until it converges, fails definitively,
    /// or the stage deadline elapses.
    ///
    /// Always returns exactly one result per input unit: completed results
    /// in arrival order, followed by synthesized ones for the rest.
    pub async fn run_polling<F, Fut>(&self, stage: Stage, units: &[Unit], check: F) -> Vec<StageResult>
    where
        F: Fn(Unit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, CheckError>> + Send + 'static,
    {
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let check = Arc::new(check);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for unit in units {
            let span = info_span!("unit", unit = %unit.name, kind = %unit.kind, tags = ?unit.tags);
            tasks.spawn(
                poll_unit(
                    unit.clone(),
                    check.clone(),
                    self.config.check_interval,
                    cancel_rx.clone(),
                    tx.clone(),
                )
                .instrument(span),
            );
        }
        drop(tx);

        let mut reported = HashSet::with_capacity(units.len());
        let mut results = Vec::with_capacity(units.len());
        let mut expired = false;

        loop {
            tokio::select! {
                biased;
                received = rx.recv() => match received {
                    Some(result) => {
                        if reported.insert(result.unit.clone()) {
                            results.push(result);
                        } else {
                            debug!(unit = %result.unit, %stage, "discarding duplicate result");
                        }
                    }
                    None => break,
                },
                () = &mut deadline => {
                    expired = true;
                    warn!(
                        %stage,
                        pending = units.len() - reported.len(),
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "stage deadline elapsed"
                    );
                    break;
                }
            }
        }

        // Close the barrier: stop the stragglers and drop anything late.
        let _ = cancel_tx.send(true);
        tasks.shutdown().await;
        drop(rx);

        for unit in units.iter().filter(|u| !reported.contains(&u.name)) {
            let error = if expired {
                UnitError::timed_out(&unit.name, stage, self.config.timeout)
            } else {
                error!(unit = %unit.name, %stage, "unit task aborted");
                UnitError::Aborted {
                    unit: unit.name.clone(),
                    stage,
                    reason: "task exited without reporting".to_string(),
                }
            };
            results.push(StageResult::failed(error));
        }

        results
    }
}

fn join_failure(error: JoinError) -> String {
    if error.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}

/// Poll loop for one unit. Returns after sending a result or on cancellation.
async fn poll_unit<F, Fut>(
    unit: Unit,
    check: Arc<F>,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
    results: mpsc::UnboundedSender<StageResult>,
) where
    F: Fn(Unit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, CheckError>> + Send + 'static,
{
    loop {
        let attempt = async {
            tokio::time::sleep(interval).await;
            check(unit.clone()).await
        };

        tokio::select! {
            _ = cancel.changed() => {
                debug!("polling cancelled");
                return;
            }
            outcome = attempt => match outcome {
                Ok(true) => {
                    let _ = results.send(StageResult::succeeded(&unit.name));
                    return;
                }
                Ok(false) => debug!("not converged yet"),
                Err(CheckError::Retry(reason)) => warn!(%reason, "check failed, retrying"),
                Err(CheckError::Abort(error)) => {
                    let _ = results.send(StageResult::failed(error));
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::outcome::Outcome;
    use gangway_core::BackendError;

    use crate::error::Operation;

    fn units(names: &[&str]) -> Vec<Unit> {
        names
            .iter()
            .map(|n| Unit::service(n, "test", "da39a3ee5e6b"))
            .collect()
    }

    fn executor(timeout_ms: u64, interval_ms: u64) -> StageExecutor {
        StageExecutor::new(StageConfig {
            timeout: Duration::from_millis(timeout_ms),
            check_interval: Duration::from_millis(interval_ms),
        })
    }

    #[tokio::test]
    async fn run_once_returns_one_result_per_unit() {
        let exec = executor(1000, 100);
        let results = exec
            .run_once(Stage::Deploy, &units(&["a", "b", "c"]), |unit| async move {
                if unit.name == "b" {
                    Err(UnitError::backend(
                        &unit.name,
                        Operation::UpdateUnit,
                        BackendError::Conflict("in progress".to_string()),
                    ))
                } else {
                    Ok(unit.name.len())
                }
            })
            .await;

        assert_eq!(results.len(), 3);
        let failed: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "b");
    }

    #[tokio::test]
    async fn run_once_reports_panicked_task_as_aborted() {
        let exec = executor(1000, 100);
        let results = exec
            .run_once(Stage::Deploy, &units(&["ok", "boom"]), |unit| async move {
                if unit.name == "boom" {
                    panic!("backend client exploded");
                }
                Ok::<(), UnitError>(())
            })
            .await;

        assert_eq!(results.len(), 2);
        let (_, boom) = results.iter().find(|(n, _)| n == "boom").unwrap();
        assert!(matches!(boom, Err(UnitError::Aborted { .. })));
    }

    #[tokio::test]
    async fn run_once_keeps_each_panic_with_its_own_unit() {
        let exec = executor(1000, 100);
        let results = exec
            .run_once(Stage::Deploy, &units(&["first", "second", "ok"]), |unit| async move {
                if unit.name != "ok" {
                    panic!("{} client exploded", unit.name);
                }
                Ok::<(), UnitError>(())
            })
            .await;

        assert_eq!(results.len(), 3);
        for name in ["first", "second"] {
            let (_, result) = results.iter().find(|(n, _)| n == name).unwrap();
            match result {
                Err(UnitError::Aborted { unit, reason, .. }) => {
                    assert_eq!(unit, name);
                    assert_eq!(reason, &format!("task panicked: {name} client exploded"));
                }
                other => panic!("expected {name} aborted, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polling_succeeds_once_converged() {
        let exec = executor(10_000, 250);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let results = exec
            .run_polling(Stage::VerifyDrained, &units(&["a"]), move |_unit| {
                let counter = counter.clone();
                async move { Ok::<_, CheckError>(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
            })
            .await;

        assert_eq!(results, vec![StageResult::succeeded("a")]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out_every_unit_that_never_converges() {
        let exec = executor(1000, 250);
        let started = tokio::time::Instant::now();
        let results = exec
            .run_polling(Stage::VerifyDeployed, &units(&["a", "b"]), |_unit| async {
                Ok::<_, CheckError>(false)
            })
            .await;

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.error().is_some_and(UnitError::is_timeout));
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out_even_with_a_hanging_check() {
        let exec = executor(1000, 250);
        let results = exec
            .run_polling(Stage::VerifyDeployed, &units(&["hang"]), |_unit| async {
                std::future::pending::<()>().await;
                Ok::<_, CheckError>(true)
            })
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].error().is_some_and(UnitError::is_timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_errors_keep_polling() {
        let exec = executor(10_000, 100);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let results = exec
            .run_polling(Stage::VerifyDeployed, &units(&["a"]), move |_unit| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(CheckError::Retry("connection refused".to_string()))
                    } else {
                        Ok(true)
                    }
                }
            })
            .await;

        assert_eq!(results[0].outcome, Outcome::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_fails_only_that_unit() {
        let exec = executor(2000, 100);
        let results = exec
            .run_polling(Stage::VerifyDrained, &units(&["bad", "good"]), |unit| async move {
                if unit.name == "bad" {
                    Err(CheckError::Abort(UnitError::Unhealthy {
                        unit: unit.name.clone(),
                        detail: "2 of 2 replicas failing".to_string(),
                    }))
                } else {
                    Ok(true)
                }
            })
            .await;

        assert_eq!(results.len(), 2);
        let bad = results.iter().find(|r| r.unit == "bad").unwrap();
        assert!(matches!(bad.error(), Some(UnitError::Unhealthy { .. })));
        let good = results.iter().find(|r| r.unit == "good").unwrap();
        assert_eq!(good.outcome, Outcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_unit_gets_full_deadline_despite_fast_failure() {
        let exec = executor(1000, 100);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let results = exec
            .run_polling(Stage::VerifyDrained, &units(&["fast", "slow"]), move |unit| {
                let counter = counter.clone();
                async move {
                    if unit.name == "fast" {
                        return Err(CheckError::Abort(UnitError::Unhealthy {
                            unit: unit.name.clone(),
                            detail: "crash looping".to_string(),
                        }));
                    }
                    Ok(counter.fetch_add(1, Ordering::SeqCst) >= 7)
                }
            })
            .await;

        let slow = results.iter().find(|r| r.unit == "slow").unwrap();
        assert_eq!(slow.outcome, Outcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_tasks_stop_polling() {
        let exec = executor(500, 100);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        exec.run_polling(Stage::VerifyDeployed, &units(&["a"]), move |_unit| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CheckError>(false)
            }
        })
        .await;

        let after_stage = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stage);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stage_completes_immediately() {
        let exec = executor(1000, 100);
        let results = exec
            .run_polling(Stage::VerifyDrained, &[], |_unit| async { Ok::<_, CheckError>(true) })
            .await;
        assert!(results.is_empty());
    }
}
