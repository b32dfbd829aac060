//! End-to-end rollout scenarios.
//!
//! Every run goes through the real `Orchestrator` against the in-memory
//! scheduler. The prober reads the version a unit serves straight from the
//! scheduler's active revision unless a test pins an endpoint to a fixed
//! token. The clock is paused, so deadlines elapse instantly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gangway_backend::{MemoryBackend, MemoryOp, SimulatedUnit};
use gangway_core::{Backend, BackendError, Deployed, ProbeError, Prober, Unit, UnitStatus};
use gangway_rollout::{
    Operation, Orchestrator, Outcome, RollbackStatus, RunStatus, Stage, StageConfig, UnitError,
};

const OLD: &str = "9b1e77d0c3a2f415";
const NEW: &str = "4f2a9c81e0d3b7a6";

/// Reports whatever version the scheduler has active for the unit named in
/// the endpoint host (`http://<unit>.internal/...`).
struct ScriptedProber {
    backend: Arc<MemoryBackend>,
    pinned: Mutex<HashMap<String, String>>,
    failing_smoke: Mutex<HashSet<String>>,
    unreachable: Mutex<HashMap<String, u32>>,
}

impl ScriptedProber {
    fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            pinned: Mutex::new(HashMap::new()),
            failing_smoke: Mutex::new(HashSet::new()),
            unreachable: Mutex::new(HashMap::new()),
        }
    }

    /// Always serve `token` from `unit`'s check endpoint.
    fn pin(&self, unit: &str, token: &str) {
        self.pinned
            .lock()
            .unwrap()
            .insert(unit.to_string(), token.to_string());
    }

    fn fail_smoke(&self, unit: &str) {
        self.failing_smoke.lock().unwrap().insert(unit.to_string());
    }

    /// Refuse the next `fetches` version reads from `unit`'s endpoint.
    fn refuse_fetches(&self, unit: &str, fetches: u32) {
        self.unreachable
            .lock()
            .unwrap()
            .insert(unit.to_string(), fetches);
    }
}

fn unit_of(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("http://")
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn fetch_deployed_version(&self, endpoint: &str) -> Result<String, ProbeError> {
        let unit = unit_of(endpoint);
        if let Some(remaining) = self.unreachable.lock().unwrap().get_mut(&unit) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProbeError::Transport(format!("{endpoint}: connection refused")));
            }
        }
        let pinned = self.pinned.lock().unwrap().get(&unit).cloned();
        if let Some(token) = pinned {
            return Ok(token);
        }
        match self.backend.active(&unit).await {
            Some((_, version)) => Ok(version),
            None => Err(ProbeError::Transport(endpoint.to_string())),
        }
    }

    async fn smoke_test(&self, endpoint: &str) -> Result<(), ProbeError> {
        let unit = unit_of(endpoint);
        if self.failing_smoke.lock().unwrap().contains(&unit) {
            return Err(ProbeError::Status {
                endpoint: endpoint.to_string(),
                status: 500,
                body: "life alert failed".to_string(),
            });
        }
        Ok(())
    }
}

/// Registers a fresh revision on every update, but the scheduler keeps
/// reporting whatever was primary before as the active one.
struct LaggingScheduler {
    inner: Arc<MemoryBackend>,
}

#[async_trait]
impl Backend for LaggingScheduler {
    async fn update_unit(&self, unit: &Unit) -> Result<Deployed, BackendError> {
        let deployed = self.inner.update_unit(unit).await?;
        Ok(Deployed {
            revision: format!("{}:pending", unit.name),
            ..deployed
        })
    }

    async fn revert_unit(&self, unit: &Unit) -> Result<(), BackendError> {
        self.inner.revert_unit(unit).await
    }

    async fn describe_unit_status(&self, unit: &Unit) -> Result<UnitStatus, BackendError> {
        self.inner.describe_unit_status(unit).await
    }
}

struct Harness {
    backend: Arc<MemoryBackend>,
    prober: Arc<ScriptedProber>,
    orchestrator: Orchestrator,
}

/// 250ms checks against a 1s stage deadline.
async fn harness(services: &[&str]) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    for name in services {
        backend.add(SimulatedUnit::service("prod", name, OLD)).await;
    }
    let prober = Arc::new(ScriptedProber::new(backend.clone()));
    let orchestrator = Orchestrator::new(
        StageConfig {
            timeout: Duration::from_secs(1),
            check_interval: Duration::from_millis(250),
        },
        backend.clone() as Arc<dyn Backend>,
        prober.clone() as Arc<dyn Prober>,
    );
    Harness {
        backend,
        prober,
        orchestrator,
    }
}

fn service(name: &str) -> Unit {
    Unit::service(name, "prod", NEW).with_check_endpoint(&format!("http://{name}.internal/revision"))
}

#[tokio::test(start_paused = true)]
async fn every_unit_converges() {
    let h = harness(&["api", "worker"]).await;
    h.backend
        .add(SimulatedUnit::scheduled_task("prod", "nightly-report", OLD))
        .await;
    h.backend.set_drain_polls("api", 2).await;

    let outcome = h
        .orchestrator
        .run_deployment(
            vec![service("api"), service("worker")],
            vec![Unit::scheduled_task("nightly-report", "prod", NEW)],
        )
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(outcome.rollback.is_none());
    assert!(!outcome.timed_out());
    for name in ["api", "worker", "nightly-report"] {
        let (_, version) = h.backend.active(name).await.unwrap();
        assert_eq!(version, NEW, "{name}");
    }

    let verify = outcome.verify_deployed.as_ref().unwrap();
    assert_eq!(verify.results.len(), 3);
    assert_eq!(
        verify.result_for("nightly-report").unwrap().outcome,
        Outcome::NoCheckConfigured
    );
    assert_eq!(outcome.verify_drained.as_ref().unwrap().results.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn deploy_records_history_on_units() {
    let h = harness(&["api"]).await;
    let outcome = h.orchestrator.run(vec![service("api")]).await;

    let api = &outcome.units[0];
    assert_eq!(api.target_version, NEW);
    assert_eq!(api.previous_version.as_deref(), Some(OLD));
    assert_eq!(api.revision.as_deref(), Some("api:2"));
    assert_eq!(api.previous_revision.as_deref(), Some("api:1"));
}

#[tokio::test(start_paused = true)]
async fn partial_deploy_failure_rolls_back_only_updated_units() {
    let h = harness(&["api", "worker"]).await;
    h.backend
        .fail(MemoryOp::Update, "api", BackendError::Conflict("deployment locked".to_string()))
        .await;

    let outcome = h.orchestrator.run(vec![service("api"), service("worker")]).await;

    assert_eq!(outcome.status, RunStatus::RolledBack);
    let rollback = outcome.rollback.as_ref().unwrap();
    assert_eq!(rollback.trigger, Stage::Deploy);
    assert_eq!(rollback.units, vec!["worker".to_string()]);
    assert_eq!(rollback.status, RollbackStatus::Confirmed);
    assert_eq!(h.backend.calls_for(MemoryOp::Revert).await, vec!["worker"]);
    assert_eq!(h.backend.active("worker").await.unwrap().1, OLD);

    assert!(outcome.verify_deployed.is_none());
    let failed = outcome.deploy.result_for("api").unwrap();
    assert!(matches!(
        failed.error(),
        Some(UnitError::Backend { source: BackendError::Conflict(_), .. })
    ));

    // Unit order survives the partial rollback.
    let names: Vec<_> = outcome.units.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["api", "worker"]);
}

#[tokio::test(start_paused = true)]
async fn deploy_failing_everywhere_changes_nothing() {
    let h = harness(&["api", "worker"]).await;
    for name in ["api", "worker"] {
        h.backend
            .fail(MemoryOp::Update, name, BackendError::Transport("connection reset".to_string()))
            .await;
    }

    let outcome = h.orchestrator.run(vec![service("api"), service("worker")]).await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.rollback.is_none());
    assert!(h.backend.calls_for(MemoryOp::Revert).await.is_empty());
    assert_eq!(outcome.deciding_stage().unwrap().stage, Stage::Deploy);
}

#[tokio::test(start_paused = true)]
async fn stale_version_times_out_and_rolls_back_every_unit() {
    let h = harness(&["api", "worker"]).await;
    h.prober.pin("api", &OLD[..7]);

    let started = tokio::time::Instant::now();
    let outcome = h.orchestrator.run(vec![service("api"), service("worker")]).await;

    let verify = outcome.verify_deployed.as_ref().unwrap();
    let api = verify.result_for("api").unwrap();
    assert!(api.error().is_some_and(UnitError::is_timeout));
    assert_eq!(verify.result_for("worker").unwrap().outcome, Outcome::Succeeded);
    assert!(outcome.timed_out());

    assert_eq!(outcome.status, RunStatus::RolledBack);
    let rollback = outcome.rollback.as_ref().unwrap();
    assert_eq!(rollback.trigger, Stage::VerifyDeployed);
    assert_eq!(rollback.units, vec!["api".to_string(), "worker".to_string()]);
    assert_eq!(rollback.status, RollbackStatus::Confirmed);

    // Version check hit its 1s deadline; the rollback stages then finish
    // within a couple of polls each.
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(3));

    for name in ["api", "worker"] {
        assert_eq!(h.backend.active(name).await.unwrap(), (format!("{name}:1"), OLD.to_string()));
    }
}

#[tokio::test(start_paused = true)]
async fn rollback_restores_unit_history_symmetrically() {
    let h = harness(&["api"]).await;
    h.prober.pin("api", "0000000");

    let outcome = h.orchestrator.run(vec![service("api")]).await;
    assert_eq!(outcome.status, RunStatus::RollbackFailed);

    let api = &outcome.units[0];
    assert_eq!(api.target_version, OLD);
    assert_eq!(api.previous_version.as_deref(), Some(NEW));
    assert_eq!(api.revision.as_deref(), Some("api:1"));
    assert_eq!(api.previous_revision.as_deref(), Some("api:2"));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_rollback_is_rollback_failed() {
    let h = harness(&["api"]).await;
    h.prober.pin("api", "0000000");

    let outcome = h.orchestrator.run(vec![service("api")]).await;

    assert_eq!(outcome.status, RunStatus::RollbackFailed);
    let rollback = outcome.rollback.as_ref().unwrap();
    assert_eq!(rollback.status, RollbackStatus::Unconfirmed);
    assert!(rollback.verify_drained.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_revert_is_rollback_failed() {
    let h = harness(&["api", "worker"]).await;
    h.prober.pin("api", &OLD[..7]);
    h.backend
        .fail(MemoryOp::Revert, "worker", BackendError::NotFound("worker:1".to_string()))
        .await;

    let outcome = h.orchestrator.run(vec![service("api"), service("worker")]).await;

    assert_eq!(outcome.status, RunStatus::RollbackFailed);
    let rollback = outcome.rollback.as_ref().unwrap();
    assert_eq!(rollback.status, RollbackStatus::Failed);
    assert_eq!(rollback.revert.failed_units(), vec!["worker"]);
    assert!(rollback.verify_deployed.is_none());
}

#[tokio::test(start_paused = true)]
async fn stuck_drain_is_degraded_without_rollback() {
    let h = harness(&["api", "worker"]).await;
    h.backend.set_drain_polls("worker", u32::MAX).await;

    let outcome = h.orchestrator.run(vec![service("api"), service("worker")]).await;

    assert_eq!(outcome.status, RunStatus::Degraded);
    assert!(outcome.status.is_success());
    assert!(outcome.rollback.is_none());
    assert!(h.backend.calls_for(MemoryOp::Revert).await.is_empty());

    let drained = outcome.verify_drained.as_ref().unwrap();
    assert!(drained.result_for("worker").unwrap().error().is_some_and(UnitError::is_timeout));
    assert_eq!(drained.result_for("api").unwrap().outcome, Outcome::Succeeded);
    assert!(outcome.timed_out());
}

#[tokio::test(start_paused = true)]
async fn unhealthy_replicas_fail_drain_immediately() {
    let h = harness(&["api"]).await;
    h.backend.set_unhealthy("api", NEW, 1).await;

    let started = tokio::time::Instant::now();
    let outcome = h.orchestrator.run(vec![service("api")]).await;

    assert_eq!(outcome.status, RunStatus::Degraded);
    let drained = outcome.verify_drained.as_ref().unwrap();
    assert!(matches!(
        drained.result_for("api").unwrap().error(),
        Some(UnitError::Unhealthy { .. })
    ));
    assert!(!outcome.timed_out());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn failed_smoke_test_rolls_back() {
    let h = harness(&["api"]).await;
    h.prober.fail_smoke("api");

    let unit = service("api").with_smoke_endpoint("http://api.internal/life-alert");
    let outcome = h.orchestrator.run(vec![unit]).await;

    let verify = outcome.verify_deployed.as_ref().unwrap();
    assert!(matches!(
        verify.result_for("api").unwrap().error(),
        Some(UnitError::SmokeTest { .. })
    ));
    assert!(!outcome.timed_out());

    // The rolled-back unit still carries its smoke endpoint, and the
    // smoke test still fails, so the previous version is never confirmed.
    assert_eq!(outcome.status, RunStatus::RollbackFailed);
    assert_eq!(h.backend.active("api").await.unwrap().1, OLD);
}

#[tokio::test(start_paused = true)]
async fn unit_already_on_target_is_not_reverted() {
    let h = harness(&["worker"]).await;
    h.backend.add(SimulatedUnit::service("prod", "api", NEW)).await;
    h.prober.pin("worker", &OLD[..7]);

    let outcome = h.orchestrator.run(vec![service("api"), service("worker")]).await;

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert_eq!(h.backend.calls_for(MemoryOp::Revert).await, vec!["worker"]);
    let rollback = outcome.rollback.as_ref().unwrap();
    assert_eq!(rollback.revert.result_for("api").unwrap().outcome, Outcome::Succeeded);
    assert_eq!(rollback.status, RollbackStatus::Confirmed);
}

#[tokio::test(start_paused = true)]
async fn every_stage_reports_every_unit_once() {
    let h = harness(&["api", "worker", "billing"]).await;
    h.prober.pin("billing", &OLD[..7]);

    let outcome = h
        .orchestrator
        .run(vec![service("api"), service("worker"), service("billing")])
        .await;

    for report in outcome.reports() {
        let names: HashSet<_> = report.results.iter().map(|r| r.unit.as_str()).collect();
        assert_eq!(names.len(), report.results.len(), "{}", report.stage);
        assert_eq!(names.len(), 3, "{}", report.stage);
    }
}

#[tokio::test(start_paused = true)]
async fn status_query_error_fails_drain_without_retry() {
    let h = harness(&["api"]).await;
    h.backend
        .fail(MemoryOp::Describe, "api", BackendError::Transport("connection reset".to_string()))
        .await;

    let started = tokio::time::Instant::now();
    let outcome = h.orchestrator.run(vec![service("api")]).await;

    assert_eq!(outcome.status, RunStatus::Degraded);
    assert!(outcome.rollback.is_none());
    assert!(!outcome.timed_out());
    assert!(started.elapsed() < Duration::from_secs(1));

    let drained = outcome.verify_drained.as_ref().unwrap();
    assert!(matches!(
        drained.result_for("api").unwrap().error(),
        Some(UnitError::Backend { operation: Operation::DescribeUnitStatus, .. })
    ));
    assert_eq!(h.backend.calls_for(MemoryOp::Describe).await, vec!["api"]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_check_endpoint_is_retried_until_it_answers() {
    let h = harness(&["api"]).await;
    h.prober.refuse_fetches("api", 2);

    let outcome = h.orchestrator.run(vec![service("api")]).await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(!outcome.timed_out());
    let verify = outcome.verify_deployed.as_ref().unwrap();
    assert_eq!(verify.result_for("api").unwrap().outcome, Outcome::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn redeploying_current_version_still_waits_for_new_revision() {
    let backend = Arc::new(MemoryBackend::new());
    backend.add(SimulatedUnit::service("prod", "api", NEW)).await;
    let prober = Arc::new(ScriptedProber::new(backend.clone()));
    let scheduler = LaggingScheduler {
        inner: backend.clone(),
    };
    let orchestrator = Orchestrator::new(
        StageConfig {
            timeout: Duration::from_secs(1),
            check_interval: Duration::from_millis(250),
        },
        Arc::new(scheduler) as Arc<dyn Backend>,
        prober as Arc<dyn Prober>,
    );

    let outcome = orchestrator.run(vec![service("api")]).await;

    // The old revision never stops being primary, so draining cannot
    // be confirmed even though the version check passes.
    assert_eq!(outcome.status, RunStatus::Degraded);
    assert!(outcome.rollback.is_none());
    let drained = outcome.verify_drained.as_ref().unwrap();
    assert!(drained.result_for("api").unwrap().error().is_some_and(UnitError::is_timeout));
}
