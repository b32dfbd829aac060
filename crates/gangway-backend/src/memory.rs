//! In-memory scheduler.
//!
//! Keeps, per unit, a family of revisions (`<name>:<n>`), each a set of
//! containers whose image tags carry the version they run. Activating a
//! revision restarts a drain: the next `drain_polls` status reads report
//! one replica short, after which the rollout is settled.
//!
//! Failures are injected per operation and unit, and every call is
//! recorded so callers can assert on exactly what was touched.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use gangway_core::{Backend, BackendError, Deployed, Unit, UnitKind, UnitStatus, UpdateStrategy};

/// Backend operations, for failure injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Update,
    Revert,
    Describe,
}

/// Starting state of one simulated unit.
#[derive(Debug, Clone)]
pub struct SimulatedUnit {
    name: String,
    cluster: String,
    kind: UnitKind,
    version: String,
    containers: Vec<String>,
    replicas: u32,
}

impl SimulatedUnit {
    /// A service with a single `app` container and two replicas.
    pub fn service(cluster: &str, name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            cluster: cluster.to_string(),
            kind: UnitKind::Service,
            version: version.to_string(),
            containers: vec!["app".to_string()],
            replicas: 2,
        }
    }

    /// A scheduled task; it never has steady-state replicas.
    pub fn scheduled_task(cluster: &str, name: &str, version: &str) -> Self {
        Self {
            kind: UnitKind::ScheduledTask,
            replicas: 0,
            ..Self::service(cluster, name, version)
        }
    }

    pub fn with_containers(mut self, containers: &[&str]) -> Self {
        self.containers = containers.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }
}

#[derive(Debug, Clone)]
struct Container {
    name: String,
    image: String,
}

impl Container {
    fn tag(&self) -> &str {
        self.image.rsplit_once(':').map(|(_, tag)| tag).unwrap_or("")
    }
}

#[derive(Debug, Clone)]
struct Revision {
    name: String,
    containers: Vec<Container>,
}

impl Revision {
    /// Version of the first container, which is the one serving traffic.
    fn version(&self) -> &str {
        self.containers.first().map(Container::tag).unwrap_or("")
    }
}

#[derive(Debug)]
struct UnitState {
    cluster: String,
    kind: UnitKind,
    revisions: Vec<Revision>,
    active: usize,
    desired: u32,
    drain_polls: u32,
    pending_polls: u32,
    /// Unhealthy replica count reported while a given version is active.
    unhealthy: HashMap<String, u32>,
}

#[derive(Debug, Default)]
struct State {
    units: HashMap<String, UnitState>,
    failures: HashMap<(MemoryOp, String), BackendError>,
    calls: Vec<(MemoryOp, String)>,
}

impl State {
    /// Record the call, apply any injected failure, and find the unit.
    fn enter(&mut self, op: MemoryOp, unit: &Unit) -> Result<&mut UnitState, BackendError> {
        self.calls.push((op, unit.name.clone()));
        if let Some(error) = self.failures.get(&(op, unit.name.clone())) {
            return Err(error.clone());
        }
        match self.units.get_mut(&unit.name) {
            Some(state) if state.cluster == unit.cluster => Ok(state),
            _ => Err(BackendError::NotFound(format!(
                "{} in cluster {}",
                unit.name, unit.cluster
            ))),
        }
    }
}

/// A scheduler that lives entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit running `unit.version` as revision `<name>:1`.
    pub async fn add(&self, unit: SimulatedUnit) {
        let revision = Revision {
            name: format!("{}:1", unit.name),
            containers: unit
                .containers
                .iter()
                .map(|c| Container {
                    name: c.clone(),
                    image: format!("registry.local/{c}:{}", unit.version),
                })
                .collect(),
        };
        self.state.lock().await.units.insert(
            unit.name.clone(),
            UnitState {
                cluster: unit.cluster,
                kind: unit.kind,
                revisions: vec![revision],
                active: 0,
                desired: unit.replicas,
                drain_polls: 0,
                pending_polls: 0,
                unhealthy: HashMap::new(),
            },
        );
    }

    /// Make every `op` against `unit` fail with `error` until cleared.
    pub async fn fail(&self, op: MemoryOp, unit: &str, error: BackendError) {
        self.state
            .lock()
            .await
            .failures
            .insert((op, unit.to_string()), error);
    }

    pub async fn clear_failure(&self, op: MemoryOp, unit: &str) {
        self.state.lock().await.failures.remove(&(op, unit.to_string()));
    }

    /// Status reads needed after each activation before the rollout settles.
    /// `u32::MAX` never settles.
    pub async fn set_drain_polls(&self, unit: &str, polls: u32) {
        if let Some(state) = self.state.lock().await.units.get_mut(unit) {
            state.drain_polls = polls;
            state.pending_polls = polls;
        }
    }

    /// Report `replicas` unhealthy replicas whenever `version` is active.
    pub async fn set_unhealthy(&self, unit: &str, version: &str, replicas: u32) {
        if let Some(state) = self.state.lock().await.units.get_mut(unit) {
            state.unhealthy.insert(version.to_string(), replicas);
        }
    }

    /// Active revision and the version it runs.
    pub async fn active(&self, unit: &str) -> Option<(String, String)> {
        let state = self.state.lock().await;
        let unit = state.units.get(unit)?;
        let revision = &unit.revisions[unit.active];
        Some((revision.name.clone(), revision.version().to_string()))
    }

    /// Image of every container in the active revision.
    pub async fn active_images(&self, unit: &str) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        state
            .units
            .get(unit)
            .map(|u| {
                u.revisions[u.active]
                    .containers
                    .iter()
                    .map(|c| (c.name.clone(), c.image.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn revision_count(&self, unit: &str) -> usize {
        self.state
            .lock()
            .await
            .units
            .get(unit)
            .map_or(0, |u| u.revisions.len())
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<(MemoryOp, String)> {
        self.state.lock().await.calls.clone()
    }

    /// Units `op` was called for, in call order.
    pub async fn calls_for(&self, op: MemoryOp) -> Vec<String> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, unit)| unit.clone())
            .collect()
    }
}

impl UnitState {
    fn activate(&mut self, index: usize) {
        self.active = index;
        self.pending_polls = self.drain_polls;
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn update_unit(&self, unit: &Unit) -> Result<Deployed, BackendError> {
        let mut state = self.state.lock().await;
        let sim = state.enter(MemoryOp::Update, unit)?;

        if sim.kind != unit.kind {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("{} is a {}, not a {}", unit.name, sim.kind, unit.kind),
            });
        }

        let current = sim.revisions[sim.active].clone();
        let base = match unit.update_strategy {
            UpdateStrategy::Current => current.clone(),
            UpdateStrategy::Latest => sim.revisions[sim.revisions.len() - 1].clone(),
            UpdateStrategy::None => {
                debug!(unit = %unit.name, revision = %current.name, "re-applying active revision");
                sim.activate(sim.active);
                return Ok(Deployed {
                    revision: current.name.clone(),
                    previous_revision: current.name.clone(),
                    previous_version: current.version().to_string(),
                });
            }
        };

        let mut containers = base.containers.clone();
        let mut updated = 0;
        let mut changed = false;
        for container in containers
            .iter_mut()
            .filter(|c| unit.containers.includes(&c.name))
        {
            updated += 1;
            if container.tag() == unit.target_version {
                continue;
            }
            changed = true;
            let repository = container
                .image
                .rsplit_once(':')
                .map(|(repo, _)| repo.to_string())
                .unwrap_or_else(|| container.image.clone());
            container.image = format!("{repository}:{}", unit.target_version);
        }
        if updated == 0 {
            return Err(BackendError::Rejected {
                status: 422,
                message: format!("no containers of {} match the container filter", unit.name),
            });
        }

        if !changed {
            debug!(unit = %unit.name, revision = %base.name, "images already on target, reusing revision");
            let index = sim
                .revisions
                .iter()
                .position(|r| r.name == base.name)
                .unwrap_or(sim.active);
            sim.activate(index);
            return Ok(Deployed {
                revision: base.name,
                previous_revision: current.name.clone(),
                previous_version: current.version().to_string(),
            });
        }

        let name = format!("{}:{}", unit.name, sim.revisions.len() + 1);
        debug!(unit = %unit.name, revision = %name, base = %base.name, "registered revision");
        sim.revisions.push(Revision {
            name: name.clone(),
            containers,
        });
        sim.activate(sim.revisions.len() - 1);

        Ok(Deployed {
            revision: name,
            previous_revision: current.name.clone(),
            previous_version: current.version().to_string(),
        })
    }

    async fn revert_unit(&self, unit: &Unit) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let sim = state.enter(MemoryOp::Revert, unit)?;

        let Some(revision) = unit.revision.as_deref() else {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("{} has no revision to activate", unit.name),
            });
        };
        let index = sim
            .revisions
            .iter()
            .position(|r| r.name == revision)
            .ok_or_else(|| BackendError::NotFound(format!("revision {revision}")))?;
        sim.activate(index);
        Ok(())
    }

    async fn describe_unit_status(&self, unit: &Unit) -> Result<UnitStatus, BackendError> {
        let mut state = self.state.lock().await;
        let sim = state.enter(MemoryOp::Describe, unit)?;

        let revision = &sim.revisions[sim.active];
        let unhealthy = sim
            .unhealthy
            .get(revision.version())
            .copied()
            .unwrap_or(0)
            .min(sim.desired);
        let running = if sim.pending_polls > 0 {
            sim.desired.saturating_sub(1)
        } else {
            sim.desired
        };
        let status = UnitStatus {
            active_revision: revision.name.clone(),
            running,
            desired: sim.desired,
            unhealthy,
        };
        sim.pending_polls = sim.pending_polls.saturating_sub(1);
        Ok(status)
    }
}
