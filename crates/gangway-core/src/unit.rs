//! Deployable units.
//!
//! A `Unit` is one service or scheduled task tracked through a single
//! orchestration run. Units are built once from configuration and only
//! mutated by the deploy stage (`apply_deployed`) and the rollback
//! controller (`swap_for_rollback`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of workload a unit is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Long-running service with replicas behind a load balancer.
    Service,
    /// Job launched on a schedule; has no steady-state replicas.
    ScheduledTask,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Service => "service",
            UnitKind::ScheduledTask => "scheduled_task",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the backend picks the revision a new one is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Derive from the revision the unit is currently running.
    #[default]
    Current,
    /// Derive from the newest revision registered in the unit's family.
    Latest,
    /// Register nothing; re-apply the active revision.
    None,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::Current => "current",
            UpdateStrategy::Latest => "latest",
            UpdateStrategy::None => "none",
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which containers of a revision get the new version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFilter {
    /// Every container in the revision.
    #[default]
    All,
    /// Only the named containers.
    Only(Vec<String>),
}

impl ContainerFilter {
    /// Whether the named container should be updated.
    pub fn includes(&self, container: &str) -> bool {
        match self {
            ContainerFilter::All => true,
            ContainerFilter::Only(names) => names.iter().any(|n| n == container),
        }
    }
}

/// What the backend reports after a successful update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployed {
    /// Revision the unit now runs.
    pub revision: String,
    /// Revision the unit ran before the update.
    pub previous_revision: String,
    /// Version token the unit ran before the update.
    pub previous_version: String,
}

/// Rollout progress of a unit as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// Revision the scheduler treats as primary.
    pub active_revision: String,
    /// Replicas currently running the primary revision.
    pub running: u32,
    /// Replicas the primary revision should have.
    pub desired: u32,
    /// Replicas of the primary revision failing health checks.
    pub unhealthy: u32,
}

impl UnitStatus {
    /// Every desired replica is running and nothing is failing health checks.
    pub fn is_settled(&self) -> bool {
        self.running == self.desired && self.unhealthy == 0
    }
}

/// One deployable entity tracked through an orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Unique within a run.
    pub name: String,
    pub kind: UnitKind,
    /// Scheduler namespace the backend addresses the unit in.
    pub cluster: String,
    /// Version this run converges the unit to.
    pub target_version: String,
    /// Version observed before this run's update. Set by the deploy stage.
    pub previous_version: Option<String>,
    /// Revision handle the unit runs after the update.
    pub revision: Option<String>,
    /// Revision handle the unit ran before the update.
    pub previous_revision: Option<String>,
    /// Address the prober fetches the deployed version from.
    pub check_endpoint: Option<String>,
    /// Address of a post-deploy smoke test.
    pub smoke_endpoint: Option<String>,
    pub update_strategy: UpdateStrategy,
    pub containers: ContainerFilter,
    /// Descriptive labels; only ever reported, never interpreted.
    pub tags: Vec<String>,
}

impl Unit {
    /// Create a unit with no history, no endpoints and default strategy.
    pub fn new(name: &str, kind: UnitKind, cluster: &str, target_version: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            cluster: cluster.to_string(),
            target_version: target_version.to_string(),
            previous_version: None,
            revision: None,
            previous_revision: None,
            check_endpoint: None,
            smoke_endpoint: None,
            update_strategy: UpdateStrategy::default(),
            containers: ContainerFilter::default(),
            tags: Vec::new(),
        }
    }

    pub fn service(name: &str, cluster: &str, target_version: &str) -> Self {
        Self::new(name, UnitKind::Service, cluster, target_version)
    }

    pub fn scheduled_task(name: &str, cluster: &str, target_version: &str) -> Self {
        Self::new(name, UnitKind::ScheduledTask, cluster, target_version)
    }

    pub fn with_check_endpoint(mut self, endpoint: &str) -> Self {
        self.check_endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_smoke_endpoint(mut self, endpoint: &str) -> Self {
        self.smoke_endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    pub fn with_containers(mut self, containers: ContainerFilter) -> Self {
        self.containers = containers;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Record what a successful update produced.
    pub fn apply_deployed(&mut self, deployed: Deployed) {
        self.revision = Some(deployed.revision);
        self.previous_revision = Some(deployed.previous_revision);
        self.previous_version = Some(deployed.previous_version);
    }

    /// Whether a deploy has recorded enough history to roll back.
    pub fn has_history(&self) -> bool {
        self.previous_version.is_some()
    }

    /// Rolling back would land on the version the unit already targets.
    pub fn is_rollback_noop(&self) -> bool {
        self.previous_version.as_deref() == Some(self.target_version.as_str())
    }

    /// Swap target/previous version and revision so the unit points back
    /// at what it ran before. Returns `false` (and leaves the unit alone)
    /// when no deploy has recorded history yet.
    pub fn swap_for_rollback(&mut self) -> bool {
        let Some(previous) = self.previous_version.take() else {
            return false;
        };
        self.previous_version = Some(std::mem::replace(&mut self.target_version, previous));
        std::mem::swap(&mut self.revision, &mut self.previous_revision);
        true
    }
}
