//! gangway-core: shared types for the Gangway deployment orchestrator.
//!
//! Everything the orchestration engine and its adapters agree on lives
//! here, so the engine never has to name a concrete scheduler or probe.
//!
//! # Components
//!
//! - **`unit`**: Deployable units and their version/revision history
//! - **`backend`**: Collaborator contracts (`Backend`, `Prober`) and their errors
//! - **`config`**: `gangway.toml` model, loading and validation
//! - **`duration`**: Human-friendly duration strings ("250ms", "15s", "5m")

pub mod backend;
pub mod config;
pub mod duration;
pub mod error;
pub mod unit;

pub use backend::{Backend, BackendError, ProbeError, Prober};
pub use config::{BackendConfig, GangwayConfig, ScheduledTaskConfig, ServiceConfig, TimingConfig};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use unit::{ContainerFilter, Deployed, Unit, UnitKind, UnitStatus, UpdateStrategy};
