//! gangway.toml configuration parser.
//!
//! Everything is validated at load time so the engine never has to deal
//! with malformed endpoints, unknown strategies or inverted timings.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};
use crate::unit::{ContainerFilter, Unit, UnitKind, UpdateStrategy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GangwayConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub scheduled_tasks: BTreeMap<String, ScheduledTaskConfig>,
}

/// Deadline and poll cadence shared by the polling stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    /// Per-stage deadline (e.g., "5m").
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Sleep between checks (e.g., "15s").
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            check_interval: default_check_interval(),
        }
    }
}

fn default_timeout() -> String {
    "5m".to_string()
}

fn default_check_interval() -> String {
    "15s".to_string()
}

impl TimingConfig {
    pub fn timeout(&self) -> ConfigResult<Duration> {
        positive_duration("timeout", &self.timeout)
    }

    pub fn check_interval(&self) -> ConfigResult<Duration> {
        positive_duration("check_interval", &self.check_interval)
    }
}

/// Where the scheduler control plane lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL of the control plane API.
    pub endpoint: Option<String>,
    /// Per-request timeout (e.g., "30s").
    pub request_timeout: Option<String>,
}

impl BackendConfig {
    pub fn request_timeout(&self) -> ConfigResult<Duration> {
        match &self.request_timeout {
            Some(value) => positive_duration("backend.request_timeout", value),
            None => Ok(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub cluster: String,
    /// Version check endpoint. Absent disables the deployed-version check.
    pub url: Option<String>,
    /// Smoke test run once the new version is observed.
    pub smoke_url: Option<String>,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    /// Containers to update. Absent means every container.
    pub containers: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduledTaskConfig {
    pub cluster: String,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl GangwayConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate config text.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: GangwayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.services.is_empty() && self.scheduled_tasks.is_empty() {
            return Err(ConfigError::NoUnits);
        }

        let timeout = self.timing.timeout()?;
        let interval = self.timing.check_interval()?;
        if interval >= timeout {
            return Err(ConfigError::IntervalNotBelowTimeout {
                interval: self.timing.check_interval.clone(),
                timeout: self.timing.timeout.clone(),
            });
        }

        if let Some(endpoint) = &self.backend.endpoint {
            validate_endpoint("backend", "endpoint", endpoint)?;
        }
        self.backend.request_timeout()?;

        for (name, service) in &self.services {
            non_empty(name, "cluster", &service.cluster)?;
            if let Some(url) = &service.url {
                validate_endpoint(name, "url", url)?;
            }
            if let Some(url) = &service.smoke_url {
                validate_endpoint(name, "smoke_url", url)?;
            }
            if let Some(containers) = &service.containers {
                if containers.is_empty() {
                    return Err(ConfigError::Empty {
                        unit: name.clone(),
                        field: "containers",
                    });
                }
                for container in containers {
                    non_empty(name, "containers", container)?;
                }
            }
        }

        for (name, task) in &self.scheduled_tasks {
            if self.services.contains_key(name) {
                return Err(ConfigError::DuplicateUnit(name.clone()));
            }
            non_empty(name, "cluster", &task.cluster)?;
        }

        Ok(())
    }

    /// Build the service units for a run targeting `version`.
    pub fn service_units(&self, version: &str) -> ConfigResult<Vec<Unit>> {
        let version = checked_version(version)?;
        Ok(self
            .services
            .iter()
            .map(|(name, s)| {
                let containers = match &s.containers {
                    Some(names) => ContainerFilter::Only(names.clone()),
                    None => ContainerFilter::All,
                };
                Unit {
                    check_endpoint: s.url.clone(),
                    smoke_endpoint: s.smoke_url.clone(),
                    ..Unit::new(name, UnitKind::Service, &s.cluster, version)
                }
                .with_strategy(s.update_strategy)
                .with_containers(containers)
                .with_tags(s.tags.clone())
            })
            .collect())
    }

    /// Build the scheduled-task units for a run targeting `version`.
    pub fn scheduled_task_units(&self, version: &str) -> ConfigResult<Vec<Unit>> {
        let version = checked_version(version)?;
        Ok(self
            .scheduled_tasks
            .iter()
            .map(|(name, t)| {
                Unit::new(name, UnitKind::ScheduledTask, &t.cluster, version)
                    .with_strategy(t.update_strategy)
                    .with_tags(t.tags.clone())
            })
            .collect())
    }
}

/// Check that `value` is an absolute `http://` URI.
pub fn check_http_endpoint(value: &str) -> Result<http::Uri, String> {
    let uri: http::Uri = value.parse().map_err(|e: http::uri::InvalidUri| e.to_string())?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(format!("unsupported scheme {other:?}, expected http")),
        None => return Err("missing scheme".to_string()),
    }
    if uri.authority().is_none() {
        return Err("missing host".to_string());
    }
    Ok(uri)
}

fn validate_endpoint(unit: &str, field: &'static str, value: &str) -> ConfigResult<()> {
    check_http_endpoint(value)
        .map(|_| ())
        .map_err(|reason| ConfigError::InvalidEndpoint {
            unit: unit.to_string(),
            field,
            value: value.to_string(),
            reason,
        })
}

fn non_empty(unit: &str, field: &'static str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty {
            unit: unit.to_string(),
            field,
        });
    }
    Ok(())
}

fn positive_duration(field: &'static str, value: &str) -> ConfigResult<Duration> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(ConfigError::InvalidDuration {
            field,
            value: value.to_string(),
        }),
    }
}

fn checked_version(version: &str) -> ConfigResult<&str> {
    let version = version.trim();
    if version.is_empty() {
        return Err(ConfigError::EmptyVersion);
    }
    Ok(version)
}
