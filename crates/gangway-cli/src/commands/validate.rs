use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;

use gangway_core::GangwayConfig;

pub fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let config = GangwayConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;

    println!("✓ {} is valid", path.display());
    print!("{}", describe(&config)?);
    Ok(ExitCode::SUCCESS)
}

/// One line of timing, then one line per unit.
fn describe(config: &GangwayConfig) -> anyhow::Result<String> {
    let mut out = format!(
        "timing: timeout {:?}, check every {:?}\n",
        config.timing.timeout()?,
        config.timing.check_interval()?
    );

    for (name, service) in &config.services {
        let check = service.url.as_deref().unwrap_or("no version check");
        let containers = service
            .containers
            .as_ref()
            .map(|c| c.join(","))
            .unwrap_or_else(|| "all containers".to_string());
        out.push_str(&format!(
            "service        {name} ({}) strategy={} [{containers}] {check}\n",
            service.cluster, service.update_strategy
        ));
    }
    for (name, task) in &config.scheduled_tasks {
        out.push_str(&format!(
            "scheduled task {name} ({}) strategy={}\n",
            task.cluster, task.update_strategy
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_every_unit() {
        let config = GangwayConfig::parse(
            r#"
            [timing]
            timeout = "2m"
            check_interval = "10s"

            [services.api]
            cluster = "prod"
            url = "http://api.internal/revision"
            containers = ["web"]

            [services.worker]
            cluster = "prod"

            [scheduled_tasks.nightly-report]
            cluster = "prod"
            update_strategy = "latest"
            "#,
        )
        .unwrap();

        let text = describe(&config).unwrap();
        assert!(text.starts_with("timing: timeout 120s, check every 10s\n"));
        assert!(text.contains("service        api (prod) strategy=current [web] http://api.internal/revision"));
        assert!(text.contains("service        worker (prod) strategy=current [all containers] no version check"));
        assert!(text.contains("scheduled task nightly-report (prod) strategy=latest"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(&dir.path().join("gangway.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("gangway.toml"));
    }
}
