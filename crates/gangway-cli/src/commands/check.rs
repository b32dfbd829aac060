use std::process::ExitCode;

use anyhow::Context;

use gangway_core::Prober;
use gangway_probe::HttpProber;
use gangway_rollout::matches_version;

pub async fn check(
    url: &str,
    version: &str,
    smoke_url: Option<&str>,
    smoke_token: Option<String>,
) -> anyhow::Result<ExitCode> {
    let mut prober = HttpProber::default();
    if let Some(token) = smoke_token.filter(|t| !t.is_empty()) {
        prober = prober.with_smoke_token(token);
    }

    let token = prober
        .fetch_deployed_version(url)
        .await
        .with_context(|| format!("probing {url}"))?;
    println!("{url} serves {token}");

    if !matches_version(version, &token) {
        println!("✗ expected {version}");
        return Ok(ExitCode::FAILURE);
    }

    if let Some(smoke_url) = smoke_url {
        if let Err(e) = prober.smoke_test(smoke_url).await {
            println!("✗ smoke test failed: {e}");
            return Ok(ExitCode::FAILURE);
        }
        println!("✓ smoke test passed");
    }

    println!("✓ {version} is live");
    Ok(ExitCode::SUCCESS)
}
