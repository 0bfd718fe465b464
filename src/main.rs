use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use vuramp::{Config, HttpGet, RampingExecutor};

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c, the run will only stop when its stages end");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env().context("invalid configuration")?;
    let url = config.target_url()?;

    info!(
        url = %url,
        stages = ?config.plan.stages(),
        graceful_ramp_down = ?config.graceful_ramp_down,
        graceful_stop = ?config.graceful_stop,
        "load test configured"
    );

    let scenario = Arc::new(
        HttpGet::new(url, config.request_timeout).context("failed to build http client")?,
    );
    let executor = RampingExecutor::new(
        config.plan.clone(),
        config.graceful_ramp_down,
        config.graceful_stop,
    );

    let summary = executor.run(scenario, ctrl_c()).await;
    println!("{summary}");

    if let Some(path) = &config.summary_export {
        summary
            .export(path)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
        info!(path = %path.display(), "summary exported");
    }

    Ok(())
}
