use anyhow::{Context, Result};
use rollcalld::{Config, Pipeline, PipelineState};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        camera = config.camera_index,
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        detector = %config.detector,
        "configuration loaded"
    );

    let camera = config.camera_index;
    let cycle = config.cycle();
    let pipeline = Arc::new(Pipeline::from_config(config).context("building pipeline")?);

    let stats = pipeline.statistics();
    tracing::info!(identities = stats.identities, samples = stats.total_samples, trained = stats.trained, "gallery loaded");

    pipeline.start(camera).context("starting pipeline")?;
    tracing::info!("rollcalld ready");

    let mut ticker = tokio::time::interval(cycle);
    let mut present: BTreeSet<String> = BTreeSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if pipeline.state() == PipelineState::Stopped {
                    let reason = pipeline.last_error().unwrap_or_else(|| "unknown".into());
                    tracing::error!(reason = %reason, "pipeline stopped unexpectedly");
                    anyhow::bail!("pipeline faulted: {reason}");
                }
                let now: BTreeSet<String> = pipeline
                    .detected_faces()
                    .iter()
                    .map(|f| f.label().to_string())
                    .collect();
                for name in now.difference(&present) {
                    tracing::info!(name = %name, "present");
                }
                for name in present.difference(&now) {
                    tracing::info!(name = %name, "gone");
                }
                present = now;
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    tracing::info!("rollcalld shutting down");
    let pipeline = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || pipeline.stop()).await??;

    Ok(())
}
