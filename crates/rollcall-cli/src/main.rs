use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{Detector, Gallery};
use rollcall_hw::Camera;
use rollcalld::{Config, Pipeline, PipelineState, ReplayOpener};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall face presence CLI")]
struct Cli {
    /// Config file (overrides $ROLLCALL_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the largest face in an image
    Enroll {
        /// Identity ID (e.g. a student number)
        #[arg(long)]
        id: String,
        /// Display name; defaults to the ID
        #[arg(long, default_value = "")]
        name: String,
        /// Image file containing the face
        image: PathBuf,
    },
    /// Remove an enrolled identity
    Unenroll {
        id: String,
    },
    /// List enrolled identities
    List,
    /// Match every face in an image against the gallery
    Identify {
        image: PathBuf,
    },
    /// Show gallery statistics
    Stats,
    /// List V4L2 capture devices
    Devices,
    /// Run the live pipeline and print presence changes
    Watch {
        /// Camera index (defaults to the configured one)
        #[arg(short, long)]
        device: Option<u32>,
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Serve this image as the camera instead of real hardware
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Write an annotated JPEG of the last frame here on exit
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_overrides(|key: &str| std::env::var(key).ok());
            config
        }
        None => Config::load()?,
    };

    match cli.command {
        Commands::Enroll { id, name, image } => {
            let pipeline = Pipeline::from_config(config)?;
            let samples = pipeline
                .enroll_path(&id, &name, &image)
                .with_context(|| format!("enrolling {}", image.display()))?;
            print_json(&json!({ "id": id, "samples": samples }))?;
        }
        Commands::Unenroll { id } => {
            open_gallery(&config).unenroll(&id)?;
            print_json(&json!({ "removed": id.trim() }))?;
        }
        Commands::List => {
            print_json(&serde_json::to_value(open_gallery(&config).identities())?)?;
        }
        Commands::Identify { image } => {
            let pipeline = Pipeline::from_config(config)?;
            let gray = image::open(&image)
                .with_context(|| format!("reading {}", image.display()))?
                .to_luma8();
            let faces: Vec<_> = pipeline
                .identify_image(&gray)?
                .into_iter()
                .map(|(region, outcome)| json!({ "region": region, "match": outcome }))
                .collect();
            print_json(&json!({ "faces": faces }))?;
        }
        Commands::Stats => {
            print_json(&serde_json::to_value(open_gallery(&config).statistics())?)?;
        }
        Commands::Devices => {
            let devices: Vec<_> = Camera::list_devices()
                .into_iter()
                .map(|d| {
                    json!({
                        "index": d.index,
                        "path": d.path,
                        "name": d.name,
                        "driver": d.driver,
                        "bus": d.bus,
                    })
                })
                .collect();
            print_json(&json!(devices))?;
        }
        Commands::Watch { device, seconds, replay, snapshot } => {
            watch(config, device, seconds, replay.as_deref(), snapshot.as_deref()).await?;
        }
    }

    Ok(())
}

async fn watch(
    config: Config,
    device: Option<u32>,
    seconds: Option<u64>,
    replay: Option<&Path>,
    snapshot: Option<&Path>,
) -> Result<()> {
    let index = device.unwrap_or(config.camera_index);
    let cycle = config.cycle();

    let pipeline = match replay {
        Some(path) => {
            let opener = ReplayOpener::from_path(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let detector = Detector::from_model_dir(
                &config.model_dir,
                config.detector_params(),
                config.backend_preference(),
            )?;
            Pipeline::new(config, detector, Box::new(opener))
        }
        None => Pipeline::from_config(config)?,
    };
    let pipeline = Arc::new(pipeline);
    pipeline.start(index)?;

    let deadline = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(cycle);
    let mut present: BTreeSet<String> = BTreeSet::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if pipeline.state() == PipelineState::Stopped {
                    anyhow::bail!(
                        "pipeline stopped: {}",
                        pipeline.last_error().unwrap_or_else(|| "unknown".into())
                    );
                }
                let now: BTreeSet<String> =
                    pipeline.detected_faces().iter().map(|f| f.label().to_string()).collect();
                for name in now.difference(&present) {
                    print_json(&json!({ "event": "present", "name": name }))?;
                }
                for name in present.difference(&now) {
                    print_json(&json!({ "event": "gone", "name": name }))?;
                }
                present = now;
            }
            _ = &mut deadline => break,
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    if let Some(path) = snapshot {
        let jpeg = pipeline.snapshot_jpeg()?;
        std::fs::write(path, jpeg).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "snapshot written");
    }

    let stopper = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || stopper.stop()).await??;
    print_json(&serde_json::to_value(pipeline.statistics())?)?;
    Ok(())
}

/// Gallery-only commands skip the detector, so they work without model files.
fn open_gallery(config: &Config) -> Gallery {
    Gallery::open(&config.db_path, config.gallery_params())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
