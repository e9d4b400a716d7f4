use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vo_core::dataset::SequenceSource;
use vo_core::{Config, ImageSequence, PrecomputedPerception, VisualOdometry};

#[derive(Parser, Debug)]
#[command(
    name = "vo",
    version,
    about = "Monocular visual odometry over a recorded sequence"
)]
struct Cli {
    /// YAML configuration file
    #[arg(long)]
    config: PathBuf,

    /// Override the configured sequence name
    #[arg(long)]
    seq: Option<String>,

    /// Override the configured result directory
    #[arg(long)]
    result_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    let mut cfg = Config::from_yaml_file(&cli.config)
        .with_context(|| format!("loading configuration {}", cli.config.display()))?;
    if let Some(seq) = cli.seq {
        cfg.seq = seq;
    }
    if let Some(result_dir) = cli.result_dir {
        cfg.directory.result_dir = result_dir;
    }

    let dataset = ImageSequence::open(&cfg).context("opening image sequence")?;
    let perception = PrecomputedPerception::open(&cfg).context("opening perception inputs")?;

    let mut vo = VisualOdometry::new(cfg.clone(), *dataset.cam_intrinsics())
        .context("initializing the tracker")?;
    vo.run(&dataset, &perception).context("running the sequence")?;

    fs::create_dir_all(&cfg.directory.result_dir)
        .with_context(|| format!("creating {}", cfg.directory.result_dir.display()))?;
    let traj_path = cfg.directory.result_dir.join(format!("{}.txt", cfg.seq));
    dataset
        .save_result_traj(&traj_path, vo.global_poses())
        .context("writing trajectory")?;
    info!(path = %traj_path.display(), frames = vo.global_poses().len(), "trajectory written");

    let stats_path = cfg.directory.result_dir.join(format!("{}_stats.json", cfg.seq));
    let stats = serde_json::to_string_pretty(&vo.timers().summary())?;
    fs::write(&stats_path, stats).context("writing timing stats")?;
    vo.timers().report();

    Ok(())
}

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
