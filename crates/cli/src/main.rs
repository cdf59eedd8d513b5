//! pose-batch - run pose prediction over a directory of videos
//!
//! Every video under the input directory gets a detection file and a flat CSV
//! table. Videos that already have a table are skipped, so an interrupted run
//! can simply be started again.

use anyhow::{Context as _, Result};
use clap::Parser;
use pose_batch_model::ExternalPoseModel;
use pose_batch_scheduler::{BatchReport, BatchScheduler, SchedulerOptions};
use pose_batch_tracking::TrackingConfig;
use pose_batch_transcode::{FfmpegRepairer, OverlayStyle};
use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

mod config;

use config::PipelineConfig;

#[derive(Parser)]
#[command(
    name = "pose-batch",
    version,
    about = "Batch pose prediction for a directory of videos",
    after_help = "EXAMPLES:\n  \
                  # Predict every video under trials/, writing tables next to each video\n  \
                  pose-batch trials/\n\n  \
                  # Track two animals and render overlays into a separate output tree\n  \
                  pose-batch trials/ -t -n 2 -r -o results/\n\n  \
                  # Re-encode videos the model cannot index, without prompting\n  \
                  pose-batch trials/ --fix-videos --yes"
)]
struct Cli {
    /// Directory searched recursively for videos
    #[arg(value_name = "VIDEO_DIR")]
    video_dir: PathBuf,

    /// Write outputs under this directory, mirroring the input layout
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Expected number of animals per video (caps the number of tracks)
    #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
    number_of_animals: u16,

    /// Assign identities across frames
    #[arg(short, long)]
    tracking: bool,

    /// Render an overlay video for every processed video (retried on later runs if it fails)
    #[arg(short, long)]
    render: bool,

    /// Re-encode videos that fail to index and retry once
    #[arg(short, long)]
    fix_videos: bool,

    /// Recompute outputs that already exist
    #[arg(long)]
    overwrite: bool,

    /// Do not ask for confirmation before fixing videos
    #[arg(short, long)]
    yes: bool,

    /// YAML pipeline configuration (default: ./pose-batch.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the run log file
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool, log_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let log_path = log_dir.join(format!(
        "pose-batch_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    let log_file = File::create(&log_path)
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

    let default_level = if verbose { "debug" } else { "info" };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Mutex::new(log_file))
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to set tracing subscriber")?;

    Ok(log_path)
}

/// Ask before duplicating videos; only `y` or `yes` continues
fn confirm_fix_videos(input: impl BufRead, mut output: impl Write) -> Result<bool> {
    writeln!(
        output,
        "Videos that fail to index will be re-encoded into a fixed_videos/ folder next to them."
    )?;
    writeln!(
        output,
        "This duplicates every affected video and can use a lot of disk space."
    )?;
    write!(output, "Continue? [y/N] ")?;
    output.flush()?;

    let mut answer = String::new();
    input
        .take(256)
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn log_summary(report: &BatchReport) {
    info!("=== Summary ===");
    info!("Videos:      {}", report.total());
    info!("Predicted:   {}", report.predicted());
    info!("Repaired:    {}", report.repaired());
    info!("Reflattened: {}", report.reflattened());
    info!("Skipped:     {}", report.skipped());
    if report.failed() > 0 {
        warn!("Failed:      {}", report.failed());
        for (video, reason) in report.failures() {
            error!("  {}: {}", video.display(), reason);
        }
    }
    if report.overlay_failures() > 0 {
        warn!("Overlays not rendered: {}", report.overlay_failures());
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_path = init_logging(cli.verbose, &cli.log_dir)?;
    info!("Logging to {}", log_path.display());

    if cli.fix_videos && !cli.yes {
        let stdin = io::stdin();
        if !confirm_fix_videos(stdin.lock(), io::stderr())? {
            info!("Aborted by user, nothing was processed");
            return Ok(());
        }
    }

    let config = PipelineConfig::load(cli.config.as_deref())?;

    let tracking = cli.tracking.then(|| TrackingConfig {
        max_instances: Some(usize::from(cli.number_of_animals)),
        ..config.tracking.clone()
    });

    let options = SchedulerOptions {
        overwrite: cli.overwrite,
        repair: cli.fix_videos,
        tracking,
        render: cli.render.then(OverlayStyle::default),
        output_root: cli.output_dir.clone(),
        ffmpeg: config.ffmpeg.clone(),
    };

    let model = ExternalPoseModel::new(config.model);
    let repairer = FfmpegRepairer::new(config.ffmpeg);
    let scheduler = BatchScheduler::new(&model, &repairer, options);

    let report = scheduler
        .run(&cli.video_dir)
        .with_context(|| format!("Batch over {} failed", cli.video_dir.display()))?;

    log_summary(&report);
    Ok(())
}
