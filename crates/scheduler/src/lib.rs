//! Batch scheduler
//!
//! Walks every discovered video through prediction and writes its outputs.
//! Each video ends in exactly one [`VideoOutcome`]:
//!
//! ```text
//! DISCOVERED -> SKIPPED
//! DISCOVERED -> PREDICTING -> PREDICTED
//! DISCOVERED -> PREDICTING -> REPAIRING -> PREDICTED | FAILED
//! DISCOVERED -> PREDICTING -> FAILED
//! ```
//!
//! Only an indexing failure from the model is handled per video. It is either
//! repaired and retried once, or recorded as failed while the batch moves on.
//! Any other error stops the whole batch with [`BatchError::Aborted`]; outputs
//! already written for earlier videos stay on disk.
//!
//! Overlay rendering is best effort. A failed render is recorded in the
//! video's [`OverlayStatus`], and a later run renders the missing overlay from
//! the saved detection file even when the table is skipped.

use pose_batch_common::DetectionResult;
use pose_batch_discovery::{discover_videos, plan_tasks, DiscoveryError, VideoTask};
use pose_batch_flatten::{write_table, FlattenError};
use pose_batch_model::{
    read_detection_file, write_detection_file, DetectionFileError, PoseModel, PredictError,
};
use pose_batch_tracking::{assign_tracks, PoseTracker, TrackingConfig, TrackingError};
use pose_batch_transcode::{render_overlay, OverlayStyle, VideoRepairer};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

/// Errors that stop processing of a single video
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("Prediction failed: {0}")]
    Predict(#[from] PredictError),

    #[error(transparent)]
    DetectionFile(#[from] DetectionFileError),

    #[error("Failed to write table: {0}")]
    Flatten(#[from] FlattenError),

    #[error("Tracking failed: {0}")]
    Tracking(#[from] TrackingError),
}

/// Errors that end the batch
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Invalid tracking configuration: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Batch aborted at {} after {completed} finished video(s): {source}", video.display())]
    Aborted {
        video: PathBuf,
        completed: usize,
        #[source]
        source: Box<VideoError>,
    },
}

/// Why a video ended up FAILED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Indexing failure with repair disabled
    Indexing(String),
    /// The repaired copy failed to index as well
    RetryIndexing(String),
    /// The repair itself did not produce a usable copy; no retry was made
    RepairProcess(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Indexing(msg) => write!(f, "indexing failed (repair disabled): {msg}"),
            FailureReason::RetryIndexing(msg) => {
                write!(f, "indexing failed again after repair: {msg}")
            }
            FailureReason::RepairProcess(msg) => write!(f, "repair failed: {msg}"),
        }
    }
}

/// Terminal state of one video
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoOutcome {
    Predicted { rows: usize },
    Repaired { fixed_path: PathBuf, rows: usize },
    /// Table rebuilt from an existing detection file without calling the model
    Reflattened { rows: usize },
    Skipped,
    Failed(FailureReason),
}

impl VideoOutcome {
    /// Short label used in logs and summaries
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            VideoOutcome::Predicted { .. } => "predicted",
            VideoOutcome::Repaired { .. } => "repaired",
            VideoOutcome::Reflattened { .. } => "reflattened",
            VideoOutcome::Skipped => "skipped",
            VideoOutcome::Failed(_) => "failed",
        }
    }
}

/// What happened to a video's overlay during this run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OverlayStatus {
    /// Rendering disabled, the overlay already existed, or there was nothing to render from
    #[default]
    NotRendered,
    Rendered(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoReport {
    pub source: PathBuf,
    pub table: PathBuf,
    pub outcome: VideoOutcome,
    pub overlay: OverlayStatus,
}

/// Result of a completed batch, one report per video in discovery order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub videos: Vec<VideoReport>,
}

impl BatchReport {
    fn count(&self, label: &str) -> usize {
        self.videos
            .iter()
            .filter(|v| v.outcome.label() == label)
            .count()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.videos.len()
    }

    #[must_use]
    pub fn predicted(&self) -> usize {
        self.count("predicted")
    }

    #[must_use]
    pub fn repaired(&self) -> usize {
        self.count("repaired")
    }

    #[must_use]
    pub fn reflattened(&self) -> usize {
        self.count("reflattened")
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count("failed")
    }

    /// Overlays that could not be rendered
    #[must_use]
    pub fn overlay_failures(&self) -> usize {
        self.videos
            .iter()
            .filter(|v| matches!(v.overlay, OverlayStatus::Failed(_)))
            .count()
    }

    /// Videos that ended FAILED, with their reason
    pub fn failures(&self) -> impl Iterator<Item = (&Path, &FailureReason)> {
        self.videos.iter().filter_map(|v| match &v.outcome {
            VideoOutcome::Failed(reason) => Some((v.source.as_path(), reason)),
            _ => None,
        })
    }
}

/// Batch behaviour switches
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Recompute outputs even when they already exist
    pub overwrite: bool,
    /// Re-encode and retry videos that fail to index
    pub repair: bool,
    /// Assign identities before writing outputs
    pub tracking: Option<TrackingConfig>,
    /// Render an overlay video per processed video
    pub render: Option<OverlayStyle>,
    /// Mirror outputs under this directory instead of next to each video
    pub output_root: Option<PathBuf>,
    /// ffmpeg binary used for overlay rendering
    pub ffmpeg: PathBuf,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            repair: false,
            tracking: None,
            render: None,
            output_root: None,
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

/// Sequential per-video scheduler
///
/// The model and the repairer are built once by the caller and borrowed for
/// the whole batch.
pub struct BatchScheduler<'a> {
    model: &'a dyn PoseModel,
    repairer: &'a dyn VideoRepairer,
    options: SchedulerOptions,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(
        model: &'a dyn PoseModel,
        repairer: &'a dyn VideoRepairer,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            model,
            repairer,
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Discover every video under `root` and process them in order
    pub fn run(&self, root: &Path) -> Result<BatchReport, BatchError> {
        if let Some(config) = &self.options.tracking {
            PoseTracker::new(config.clone())?;
        }

        let videos = discover_videos(root)?;
        let total = videos.len();

        let mut report = BatchReport {
            videos: Vec::with_capacity(total),
        };

        let tasks = plan_tasks(&videos, root, self.options.output_root.as_deref());
        for (idx, task) in tasks.iter().enumerate() {
            let _span = info_span!("video", file = %task.file_name()).entered();
            let video = &task.source_path;
            info!("[{}/{}] {}", idx + 1, total, video.display());

            let video_report = self
                .process_video(task)
                .map_err(|source| BatchError::Aborted {
                    video: video.clone(),
                    completed: idx,
                    source: Box::new(source),
                })?;

            match &video_report.outcome {
                VideoOutcome::Failed(reason) => {
                    error!("[{}/{}] FAILED {}: {}", idx + 1, total, video.display(), reason);
                }
                other => info!("[{}/{}] {}", idx + 1, total, other.label()),
            }

            report.videos.push(video_report);
        }

        info!(
            "Batch complete: {} predicted, {} repaired, {} reflattened, {} skipped, {} failed",
            report.predicted(),
            report.repaired(),
            report.reflattened(),
            report.skipped(),
            report.failed()
        );
        if report.overlay_failures() > 0 {
            warn!("{} overlay(s) could not be rendered", report.overlay_failures());
        }
        Ok(report)
    }

    /// Drive one video to its terminal state
    ///
    /// A report with `VideoOutcome::Failed(_)` is a recorded per-video failure;
    /// `Err` is fatal for the batch.
    pub fn process_video(&self, task: &VideoTask) -> Result<VideoReport, VideoError> {
        let mut overlay = OverlayStatus::NotRendered;
        let outcome = self.drive(task, &mut overlay)?;
        Ok(VideoReport {
            source: task.source_path.clone(),
            table: task.output_table_path.clone(),
            outcome,
            overlay,
        })
    }

    fn drive(
        &self,
        task: &VideoTask,
        overlay: &mut OverlayStatus,
    ) -> Result<VideoOutcome, VideoError> {
        if !self.options.overwrite {
            if task.output_table_path.exists() {
                debug!(
                    "Table {} exists, skipping",
                    task.output_table_path.display()
                );
                self.render_missing_overlay(task, overlay);
                return Ok(VideoOutcome::Skipped);
            }
            if let Some(mut result) = self.cached_detections(task) {
                let rows = self.write_outputs(task, &mut result, &task.source_path, false, overlay)?;
                return Ok(VideoOutcome::Reflattened { rows });
            }
        }

        let err = match self.model.predict(&task.source_path) {
            Ok(mut result) => {
                let rows = self.write_outputs(task, &mut result, &task.source_path, true, overlay)?;
                return Ok(VideoOutcome::Predicted { rows });
            }
            Err(err) if err.is_indexing() => err,
            Err(err) => return Err(err.into()),
        };

        if !self.options.repair {
            warn!("{} (enable video fixing to repair and retry)", err);
            return Ok(VideoOutcome::Failed(FailureReason::Indexing(err.to_string())));
        }

        warn!("{}; repairing", err);
        let fixed_path = task.repair_path();
        if let Err(reason) = self.repair(task, &fixed_path) {
            return Ok(VideoOutcome::Failed(FailureReason::RepairProcess(reason)));
        }

        info!("Retrying prediction on {}", fixed_path.display());
        match self.model.predict(&fixed_path) {
            Ok(mut result) => {
                let rows = self.write_outputs(task, &mut result, &fixed_path, true, overlay)?;
                Ok(VideoOutcome::Repaired { fixed_path, rows })
            }
            Err(err) if err.is_indexing() => Ok(VideoOutcome::Failed(
                FailureReason::RetryIndexing(err.to_string()),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Load a previously saved detection file, if it is present and usable
    ///
    /// An unreadable or invalid file is ignored and the video is predicted
    /// again, which also replaces the file.
    fn cached_detections(&self, task: &VideoTask) -> Option<DetectionResult> {
        let path = &task.output_detection_path;
        if !path.is_file() {
            return None;
        }
        match read_detection_file(path) {
            Ok(result) => match result.validate() {
                Ok(()) => {
                    info!("Reusing detections from {}", path.display());
                    Some(result)
                }
                Err(err) => {
                    warn!(
                        "Ignoring invalid detection file {}: {}; predicting again",
                        path.display(),
                        err
                    );
                    None
                }
            },
            Err(err) => {
                warn!("Ignoring unusable detection file: {}; predicting again", err);
                None
            }
        }
    }

    /// Render an overlay for a skipped video whose earlier render never completed
    fn render_missing_overlay(&self, task: &VideoTask, overlay: &mut OverlayStatus) {
        let Some(style) = &self.options.render else {
            return;
        };
        if task.overlay_path().exists() {
            return;
        }
        if !task.output_detection_path.is_file() {
            debug!("No detections saved for {}, overlay not rendered", task.source_path.display());
            return;
        }
        match read_detection_file(&task.output_detection_path) {
            Ok(result) => {
                let fixed = task.repair_path();
                let video = if fixed.is_file() {
                    fixed
                } else {
                    task.source_path.clone()
                };
                *overlay = self.render(task, &result, &video, style);
            }
            Err(err) => {
                warn!("Cannot render missing overlay: {}", err);
                *overlay = OverlayStatus::Failed(err.to_string());
            }
        }
    }

    fn render(
        &self,
        task: &VideoTask,
        result: &DetectionResult,
        video: &Path,
        style: &OverlayStyle,
    ) -> OverlayStatus {
        let path = task.overlay_path();
        match render_overlay(&self.options.ffmpeg, video, result, &path, style) {
            Ok(()) => {
                info!("Overlay written to {}", path.display());
                OverlayStatus::Rendered(path)
            }
            Err(err) => {
                warn!("Overlay for {} failed: {}", video.display(), err);
                OverlayStatus::Failed(err.to_string())
            }
        }
    }

    fn repair(&self, task: &VideoTask, fixed_path: &Path) -> Result<(), String> {
        let dir = task.repair_directory();
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
        self.repairer
            .repair(&task.source_path, fixed_path)
            .map_err(|e| e.to_string())?;
        info!("Repaired copy written to {}", fixed_path.display());
        Ok(())
    }

    /// Track, persist and flatten a result; returns the number of table rows
    fn write_outputs(
        &self,
        task: &VideoTask,
        result: &mut DetectionResult,
        video: &Path,
        save_detections: bool,
        overlay: &mut OverlayStatus,
    ) -> Result<usize, VideoError> {
        if let Some(config) = &self.options.tracking {
            let summary = assign_tracks(result, config)?;
            debug!(
                "{} track(s), {} unassigned instance(s)",
                summary.tracks, summary.unassigned
            );
        }

        if save_detections {
            write_detection_file(&task.output_detection_path, result)?;
        }

        let rows = write_table(
            result,
            &task.output_table_path,
            self.options.tracking.is_some(),
        )?;

        if let Some(style) = &self.options.render {
            *overlay = self.render(task, result, video, style);
        }

        Ok(rows)
    }
}
