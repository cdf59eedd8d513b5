//! End-to-end scheduler scenarios with a scripted model and repairer

use pose_batch_common::{DetectionResult, Frame, Instance, Skeleton, VideoContext};
use pose_batch_discovery::DiscoveryError;
use pose_batch_model::{read_detection_file, write_detection_file, PoseModel, PredictError};
use pose_batch_scheduler::{
    BatchError, BatchScheduler, FailureReason, OverlayStatus, SchedulerOptions, VideoError,
    VideoOutcome,
};
use pose_batch_tracking::TrackingConfig;
use pose_batch_transcode::{OverlayStyle, RepairError, VideoRepairer};
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scripted model keyed on the video file name:
/// - `broken*` fails to index, its repaired copy `fixed_broken*` works
/// - `hopeless*` fails to index even after repair
/// - `crash*` fails with a non-indexing error
/// - anything else yields one instance
#[derive(Default)]
struct ScriptedModel {
    calls: RefCell<Vec<PathBuf>>,
}

impl ScriptedModel {
    fn called_names(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }
}

impl PoseModel for ScriptedModel {
    fn predict(&self, video: &Path) -> Result<DetectionResult, PredictError> {
        self.calls.borrow_mut().push(video.to_path_buf());
        let name = video.file_name().unwrap().to_string_lossy().into_owned();

        if name.starts_with("broken") || name.contains("hopeless") {
            return Err(PredictError::Indexing {
                video: video.to_path_buf(),
                message: "KeyError: 1200".to_string(),
            });
        }
        if name.starts_with("crash") {
            return Err(PredictError::Failed {
                video: video.to_path_buf(),
                code: Some(134),
                stderr: "CUDA error: out of memory".to_string(),
            });
        }
        Ok(detections(video))
    }
}

struct CopyRepairer {
    calls: Cell<usize>,
    fail: bool,
}

impl CopyRepairer {
    fn new() -> Self {
        Self {
            calls: Cell::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: Cell::new(0),
            fail: true,
        }
    }
}

impl VideoRepairer for CopyRepairer {
    fn repair(&self, source: &Path, destination: &Path) -> Result<(), RepairError> {
        self.calls.set(self.calls.get() + 1);
        if self.fail {
            return Err(RepairError::Failed {
                source_video: source.to_path_buf(),
                code: Some(1),
                stderr: "Invalid data found when processing input".to_string(),
            });
        }
        fs::copy(source, destination).unwrap();
        Ok(())
    }
}

fn detections(video: &Path) -> DetectionResult {
    DetectionResult {
        video: VideoContext {
            path: video.to_path_buf(),
            height: 480,
            width: 640,
            fps: 30.0,
        },
        skeleton: Skeleton::new(["head", "tail"]),
        frames: vec![
            Frame::new(
                0,
                vec![Instance::new(0.9)
                    .with_point("head", 10.0, 12.0)
                    .with_absent("tail")],
            ),
            Frame::new(
                1,
                vec![Instance::new(0.8)
                    .with_point("head", 11.0, 12.0)
                    .with_point("tail", 30.0, 12.0)],
            ),
        ],
    }
}

fn write_video(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"not really a video").unwrap();
}

fn repairing() -> SchedulerOptions {
    SchedulerOptions {
        repair: true,
        ..SchedulerOptions::default()
    }
}

#[test]
fn test_existing_table_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    for name in ["a.mp4", "b.mp4", "c.mp4"] {
        write_video(&root.join(name));
    }
    let existing = root.join("b.csv");
    fs::write(&existing, "hand-edited table\n").unwrap();
    let mtime = fs::metadata(&existing).unwrap().modified().unwrap();

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let report = BatchScheduler::new(&model, &repairer, SchedulerOptions::default())
        .run(root)
        .unwrap();

    assert_eq!(model.called_names(), vec!["a.mp4", "c.mp4"]);
    assert_eq!(report.total(), 3);
    assert_eq!(report.predicted(), 2);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.videos[1].outcome, VideoOutcome::Skipped);

    assert_eq!(fs::read_to_string(&existing).unwrap(), "hand-edited table\n");
    assert_eq!(fs::metadata(&existing).unwrap().modified().unwrap(), mtime);
    assert!(root.join("a.csv").is_file());
    assert!(root.join("a.poses.json").is_file());
    assert!(root.join("c.csv").is_file());
}

#[test]
fn test_second_run_does_no_work() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("a.mp4"));
    write_video(&root.join("broken_b.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let scheduler = BatchScheduler::new(&model, &repairer, repairing());
    scheduler.run(root).unwrap();
    let first_calls = model.calls.borrow().len();
    let table = fs::read(root.join("a.csv")).unwrap();

    // Repaired copies are not picked up as new inputs
    let report = scheduler.run(root).unwrap();
    assert_eq!(report.total(), 2);
    assert_eq!(report.skipped(), 2);
    assert_eq!(model.calls.borrow().len(), first_calls);
    assert_eq!(repairer.calls.get(), 1);
    assert_eq!(fs::read(root.join("a.csv")).unwrap(), table);
}

#[test]
fn test_overwrite_recomputes() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("a.mp4"));
    fs::write(root.join("a.csv"), "stale\n").unwrap();

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let options = SchedulerOptions {
        overwrite: true,
        ..SchedulerOptions::default()
    };
    let report = BatchScheduler::new(&model, &repairer, options)
        .run(root)
        .unwrap();

    assert_eq!(report.videos[0].outcome, VideoOutcome::Predicted { rows: 2 });
    let text = fs::read_to_string(root.join("a.csv")).unwrap();
    assert!(text.starts_with("video,video_height,video_width,frame_idx,instance_id,score,fps,"));
    assert_eq!(text.lines().count(), 3);
}

#[test]
fn test_repair_then_retry_succeeds() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let source = root.join("broken_A.mp4");
    write_video(&source);

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let report = BatchScheduler::new(&model, &repairer, repairing())
        .run(root)
        .unwrap();

    let fixed = root.join("fixed_videos").join("fixed_broken_A.mp4");
    assert_eq!(
        report.videos[0].outcome,
        VideoOutcome::Repaired {
            fixed_path: fixed.clone(),
            rows: 2
        }
    );
    assert_eq!(model.called_names(), vec!["broken_A.mp4", "fixed_broken_A.mp4"]);
    assert_eq!(repairer.calls.get(), 1);

    assert!(fixed.is_file());
    assert_eq!(fs::read(&source).unwrap(), b"not really a video");
    // Outputs are named after the original video
    assert!(root.join("broken_A.csv").is_file());
    assert!(root.join("broken_A.poses.json").is_file());
    assert_eq!(report.repaired(), 1);
}

#[test]
fn test_indexing_failure_without_repair_continues() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("broken_A.mp4"));
    write_video(&root.join("ok.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let report = BatchScheduler::new(&model, &repairer, SchedulerOptions::default())
        .run(root)
        .unwrap();

    assert!(matches!(
        report.videos[0].outcome,
        VideoOutcome::Failed(FailureReason::Indexing(_))
    ));
    assert_eq!(report.predicted(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(repairer.calls.get(), 0);
    assert!(!root.join("fixed_videos").exists());
    assert!(!root.join("broken_A.csv").exists());
    assert!(root.join("ok.csv").is_file());
}

#[test]
fn test_repair_process_failure_is_not_retried() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("broken_A.mp4"));
    write_video(&root.join("ok.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::failing();
    let report = BatchScheduler::new(&model, &repairer, repairing())
        .run(root)
        .unwrap();

    assert!(matches!(
        report.videos[0].outcome,
        VideoOutcome::Failed(FailureReason::RepairProcess(_))
    ));
    assert_eq!(model.called_names(), vec!["broken_A.mp4", "ok.mp4"]);
    assert_eq!(repairer.calls.get(), 1);
    assert_eq!(report.predicted(), 1);
    assert!(!root.join("broken_A.csv").exists());
}

#[test]
fn test_retry_indexing_failure_fails_video() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("hopeless.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let report = BatchScheduler::new(&model, &repairer, repairing())
        .run(root)
        .unwrap();

    assert!(matches!(
        report.videos[0].outcome,
        VideoOutcome::Failed(FailureReason::RetryIndexing(_))
    ));
    // Exactly one retry
    assert_eq!(model.called_names(), vec!["hopeless.mp4", "fixed_hopeless.mp4"]);
    assert!(!root.join("hopeless.csv").exists());
}

#[test]
fn test_other_model_error_aborts_batch() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    for name in ["a.mp4", "crash.mp4", "z.mp4"] {
        write_video(&root.join(name));
    }

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let err = BatchScheduler::new(&model, &repairer, repairing())
        .run(root)
        .unwrap_err();

    match err {
        BatchError::Aborted {
            video,
            completed,
            source,
        } => {
            assert_eq!(video, root.join("crash.mp4"));
            assert_eq!(completed, 1);
            assert!(matches!(*source, VideoError::Predict(PredictError::Failed { .. })));
        }
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(repairer.calls.get(), 0);
    assert!(root.join("a.csv").is_file());
    assert!(!root.join("z.csv").exists());
}

#[test]
fn test_missing_root_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let scheduler = BatchScheduler::new(&model, &repairer, SchedulerOptions::default());

    let err = scheduler.run(&temp_dir.path().join("nope")).unwrap_err();
    assert!(matches!(
        err,
        BatchError::Discovery(DiscoveryError::DirectoryNotFound(_))
    ));

    let err = scheduler.run(temp_dir.path()).unwrap_err();
    assert!(matches!(
        err,
        BatchError::Discovery(DiscoveryError::EmptyInputSet(_))
    ));
    assert!(model.calls.borrow().is_empty());
}

#[test]
fn test_detection_file_is_reflattened() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let video = root.join("a.mp4");
    write_video(&video);
    write_detection_file(&root.join("a.poses.json"), &detections(&video)).unwrap();

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let report = BatchScheduler::new(&model, &repairer, SchedulerOptions::default())
        .run(root)
        .unwrap();

    assert_eq!(report.videos[0].outcome, VideoOutcome::Reflattened { rows: 2 });
    assert!(model.calls.borrow().is_empty());
    let text = fs::read_to_string(root.join("a.csv")).unwrap();
    assert_eq!(text.lines().count(), 3);
}

#[test]
fn test_output_root_mirrors_layout() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("videos");
    let out = temp_dir.path().join("results");
    write_video(&root.join("day1").join("a.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let options = SchedulerOptions {
        output_root: Some(out.clone()),
        ..SchedulerOptions::default()
    };
    let report = BatchScheduler::new(&model, &repairer, options)
        .run(&root)
        .unwrap();

    assert_eq!(report.videos[0].table, out.join("day1").join("a.csv"));
    assert!(out.join("day1").join("a.csv").is_file());
    assert!(out.join("day1").join("a.poses.json").is_file());
    assert!(!root.join("day1").join("a.csv").exists());
}

#[test]
fn test_tracking_adds_track_column() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("a.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let options = SchedulerOptions {
        tracking: Some(TrackingConfig {
            max_instances: Some(1),
            ..TrackingConfig::default()
        }),
        ..SchedulerOptions::default()
    };
    BatchScheduler::new(&model, &repairer, options)
        .run(root)
        .unwrap();

    let text = fs::read_to_string(root.join("a.csv")).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].contains(",instance_id,track_id,score,"));
    assert_eq!(lines[1].split(',').nth(5), Some("1"));
    assert_eq!(lines[2].split(',').nth(5), Some("1"));
}

#[test]
fn test_invalid_tracking_config_fails_before_any_work() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("a.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let options = SchedulerOptions {
        tracking: Some(TrackingConfig {
            window: 0,
            ..TrackingConfig::default()
        }),
        ..SchedulerOptions::default()
    };
    let err = BatchScheduler::new(&model, &repairer, options)
        .run(root)
        .unwrap_err();

    assert!(matches!(err, BatchError::Tracking(_)));
    assert!(model.calls.borrow().is_empty());
}

#[test]
fn test_shared_stem_videos_get_separate_outputs() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("trial.MOV"));
    write_video(&root.join("trial.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let scheduler = BatchScheduler::new(&model, &repairer, SchedulerOptions::default());
    let report = scheduler.run(root).unwrap();

    assert_eq!(model.called_names(), vec!["trial.MOV", "trial.mp4"]);
    assert_eq!(report.predicted(), 2);
    assert_eq!(report.videos[0].table, root.join("trial.MOV.csv"));
    assert_eq!(report.videos[1].table, root.join("trial.mp4.csv"));
    assert!(root.join("trial.MOV.poses.json").is_file());
    assert!(root.join("trial.mp4.poses.json").is_file());
    assert!(!root.join("trial.csv").exists());

    // Each video is skipped on its own table
    let report = scheduler.run(root).unwrap();
    assert_eq!(report.skipped(), 2);
    assert_eq!(model.calls.borrow().len(), 2);
}

#[test]
fn test_truncated_detection_file_is_predicted_again() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("a.mp4"));
    write_video(&root.join("b.mp4"));
    // Left behind by an interrupted run
    fs::write(root.join("a.poses.json"), "{\"video\": {\"path\": ").unwrap();

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let report = BatchScheduler::new(&model, &repairer, SchedulerOptions::default())
        .run(root)
        .unwrap();

    assert_eq!(model.called_names(), vec!["a.mp4", "b.mp4"]);
    assert_eq!(report.videos[0].outcome, VideoOutcome::Predicted { rows: 2 });
    assert!(root.join("a.csv").is_file());
    assert!(root.join("b.csv").is_file());
    let saved = read_detection_file(&root.join("a.poses.json")).unwrap();
    assert_eq!(saved.instance_count(), 2);
}

#[test]
fn test_overlay_failure_is_recorded_and_retried_on_skip() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_video(&root.join("a.mp4"));

    let model = ScriptedModel::default();
    let repairer = CopyRepairer::new();
    let options = SchedulerOptions {
        render: Some(OverlayStyle::default()),
        ffmpeg: temp_dir.path().join("no-such-ffmpeg"),
        ..SchedulerOptions::default()
    };
    let scheduler = BatchScheduler::new(&model, &repairer, options);

    let report = scheduler.run(root).unwrap();
    assert_eq!(report.videos[0].outcome, VideoOutcome::Predicted { rows: 2 });
    assert!(matches!(report.videos[0].overlay, OverlayStatus::Failed(_)));
    assert_eq!(report.overlay_failures(), 1);
    assert!(root.join("a.csv").is_file());

    // The table is skipped but the missing overlay is attempted again
    let report = scheduler.run(root).unwrap();
    assert_eq!(report.videos[0].outcome, VideoOutcome::Skipped);
    assert!(matches!(report.videos[0].overlay, OverlayStatus::Failed(_)));
    assert_eq!(model.calls.borrow().len(), 1);

    // Once the overlay exists nothing is rendered
    let overlay = root.join("rendered_videos").join("a_tracks.mp4");
    fs::create_dir_all(overlay.parent().unwrap()).unwrap();
    fs::write(&overlay, b"rendered").unwrap();
    let report = scheduler.run(root).unwrap();
    assert_eq!(report.videos[0].overlay, OverlayStatus::NotRendered);
}
