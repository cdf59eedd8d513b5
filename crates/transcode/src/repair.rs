//! Re-encoding of videos that the pose model fails to index

use crate::{run_ffmpeg, FfmpegFailure};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Fixed repair profile: H.264, 8-bit 4:2:0, superfast preset, CRF 23
const REPAIR_PROFILE: &[&str] = &[
    "-c:v",
    "libx264",
    "-pix_fmt",
    "yuv420p",
    "-preset",
    "superfast",
    "-crf",
    "23",
];

/// Errors from the repair process
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("Video to repair not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Failed to execute {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg exited with {} while repairing {}: {stderr}", exit_label(.code), source_video.display())]
    Failed {
        source_video: PathBuf,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("status {c}"))
}

/// Produces a playable copy of a video at a new location
pub trait VideoRepairer {
    /// Re-encode `source` into `destination`; `source` is never modified
    fn repair(&self, source: &Path, destination: &Path) -> Result<(), RepairError>;
}

/// Build the ffmpeg argument list for a repair
#[must_use]
pub fn repair_args(source: &Path, destination: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::with_capacity(REPAIR_PROFILE.len() + 4);
    args.push("-y".into()); // overwrite a stale copy from an earlier run
    args.push("-i".into());
    args.push(source.into());
    args.extend(REPAIR_PROFILE.iter().map(OsString::from));
    args.push(destination.into());
    args
}

/// Repairer backed by the `ffmpeg` command line tool
#[derive(Debug, Clone)]
pub struct FfmpegRepairer {
    ffmpeg: PathBuf,
}

impl FfmpegRepairer {
    /// Use a specific ffmpeg binary
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.ffmpeg
    }
}

impl Default for FfmpegRepairer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl VideoRepairer for FfmpegRepairer {
    fn repair(&self, source: &Path, destination: &Path) -> Result<(), RepairError> {
        if !source.is_file() {
            return Err(RepairError::SourceNotFound(source.to_path_buf()));
        }

        info!(
            "Re-encoding {} -> {}",
            source.display(),
            destination.display()
        );

        run_ffmpeg(&self.ffmpeg, &repair_args(source, destination)).map_err(|failure| {
            match failure {
                FfmpegFailure::Launch(err) => RepairError::Launch {
                    program: self.ffmpeg.clone(),
                    source: err,
                },
                FfmpegFailure::Exit { code, stderr } => RepairError::Failed {
                    source_video: source.to_path_buf(),
                    code,
                    stderr,
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_repair_args_are_fixed() {
        let args = repair_args(Path::new("in/a.mp4"), Path::new("out/fixed_a.mp4"));
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            args,
            vec![
                "-y",
                "-i",
                "in/a.mp4",
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-preset",
                "superfast",
                "-crf",
                "23",
                "out/fixed_a.mp4",
            ]
        );
    }

    #[test]
    fn test_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("missing.mp4");
        let err = FfmpegRepairer::default()
            .repair(&source, &temp_dir.path().join("fixed.mp4"))
            .unwrap_err();
        assert!(matches!(err, RepairError::SourceNotFound(p) if p == source));
    }

    #[test]
    fn test_missing_binary_is_launch_error() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.mp4");
        std::fs::write(&source, b"x").unwrap();

        let repairer = FfmpegRepairer::new(temp_dir.path().join("no-such-ffmpeg"));
        let err = repairer
            .repair(&source, &temp_dir.path().join("fixed_a.mp4"))
            .unwrap_err();
        assert!(matches!(err, RepairError::Launch { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_failure() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.mp4");
        std::fs::write(&source, b"x").unwrap();

        // `false` ignores its arguments and exits 1
        let repairer = FfmpegRepairer::new("false");
        let err = repairer
            .repair(&source, &temp_dir.path().join("fixed_a.mp4"))
            .unwrap_err();
        assert!(matches!(err, RepairError::Failed { code: Some(1), .. }));
        // Source left untouched
        assert_eq!(std::fs::read(&source).unwrap(), b"x");
    }
}
