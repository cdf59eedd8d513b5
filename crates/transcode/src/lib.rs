//! FFmpeg-backed video transcoding
//!
//! Two jobs are run through the `ffmpeg` binary:
//! - [`repair`]: re-encode a video whose container the pose model cannot index,
//!   using one fixed H.264 profile so every repaired copy is produced the same way
//! - [`overlay`]: render detected nodes on top of the source video, coloured per track
//!
//! # Example
//! ```no_run
//! use pose_batch_transcode::{FfmpegRepairer, VideoRepairer};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repairer = FfmpegRepairer::default();
//! repairer.repair(
//!     Path::new("trials/knot_01.mp4"),
//!     Path::new("trials/fixed_videos/fixed_knot_01.mp4"),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod overlay;
pub mod repair;

pub use overlay::{build_overlay_script, render_overlay, OverlayScript, OverlayStyle, RenderError};
pub use repair::{repair_args, FfmpegRepairer, RepairError, VideoRepairer};

use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Number of trailing stderr lines kept in error messages
const STDERR_TAIL_LINES: usize = 8;

/// How an ffmpeg invocation went wrong
#[derive(Debug)]
pub(crate) enum FfmpegFailure {
    Launch(std::io::Error),
    Exit { code: Option<i32>, stderr: String },
}

/// Run an ffmpeg binary with the given arguments, capturing its output
pub(crate) fn run_ffmpeg(program: &Path, args: &[std::ffi::OsString]) -> Result<(), FfmpegFailure> {
    let mut cmd = Command::new(program);
    cmd.args(args);

    debug!("FFmpeg command: {:?}", cmd);

    let output = cmd.output().map_err(FfmpegFailure::Launch)?;

    if !output.status.success() {
        return Err(FfmpegFailure::Exit {
            code: output.status.code(),
            stderr: stderr_tail(&String::from_utf8_lossy(&output.stderr)),
        });
    }
    Ok(())
}

/// Keep only the last few lines of ffmpeg's (very chatty) stderr
pub(crate) fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
