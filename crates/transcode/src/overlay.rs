//! Track overlay rendering
//!
//! Every detected node is drawn as a small filled square, coloured by the
//! instance's track (or its position in the frame when untracked). The filter
//! graph holds one named `drawbox` per (slot, node) marker, so its size depends
//! on the skeleton and the number of identities, never on the video length.
//! A `sendcmd` file moves each marker as frames go by and parks it off screen
//! while its node is not detected.

use crate::{run_ffmpeg, FfmpegFailure};
use pose_batch_common::{DetectionResult, Instance};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Marker position used while a node is not visible
const HIDDEN: i64 = -10_000;

/// Errors from overlay rendering
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to execute {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg failed while rendering {}: {stderr}", output.display())]
    Failed { output: PathBuf, stderr: String },

    #[error("Cannot time overlay commands at {0} fps")]
    InvalidFrameRate(f64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Marker appearance
#[derive(Debug, Clone)]
pub struct OverlayStyle {
    /// Edge length of each node marker in pixels
    pub marker_size: u32,
    /// Marker opacity (0-1)
    pub opacity: f32,
    /// Colours cycled through by track
    pub palette: Vec<String>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            marker_size: 8,
            opacity: 0.9,
            palette: ["red", "lime", "cyan", "yellow", "magenta", "orange", "white"]
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
        }
    }
}

impl OverlayStyle {
    fn colour(&self, slot: usize) -> &str {
        if self.palette.is_empty() {
            return "red";
        }
        &self.palette[slot % self.palette.len()]
    }
}

/// Colour slot of an instance: track 1 and the first untracked instance share slot 0
fn slot_of(instance: &Instance, position: usize) -> usize {
    instance
        .track
        .map_or(position, |t| t.saturating_sub(1) as usize)
}

/// Filter graph and command file for one render
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayScript {
    /// Contents of the `-filter_script:v` file
    pub filter: String,
    /// Contents of the `sendcmd` command file
    pub commands: String,
    /// Number of `drawbox` filters in the graph
    pub markers: usize,
}

/// Build the filter graph and marker commands for `result`
///
/// `commands_path` is where the caller will store [`OverlayScript::commands`];
/// the filter graph refers to it. A result with no detected node yields the
/// `null` filter so the render still produces a plain copy.
pub fn build_overlay_script(
    result: &DetectionResult,
    style: &OverlayStyle,
    commands_path: &Path,
) -> Result<OverlayScript, RenderError> {
    let nodes = &result.skeleton.nodes;
    let slots = result
        .frames
        .iter()
        .flat_map(|f| f.instances.iter().enumerate())
        .filter(|(_, inst)| inst.present_points().next().is_some())
        .map(|(idx, inst)| slot_of(inst, idx) + 1)
        .max()
        .unwrap_or(0);

    if slots == 0 || nodes.is_empty() {
        return Ok(OverlayScript {
            filter: "null".to_string(),
            commands: String::new(),
            markers: 0,
        });
    }

    let fps = result.video.fps;
    if !(fps.is_finite() && fps > 0.0) {
        return Err(RenderError::InvalidFrameRate(fps));
    }

    let markers = slots * nodes.len();
    let mut filters = Vec::with_capacity(markers + 1);
    filters.push(format!("sendcmd=f={}", quote_filter_arg(commands_path)));
    for slot in 0..slots {
        let colour = style.colour(slot);
        for node_idx in 0..nodes.len() {
            filters.push(format!(
                "drawbox@m{marker}=x={HIDDEN}:y={HIDDEN}:w={size}:h={size}:color={colour}@{opacity}:t=fill",
                marker = slot * nodes.len() + node_idx,
                size = style.marker_size,
                opacity = style.opacity,
            ));
        }
    }

    let half = f64::from(style.marker_size) / 2.0;
    let mut shown: Vec<Option<(i64, i64)>> = vec![None; markers];
    let mut commands = String::new();
    let mut frames: Vec<_> = result.frames.iter().collect();
    frames.sort_by_key(|f| f.frame_idx);
    let mut previous: Option<u64> = None;

    for frame in frames {
        // Nothing was detected in skipped frames, so clear the markers there
        if previous.is_some_and(|p| frame.frame_idx > p + 1) {
            let target = vec![None; markers];
            push_changes(&mut commands, &mut shown, &target, previous.map_or(0, |p| p + 1), fps);
        }

        let mut target: Vec<Option<(i64, i64)>> = vec![None; markers];
        for (idx, instance) in frame.instances.iter().enumerate() {
            let slot = slot_of(instance, idx);
            for (node_idx, node) in nodes.iter().enumerate() {
                if let Some(point) = instance.point(node) {
                    target[slot * nodes.len() + node_idx] = Some((
                        (point.x - half).max(0.0).round() as i64,
                        (point.y - half).max(0.0).round() as i64,
                    ));
                }
            }
        }
        push_changes(&mut commands, &mut shown, &target, frame.frame_idx, fps);
        previous = Some(frame.frame_idx);
    }

    if let Some(last) = previous {
        let target = vec![None; markers];
        push_changes(&mut commands, &mut shown, &target, last + 1, fps);
    }

    Ok(OverlayScript {
        filter: filters.join(",\n"),
        commands,
        markers,
    })
}

/// Append one `sendcmd` line moving every marker whose position changes at `frame_idx`
fn push_changes(
    commands: &mut String,
    shown: &mut [Option<(i64, i64)>],
    target: &[Option<(i64, i64)>],
    frame_idx: u64,
    fps: f64,
) {
    let mut changes = Vec::new();
    for (marker, (current, wanted)) in shown.iter_mut().zip(target).enumerate() {
        if current == wanted {
            continue;
        }
        let (x, y) = wanted.unwrap_or((HIDDEN, HIDDEN));
        changes.push(format!("drawbox@m{marker} x {x}, drawbox@m{marker} y {y}"));
        *current = *wanted;
    }
    if changes.is_empty() {
        return;
    }

    // Half a frame early so rounding never lands the command after its frame
    let time = ((frame_idx as f64 - 0.5) / fps).max(0.0);
    commands.push_str(&format!("{time:.4} {};\n", changes.join(", ")));
}

/// Single-quote a path for use as a filter option value
fn quote_filter_arg(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Render `result` on top of its source video into `output`
pub fn render_overlay(
    ffmpeg: &Path,
    video: &Path,
    result: &DetectionResult,
    output: &Path,
    style: &OverlayStyle,
) -> Result<(), RenderError> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let scratch = tempfile::Builder::new().prefix("pose-overlay-").tempdir()?;
    let commands_path = scratch.path().join("commands.txt");
    let filter_path = scratch.path().join("filter.txt");

    let script = build_overlay_script(result, style, &commands_path)?;
    std::fs::write(&commands_path, &script.commands)?;
    std::fs::write(&filter_path, &script.filter)?;

    debug!(
        "Overlay for {} uses {} marker(s), {} command byte(s)",
        video.display(),
        script.markers,
        script.commands.len()
    );

    let args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video.into(),
        "-filter_script:v".into(),
        filter_path.into(),
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-preset".into(),
        "superfast".into(),
        "-an".into(),
        output.into(),
    ];

    run_ffmpeg(ffmpeg, &args).map_err(|failure| match failure {
        FfmpegFailure::Launch(err) => RenderError::Launch {
            program: ffmpeg.to_path_buf(),
            source: err,
        },
        FfmpegFailure::Exit { stderr, .. } => RenderError::Failed {
            output: output.to_path_buf(),
            stderr,
        },
    })?;

    info!("Rendered track overlay to {}", output.display());
    Ok(())
}
