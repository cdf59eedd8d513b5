/// Video discovery: finds candidate videos under a root directory
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File extensions treated as videos (compared case-insensitively)
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "m4v"];

/// Directory that receives re-encoded copies of unreadable videos
pub const FIXED_VIDEOS_DIR: &str = "fixed_videos";

/// Directory that receives rendered track overlays
pub const RENDERED_VIDEOS_DIR: &str = "rendered_videos";

/// Generated-output directories that are never searched
const RESERVED_DIRS: &[&str] = &[FIXED_VIDEOS_DIR, RENDERED_VIDEOS_DIR];

/// Extension of the flattened table
pub const TABLE_EXTENSION: &str = "csv";

/// Suffix of the persisted detection file
pub const DETECTION_SUFFIX: &str = "poses.json";

/// Batch-fatal discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Video directory does not exist or is not a directory: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("No video files ({}) found in {}", VIDEO_EXTENSIONS.join(", "), .0.display())]
    EmptyInputSet(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Check whether a path carries a known video extension
#[must_use]
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Check whether a directory name holds generated output
#[must_use]
pub fn is_reserved_dir(name: &str) -> bool {
    RESERVED_DIRS.contains(&name)
}

/// Recursively find all videos under `root`, sorted by full path
pub fn discover_videos(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(DiscoveryError::DirectoryNotFound(root.to_path_buf()));
    }

    let mut videos = Vec::new();
    collect_videos_recursive(root, &mut videos)?;

    if videos.is_empty() {
        return Err(DiscoveryError::EmptyInputSet(root.to_path_buf()));
    }

    videos.sort();
    info!("Found {} video(s) in {}", videos.len(), root.display());
    Ok(videos)
}

fn collect_videos_recursive(dir: &Path, videos: &mut Vec<PathBuf>) -> Result<()> {
    let io_err = |source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    };

    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        // file_type() does not follow symlinks, so linked directories cannot loop
        let file_type = entry.file_type().map_err(io_err)?;

        if file_type.is_dir() {
            let reserved = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_reserved_dir);
            if reserved {
                debug!("Skipping generated output directory {}", path.display());
                continue;
            }
            collect_videos_recursive(&path, videos)?;
        } else if is_video_file(&path) && path.is_file() {
            videos.push(path);
        }
    }

    Ok(())
}

/// One video scheduled for prediction, with its derived output paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTask {
    pub source_path: PathBuf,
    pub containing_directory: PathBuf,
    /// File name without extension
    pub base_name: String,
    pub output_directory: PathBuf,
    pub output_table_path: PathBuf,
    pub output_detection_path: PathBuf,
}

impl VideoTask {
    /// Derive a task for `source`, found under `root`.
    ///
    /// Without an `output_root` the outputs are written next to the video.
    /// With one, the video's directory relative to `root` is mirrored under it.
    #[must_use]
    pub fn new(source: &Path, root: &Path, output_root: Option<&Path>) -> Self {
        let base_name = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::with_base_name(source, root, output_root, base_name)
    }

    fn with_base_name(
        source: &Path,
        root: &Path,
        output_root: Option<&Path>,
        base_name: String,
    ) -> Self {
        let containing_directory = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let output_directory = match output_root {
            Some(out) => {
                let relative = containing_directory
                    .strip_prefix(root)
                    .unwrap_or_else(|_| Path::new(""));
                out.join(relative)
            }
            None => containing_directory.clone(),
        };

        let output_table_path =
            output_directory.join(format!("{base_name}.{TABLE_EXTENSION}"));
        let output_detection_path =
            output_directory.join(format!("{base_name}.{DETECTION_SUFFIX}"));

        Self {
            source_path: source.to_path_buf(),
            containing_directory,
            base_name,
            output_directory,
            output_table_path,
            output_detection_path,
        }
    }

    /// Original file name including extension
    #[must_use]
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `<dir>/fixed_videos`, the sibling area for repaired copies
    #[must_use]
    pub fn repair_directory(&self) -> PathBuf {
        self.containing_directory.join(FIXED_VIDEOS_DIR)
    }

    /// `<dir>/fixed_videos/fixed_<name>`
    #[must_use]
    pub fn repair_path(&self) -> PathBuf {
        self.repair_directory()
            .join(format!("fixed_{}", self.file_name()))
    }

    /// `<output>/rendered_videos/<base>_tracks.mp4`
    #[must_use]
    pub fn overlay_path(&self) -> PathBuf {
        self.output_directory
            .join(RENDERED_VIDEOS_DIR)
            .join(format!("{}_tracks.mp4", self.base_name))
    }
}

/// Derive one task per discovered video, keeping output names unique
///
/// Videos that would share a table (`trial.mp4` and `trial.MOV` in the same
/// output directory) are named by their full file name instead, giving
/// `trial.mp4.csv` and `trial.MOV.csv`. The comparison ignores case so the
/// names stay distinct on case-insensitive filesystems.
#[must_use]
pub fn plan_tasks(videos: &[PathBuf], root: &Path, output_root: Option<&Path>) -> Vec<VideoTask> {
    let tasks: Vec<VideoTask> = videos
        .iter()
        .map(|video| VideoTask::new(video, root, output_root))
        .collect();

    let mut owners: HashMap<String, usize> = HashMap::with_capacity(tasks.len());
    for task in &tasks {
        *owners.entry(table_key(task)).or_default() += 1;
    }

    tasks
        .into_iter()
        .map(|task| {
            if owners.get(&table_key(&task)).copied().unwrap_or(0) < 2 {
                return task;
            }
            let qualified = VideoTask::with_base_name(
                &task.source_path,
                root,
                output_root,
                task.file_name(),
            );
            warn!(
                "{} shares its name with another video, writing {}",
                task.source_path.display(),
                qualified.output_table_path.display()
            );
            qualified
        })
        .collect()
}

fn table_key(task: &VideoTask) -> String {
    task.output_table_path.to_string_lossy().to_lowercase()
}
