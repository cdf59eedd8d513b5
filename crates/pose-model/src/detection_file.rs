//! Detection file persistence (`<video>.poses.json`)

use pose_batch_common::DetectionResult;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DetectionFileError {
    #[error("Failed to access detection file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed detection file {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode detection file {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load a detection result written by the predictor or by [`write_detection_file`]
pub fn read_detection_file(path: &Path) -> Result<DetectionResult, DetectionFileError> {
    let file = File::open(path).map_err(|source| DetectionFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let result: DetectionResult =
        serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            DetectionFileError::Decode {
                path: path.to_path_buf(),
                source,
            }
        })?;

    debug!(
        "Read {} frame(s) from {}",
        result.frames.len(),
        path.display()
    );
    Ok(result)
}

/// Persist a detection result as pretty-printed JSON, creating parent directories
///
/// The file is written to `<path>.partial` and renamed into place, so a reader
/// never sees a half-written detection file.
pub fn write_detection_file(
    path: &Path,
    result: &DetectionResult,
) -> Result<(), DetectionFileError> {
    let io_err = |source| DetectionFileError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut staged_name = path.as_os_str().to_os_string();
    staged_name.push(".partial");
    let staged = PathBuf::from(staged_name);

    let mut writer = BufWriter::new(File::create(&staged).map_err(io_err)?);
    serde_json::to_writer_pretty(&mut writer, result).map_err(|source| {
        DetectionFileError::Encode {
            path: path.to_path_buf(),
            source,
        }
    })?;
    writer.write_all(b"\n").map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    drop(writer);

    std::fs::rename(&staged, path).map_err(io_err)?;
    debug!("Wrote detections to {}", path.display());
    Ok(())
}
