//! Pose model invocation
//!
//! The pose-estimation model is an opaque capability: given one video it returns
//! a [`DetectionResult`] or fails. The [`PoseModel`] trait is the seam the batch
//! scheduler depends on; [`ExternalPoseModel`] implements it by running a
//! configured predictor command that writes a detection JSON file.
//!
//! Exactly one failure class is recoverable: [`PredictError::Indexing`], raised
//! when the predictor cannot read or seek the video container. Every other
//! variant is treated as fatal by the scheduler.
//!
//! # Example
//! ```no_run
//! use pose_batch_model::{ExternalPoseModel, ModelConfig, PoseModel};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = ExternalPoseModel::new(ModelConfig::default());
//! let result = model.predict(Path::new("trials/knot_01.mp4"))?;
//! println!("{} frames, {} instances", result.frames.len(), result.instance_count());
//! # Ok(())
//! # }
//! ```

pub mod detection_file;
pub mod external;

pub use detection_file::{read_detection_file, write_detection_file, DetectionFileError};
pub use external::{ExternalPoseModel, ModelConfig};

use pose_batch_common::{DetectionResult, ValidationError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Something that turns a video into pose detections
pub trait PoseModel {
    /// Run inference on one video
    fn predict(&self, video: &Path) -> Result<DetectionResult, PredictError>;
}

impl<M: PoseModel + ?Sized> PoseModel for &M {
    fn predict(&self, video: &Path) -> Result<DetectionResult, PredictError> {
        (**self).predict(video)
    }
}

/// Error types for model invocation
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Error while indexing video {}: {message}", video.display())]
    Indexing { video: PathBuf, message: String },

    #[error("Failed to launch predictor {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Predictor failed on {} ({}): {stderr}", video.display(), exit_label(.code))]
    Failed {
        video: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Predictor produced no detection file at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error(transparent)]
    DetectionFile(#[from] DetectionFileError),

    #[error("Invalid detection result for {}: {source}", video.display())]
    Invalid {
        video: PathBuf,
        #[source]
        source: ValidationError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PredictError {
    /// True for the one failure class that video repair can fix
    #[must_use]
    pub fn is_indexing(&self) -> bool {
        matches!(self, PredictError::Indexing { .. })
    }
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit status {c}"))
}
