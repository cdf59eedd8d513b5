//! Predictor backed by an external command

use crate::{read_detection_file, PoseModel, PredictError};
use pose_batch_common::DetectionResult;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

const VIDEO_PLACEHOLDER: &str = "{video}";
const OUTPUT_PLACEHOLDER: &str = "{output}";
const MODEL_PLACEHOLDER: &str = "{model}";

/// How to run the external predictor
///
/// The predictor must write a detection JSON file (see
/// [`DetectionResult`]) to the path substituted for `{output}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments; `{video}`, `{output}` and `{model}` are substituted
    pub args: Vec<String>,
    /// Directory holding the trained model, substituted for `{model}`
    pub model_dir: PathBuf,
    /// Substrings of stderr that identify a video indexing failure
    pub indexing_markers: Vec<String>,
    /// Exit code the predictor uses for indexing failures, if it has one
    pub indexing_exit_code: Option<i32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pose-predict"),
            args: vec![
                "--model".to_string(),
                MODEL_PLACEHOLDER.to_string(),
                "--output".to_string(),
                OUTPUT_PLACEHOLDER.to_string(),
                VIDEO_PLACEHOLDER.to_string(),
            ],
            model_dir: PathBuf::from("model"),
            indexing_markers: vec![
                "KeyError".to_string(),
                "Error while indexing".to_string(),
                "moov atom not found".to_string(),
                "Invalid data found when processing input".to_string(),
            ],
            indexing_exit_code: None,
        }
    }
}

/// Runs the configured predictor once per video
///
/// Built once per batch and shared read-only across all videos.
#[derive(Debug, Clone)]
pub struct ExternalPoseModel {
    config: ModelConfig,
}

impl ExternalPoseModel {
    #[must_use]
    pub fn new(config: ModelConfig) -> Self {
        info!(
            "Using predictor {} with model directory {}",
            config.program.display(),
            config.model_dir.display()
        );
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Expand the configured argument template for one invocation
    #[must_use]
    pub fn command_args(&self, video: &Path, output: &Path) -> Vec<OsString> {
        self.config
            .args
            .iter()
            .map(|arg| match arg.as_str() {
                // Whole-argument placeholders keep non UTF-8 paths intact
                VIDEO_PLACEHOLDER => video.as_os_str().to_os_string(),
                OUTPUT_PLACEHOLDER => output.as_os_str().to_os_string(),
                MODEL_PLACEHOLDER => self.config.model_dir.as_os_str().to_os_string(),
                _ => arg
                    .replace(VIDEO_PLACEHOLDER, &video.to_string_lossy())
                    .replace(OUTPUT_PLACEHOLDER, &output.to_string_lossy())
                    .replace(MODEL_PLACEHOLDER, &self.config.model_dir.to_string_lossy())
                    .into(),
            })
            .collect()
    }

    /// Decide whether a failed run was an indexing failure
    fn classify_failure(&self, video: &Path, code: Option<i32>, stderr: String) -> PredictError {
        let exit_matches = self
            .config
            .indexing_exit_code
            .is_some_and(|expected| code == Some(expected));
        let marker = self
            .config
            .indexing_markers
            .iter()
            .find(|m| !m.is_empty() && stderr.contains(m.as_str()));

        if exit_matches || marker.is_some() {
            let message = marker.map_or_else(
                || format!("predictor exited with indexing status {code:?}"),
                |m| last_line_containing(&stderr, m).to_string(),
            );
            return PredictError::Indexing {
                video: video.to_path_buf(),
                message,
            };
        }

        PredictError::Failed {
            video: video.to_path_buf(),
            code,
            stderr,
        }
    }
}

fn last_line_containing<'a>(text: &'a str, needle: &'a str) -> &'a str {
    text.lines()
        .rev()
        .find(|line| line.contains(needle))
        .map_or(needle, str::trim)
}

impl PoseModel for ExternalPoseModel {
    fn predict(&self, video: &Path) -> Result<DetectionResult, PredictError> {
        info!("Running inference on {}", video.display());

        let scratch = tempfile::Builder::new().prefix("pose-predict-").tempdir()?;
        let output = scratch.path().join("detections.json");

        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.command_args(video, &output));
        debug!("Predictor command: {:?}", cmd);

        let run = cmd.output().map_err(|source| PredictError::Launch {
            program: self.config.program.clone(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&run.stderr).into_owned();
        if !stderr.is_empty() {
            debug!("Predictor stderr: {}", stderr.trim_end());
        }

        if !run.status.success() {
            return Err(self.classify_failure(video, run.status.code(), stderr));
        }

        if !output.is_file() {
            return Err(PredictError::MissingOutput(output));
        }

        let result = read_detection_file(&output)?;
        result.validate().map_err(|source| PredictError::Invalid {
            video: video.to_path_buf(),
            source,
        })?;

        if result.instance_count() == 0 {
            warn!("No instances found in {}", video.display());
        } else {
            info!(
                "Predicted {} instance(s) over {} frame(s) in {}",
                result.instance_count(),
                result.frames.len(),
                video.display()
            );
        }

        Ok(result)
    }
}
