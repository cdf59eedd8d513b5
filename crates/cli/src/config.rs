//! Pipeline configuration file

use anyhow::{Context as _, Result};
use pose_batch_model::ModelConfig;
use pose_batch_tracking::TrackingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Used when `--config` is not given, if present in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "pose-batch.yaml";

/// Contents of the YAML config; every key is optional
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    /// ffmpeg binary used for repair and overlay rendering
    pub ffmpeg: PathBuf,
    pub tracking: TrackingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            ffmpeg: PathBuf::from("ffmpeg"),
            tracking: TrackingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(yaml_path: impl AsRef<Path>) -> Result<Self> {
        let yaml_path = yaml_path.as_ref();
        let contents = std::fs::read_to_string(yaml_path)
            .with_context(|| format!("Failed to read config {}", yaml_path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("Failed to parse YAML config {}", yaml_path.display()))
    }

    fn parse(contents: &str) -> Result<Self> {
        // An empty file is a valid, all-defaults config
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load the explicit config, or the default file if it exists, or defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => {
                info!("Loading config from {}", path.display());
                Self::from_yaml(path)
            }
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                info!("Loading config from {}", DEFAULT_CONFIG_FILE);
                Self::from_yaml(DEFAULT_CONFIG_FILE)
            }
            None => {
                debug!("No config file, using defaults");
                Ok(Self::default())
            }
        }
    }
}
