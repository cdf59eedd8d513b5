/// Common types for pose detection results
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

/// Structural problems in a detection result
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Skeleton is empty")]
    EmptySkeleton,

    #[error("Duplicate skeleton node: {0}")]
    DuplicateNode(String),

    #[error("Duplicate frame index: {0}")]
    DuplicateFrame(u64),

    #[error("Frame {frame_idx}, instance {instance}: node '{node}' is not part of the skeleton")]
    UnknownNode {
        frame_idx: u64,
        instance: usize,
        node: String,
    },
}

/// Pixel coordinate of a single node
///
/// Serialized as a two-element `[x, y]` array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point
    #[must_use]
    #[inline]
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [f64; 2] {
    fn from(point: Point) -> Self {
        [point.x, point.y]
    }
}

/// Ordered set of node names shared by every frame of one video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skeleton {
    pub nodes: Vec<String>,
}

impl Skeleton {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    /// Check that the node list is non-empty and free of duplicates
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.nodes.is_empty() {
            return Err(ValidationError::EmptySkeleton);
        }
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.as_str()) {
                return Err(ValidationError::DuplicateNode(node.clone()));
            }
        }
        Ok(())
    }
}

/// One detected subject within a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Detection confidence
    pub score: f64,
    /// Node coordinates; `None` (or a missing key) marks an undetected node
    #[serde(default)]
    pub points: BTreeMap<String, Option<Point>>,
    /// Identity across frames, set by the tracker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<u32>,
}

impl Instance {
    #[must_use]
    pub fn new(score: f64) -> Self {
        Self {
            score,
            points: BTreeMap::new(),
            track: None,
        }
    }

    /// Builder-style helper to set a node coordinate
    #[must_use]
    pub fn with_point(mut self, node: impl Into<String>, x: f64, y: f64) -> Self {
        self.points.insert(node.into(), Some(Point::new(x, y)));
        self
    }

    /// Builder-style helper to mark a node as explicitly absent
    #[must_use]
    pub fn with_absent(mut self, node: impl Into<String>) -> Self {
        self.points.insert(node.into(), None);
        self
    }

    /// Coordinate of `node`, if it was detected
    #[must_use]
    pub fn point(&self, node: &str) -> Option<Point> {
        self.points.get(node).copied().flatten()
    }

    /// Iterate over detected nodes only
    pub fn present_points(&self) -> impl Iterator<Item = (&str, Point)> {
        self.points
            .iter()
            .filter_map(|(name, p)| p.map(|p| (name.as_str(), p)))
    }
}

/// Detections for a single video frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_idx: u64,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Frame {
    #[must_use]
    pub fn new(frame_idx: u64, instances: Vec<Instance>) -> Self {
        Self {
            frame_idx,
            instances,
        }
    }
}

/// Source video identity and geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoContext {
    pub path: PathBuf,
    pub height: u32,
    pub width: u32,
    pub fps: f64,
}

/// Everything the model produced for one video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub video: VideoContext,
    pub skeleton: Skeleton,
    #[serde(default)]
    pub frames: Vec<Frame>,
}

impl DetectionResult {
    /// Total number of instances across all frames
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.frames.iter().map(|f| f.instances.len()).sum()
    }

    /// Check skeleton, frame uniqueness and that every instance node belongs to the skeleton
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.skeleton.validate()?;

        let known: HashSet<&str> = self.skeleton.nodes.iter().map(String::as_str).collect();
        let mut frames = HashSet::with_capacity(self.frames.len());

        for frame in &self.frames {
            if !frames.insert(frame.frame_idx) {
                return Err(ValidationError::DuplicateFrame(frame.frame_idx));
            }
            for (instance, inst) in frame.instances.iter().enumerate() {
                if let Some(node) = inst.points.keys().find(|n| !known.contains(n.as_str())) {
                    return Err(ValidationError::UnknownNode {
                        frame_idx: frame.frame_idx,
                        instance,
                        node: node.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
