//! Identity tracking for pose instances across frames
//!
//! Instances in consecutive frames are linked by the mean distance between
//! their shared nodes. Each track remembers the last position of every node it
//! has seen; a track only competes for new instances while it was last seen
//! within the lookback window.
//!
//! # Features
//! - Greedy matching, closest pair first
//! - Bounded lookback window so stale tracks do not steal new subjects
//! - Optional cap on the number of identities (expected animal count)
//! - Only `Instance::track` is written; scores, coordinates and order are untouched
//!
//! # Example
//! ```no_run
//! use pose_batch_tracking::{assign_tracks, TrackingConfig};
//! # fn run(result: &mut pose_batch_common::DetectionResult) -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrackingConfig { max_instances: Some(2), ..Default::default() };
//! let summary = assign_tracks(result, &config)?;
//! println!("{} identities", summary.tracks);
//! # Ok(())
//! # }
//! ```

use pose_batch_common::{DetectionResult, Frame, Instance, Point};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Tracking errors
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Tracking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Frames a track stays eligible for matching after it was last seen (default: 5)
    pub window: u64,
    /// Largest mean node distance, in pixels, accepted as the same subject (default: 100)
    pub max_distance: f64,
    /// Maximum number of identities; `None` opens a new track for every unmatched instance
    pub max_instances: Option<usize>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            window: 5,
            max_distance: 100.0,
            max_instances: None,
        }
    }
}

impl TrackingConfig {
    fn validate(&self) -> Result<(), TrackingError> {
        if self.window == 0 {
            return Err(TrackingError::InvalidConfig(
                "window must be at least 1 frame".to_string(),
            ));
        }
        if !(self.max_distance.is_finite() && self.max_distance > 0.0) {
            return Err(TrackingError::InvalidConfig(format!(
                "max_distance must be positive, got {}",
                self.max_distance
            )));
        }
        if self.max_instances == Some(0) {
            return Err(TrackingError::InvalidConfig(
                "max_instances must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A single identity followed across frames
#[derive(Debug, Clone)]
struct TrackedSubject {
    id: u32,
    last_frame: u64,
    /// Last known position of every node this subject has shown
    points: BTreeMap<String, Point>,
}

impl TrackedSubject {
    fn new(id: u32, frame_idx: u64) -> Self {
        Self {
            id,
            last_frame: frame_idx,
            points: BTreeMap::new(),
        }
    }

    fn update(&mut self, frame_idx: u64, instance: &Instance) {
        for (node, point) in instance.present_points() {
            self.points.insert(node.to_string(), point);
        }
        self.last_frame = frame_idx;
    }

    /// Mean distance over the nodes both sides know; `None` if they share none
    fn distance(&self, instance: &Instance) -> Option<f64> {
        let (sum, count) = instance
            .present_points()
            .filter_map(|(node, point)| self.points.get(node).map(|p| p.distance(&point)))
            .fold((0.0, 0usize), |(sum, count), d| (sum + d, count + 1));

        (count > 0).then(|| sum / count as f64)
    }

    fn frames_since_seen(&self, frame_idx: u64) -> u64 {
        frame_idx.saturating_sub(self.last_frame)
    }
}

/// Pose tracker state
pub struct PoseTracker {
    config: TrackingConfig,
    subjects: Vec<TrackedSubject>,
    next_id: u32,
}

impl PoseTracker {
    /// Create a new tracker
    pub fn new(config: TrackingConfig) -> Result<Self, TrackingError> {
        config.validate()?;
        info!("Creating pose tracker with config: {:?}", config);
        Ok(Self {
            config,
            subjects: Vec::with_capacity(8),
            next_id: 1,
        })
    }

    /// Number of identities created so far
    #[must_use]
    pub fn track_count(&self) -> usize {
        self.subjects.len()
    }

    /// Assign identities to the instances of the next frame
    ///
    /// Returns one entry per instance, in instance order. Frames must be fed in
    /// increasing `frame_idx` order.
    pub fn update(&mut self, frame: &Frame) -> Vec<Option<u32>> {
        let instances = &frame.instances;
        let mut assigned: Vec<Option<usize>> = vec![None; instances.len()];
        let mut subject_taken = vec![false; self.subjects.len()];

        // Pass 1: subjects seen within the window, closest pair first
        let costs: Vec<Vec<Option<f64>>> = self
            .subjects
            .iter()
            .map(|s| {
                let eligible = s.frames_since_seen(frame.frame_idx) <= self.config.window;
                instances
                    .iter()
                    .map(|inst| s.distance(inst).filter(|_| eligible))
                    .collect()
            })
            .collect();
        for (s_idx, i_idx) in greedy_match(&costs, &subject_taken, &assigned, self.config.max_distance) {
            subject_taken[s_idx] = true;
            assigned[i_idx] = Some(s_idx);
        }

        // Pass 2: open new identities while below capacity
        for i_idx in 0..instances.len() {
            if assigned[i_idx].is_some() || self.at_capacity() {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            debug!("Frame {}: new track {}", frame.frame_idx, id);
            self.subjects.push(TrackedSubject::new(id, frame.frame_idx));
            subject_taken.push(true);
            assigned[i_idx] = Some(self.subjects.len() - 1);
        }

        // Pass 3: at capacity, leftovers take the nearest free subject regardless of window
        if assigned.iter().any(Option::is_none) {
            let costs: Vec<Vec<Option<f64>>> = self
                .subjects
                .iter()
                .map(|s| {
                    instances
                        .iter()
                        .map(|inst| Some(s.distance(inst).unwrap_or(f64::MAX)))
                        .collect()
                })
                .collect();
            for (s_idx, i_idx) in greedy_match(&costs, &subject_taken, &assigned, f64::INFINITY) {
                subject_taken[s_idx] = true;
                assigned[i_idx] = Some(s_idx);
            }
        }

        let mut ids = Vec::with_capacity(instances.len());
        for (i_idx, slot) in assigned.iter().enumerate() {
            match slot {
                Some(s_idx) => {
                    let subject = &mut self.subjects[*s_idx];
                    subject.update(frame.frame_idx, &instances[i_idx]);
                    ids.push(Some(subject.id));
                }
                None => {
                    debug!(
                        "Frame {}: instance {} left without identity",
                        frame.frame_idx, i_idx
                    );
                    ids.push(None);
                }
            }
        }
        ids
    }

    fn at_capacity(&self) -> bool {
        self.config
            .max_instances
            .is_some_and(|max| self.subjects.len() >= max)
    }
}

/// Greedy matching (lowest cost first) between free subjects and free instances
///
/// `costs[s][i]` is `None` when the pair may not be matched.
fn greedy_match(
    costs: &[Vec<Option<f64>>],
    subject_taken: &[bool],
    assigned: &[Option<usize>],
    limit: f64,
) -> Vec<(usize, usize)> {
    let mut subject_used = subject_taken.to_vec();
    let mut instance_used: Vec<bool> = assigned.iter().map(Option::is_some).collect();
    let mut matches = Vec::new();

    loop {
        let mut best_cost = limit;
        let mut best_match: Option<(usize, usize)> = None;

        for (s_idx, row) in costs.iter().enumerate() {
            if subject_used[s_idx] {
                continue;
            }
            for (i_idx, cost) in row.iter().enumerate() {
                if instance_used[i_idx] {
                    continue;
                }
                if let Some(cost) = *cost {
                    if cost <= best_cost && best_match.map_or(true, |_| cost < best_cost) {
                        best_cost = cost;
                        best_match = Some((s_idx, i_idx));
                    }
                }
            }
        }

        match best_match {
            Some((s_idx, i_idx)) => {
                matches.push((s_idx, i_idx));
                subject_used[s_idx] = true;
                instance_used[i_idx] = true;
            }
            None => break,
        }
    }

    matches
}

/// Outcome of tracking one video
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingSummary {
    /// Identities created
    pub tracks: usize,
    /// Instances that received an identity
    pub assigned: usize,
    /// Instances left without one (more subjects than `max_instances`)
    pub unassigned: usize,
}

/// Run the tracker over every frame of `result`, writing `Instance::track`
pub fn assign_tracks(
    result: &mut DetectionResult,
    config: &TrackingConfig,
) -> Result<TrackingSummary, TrackingError> {
    let mut tracker = PoseTracker::new(config.clone())?;
    let mut assigned = 0;
    let mut unassigned = 0;

    for frame in &mut result.frames {
        let ids = tracker.update(frame);
        for (instance, id) in frame.instances.iter_mut().zip(ids) {
            instance.track = id;
            if id.is_some() {
                assigned += 1;
            } else {
                unassigned += 1;
            }
        }
    }

    let summary = TrackingSummary {
        tracks: tracker.track_count(),
        assigned,
        unassigned,
    };
    info!(
        "Tracking {}: {} track(s), {} assigned, {} unassigned",
        result.video.path.display(),
        summary.tracks,
        summary.assigned,
        summary.unassigned
    );
    Ok(summary)
}
