//! Flattening of nested pose detections into one row per (frame, instance)
//!
//! The column schema is derived once per video from its skeleton:
//!
//! ```text
//! video, video_height, video_width, frame_idx, instance_id, [track_id,] score, fps,
//! <node1>_x, <node1>_y, <node2>_x, <node2>_y, ...
//! ```
//!
//! Nodes that were not detected are written as empty cells, never as `0`, so a
//! real detection at the origin stays distinguishable from a missing one.

use pose_batch_common::{DetectionResult, Point, Skeleton, ValidationError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Fixed leading columns, in output order (the optional `track_id` follows `instance_id`)
pub const CONTEXT_COLUMNS: &[&str] = &[
    "video",
    "video_height",
    "video_width",
    "frame_idx",
    "instance_id",
];

/// Fixed columns between the identity block and the node coordinates
pub const SCORE_COLUMNS: &[&str] = &["score", "fps"];

pub const TRACK_COLUMN: &str = "track_id";

/// Errors from flattening or writing a table
#[derive(Debug, Error)]
pub enum FlattenError {
    #[error("Invalid skeleton: {0}")]
    Skeleton(#[from] ValidationError),

    #[error("Frame {frame_idx}, instance {instance}: node '{node}' is not in the table schema")]
    UnknownNode {
        frame_idx: u64,
        instance: usize,
        node: String,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to write table {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ordered column layout for one video's table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    nodes: Vec<String>,
    with_tracks: bool,
    columns: Vec<String>,
}

impl TableSchema {
    /// Build the schema from a skeleton's node list
    #[must_use]
    pub fn from_skeleton(skeleton: &Skeleton, with_tracks: bool) -> Self {
        let mut columns: Vec<String> =
            Vec::with_capacity(CONTEXT_COLUMNS.len() + 3 + skeleton.len() * 2);
        columns.extend(CONTEXT_COLUMNS.iter().map(|c| (*c).to_string()));
        if with_tracks {
            columns.push(TRACK_COLUMN.to_string());
        }
        columns.extend(SCORE_COLUMNS.iter().map(|c| (*c).to_string()));
        for node in &skeleton.nodes {
            columns.push(format!("{node}_x"));
            columns.push(format!("{node}_y"));
        }

        Self {
            nodes: skeleton.nodes.clone(),
            with_tracks,
            columns,
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    #[must_use]
    pub fn with_tracks(&self) -> bool {
        self.with_tracks
    }
}

/// One output row: a single instance in a single frame
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow {
    pub video: String,
    pub video_height: u32,
    pub video_width: u32,
    pub frame_idx: u64,
    /// 0-based position within the frame
    pub instance_id: usize,
    pub track_id: Option<u32>,
    pub score: f64,
    pub fps: f64,
    /// One entry per schema node, in schema order
    pub coordinates: Vec<Option<Point>>,
}

impl FlatRow {
    fn to_record(&self, schema: &TableSchema) -> Vec<String> {
        let mut record = Vec::with_capacity(schema.columns.len());
        record.push(self.video.clone());
        record.push(self.video_height.to_string());
        record.push(self.video_width.to_string());
        record.push(self.frame_idx.to_string());
        record.push(self.instance_id.to_string());
        if schema.with_tracks {
            record.push(self.track_id.map(|t| t.to_string()).unwrap_or_default());
        }
        record.push(self.score.to_string());
        record.push(self.fps.to_string());
        for point in &self.coordinates {
            match point {
                Some(p) => {
                    record.push(p.x.to_string());
                    record.push(p.y.to_string());
                }
                None => {
                    record.push(String::new());
                    record.push(String::new());
                }
            }
        }
        record
    }
}

/// A flattened detection result
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub schema: TableSchema,
    pub rows: Vec<FlatRow>,
}

/// Flatten a detection result, one row per instance per frame, in input order
pub fn flatten(result: &DetectionResult, with_tracks: bool) -> Result<Table, FlattenError> {
    result.skeleton.validate()?;
    let schema = TableSchema::from_skeleton(&result.skeleton, with_tracks);
    let video = result.video.path.display().to_string();

    let mut rows = Vec::with_capacity(result.instance_count());
    for frame in &result.frames {
        for (instance_id, instance) in frame.instances.iter().enumerate() {
            if let Some(node) = instance
                .points
                .keys()
                .find(|n| !result.skeleton.contains(n))
            {
                return Err(FlattenError::UnknownNode {
                    frame_idx: frame.frame_idx,
                    instance: instance_id,
                    node: node.clone(),
                });
            }

            rows.push(FlatRow {
                video: video.clone(),
                video_height: result.video.height,
                video_width: result.video.width,
                frame_idx: frame.frame_idx,
                instance_id,
                track_id: instance.track,
                score: instance.score,
                fps: result.video.fps,
                coordinates: schema.nodes.iter().map(|n| instance.point(n)).collect(),
            });
        }
    }

    debug!(
        "Flattened {} frame(s) into {} row(s)",
        result.frames.len(),
        rows.len()
    );
    Ok(Table { schema, rows })
}

/// Serialize a table as CSV (header row first)
pub fn write_csv<W: Write>(table: &Table, writer: W) -> Result<(), FlattenError> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(table.schema.columns())?;
    for row in &table.rows {
        wtr.write_record(row.to_record(&table.schema))?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Flatten `result` and write it to `path`, returning the number of rows
///
/// The table is staged next to the destination and renamed into place, so an
/// interrupted run never leaves a truncated table behind.
pub fn write_table(
    result: &DetectionResult,
    path: &Path,
    with_tracks: bool,
) -> Result<usize, FlattenError> {
    let table = flatten(result, with_tracks)?;
    let io_err = |source| FlattenError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut staged_name = path.as_os_str().to_os_string();
    staged_name.push(".partial");
    let staged = PathBuf::from(staged_name);

    let file = File::create(&staged).map_err(io_err)?;
    write_csv(&table, BufWriter::new(file))?;
    std::fs::rename(&staged, path).map_err(io_err)?;

    info!("Wrote {} row(s) to {}", table.rows.len(), path.display());
    Ok(table.rows.len())
}
