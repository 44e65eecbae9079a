//! Error types for the map store and the line extraction pipeline.

use thiserror::Error;

use crate::atlas::map::{KeyFrameId, MapId};

/// Errors raised by the map store and the atlas.
#[derive(Error, Debug)]
pub enum MapError {
    /// Live keyframes without a path to any origin keyframe.
    #[error("essential graph is disconnected: {} keyframe(s) unreachable from the origin ({keyframes:?})", keyframes.len())]
    DisconnectedKeyFrames { keyframes: Vec<KeyFrameId> },

    #[error("essential graph has no origin keyframe")]
    MissingOrigin,

    /// Two live entities of the same kind were given the same id.
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: u64 },

    #[error("map id {0} is already used by another map")]
    MapIdCollision(MapId),

    #[error("no map with id {0}")]
    UnknownMap(MapId),

    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedSnapshotVersion { found: u32, expected: u32 },

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding failed: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Errors raised by the line extraction pipeline.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("input image is empty ({rows}x{cols})")]
    EmptyImage { rows: i32, cols: i32 },

    /// Instance mask buffer length does not match `rows * cols * labels`.
    #[error("instance mask buffer has {actual} bytes, expected {expected} ({labels} labels of {rows}x{cols})")]
    MaskSizeMismatch {
        expected: usize,
        actual: usize,
        labels: usize,
        rows: usize,
        cols: usize,
    },

    #[error("{what} count {actual} does not match label count {labels}")]
    LabelCountMismatch {
        what: &'static str,
        actual: usize,
        labels: usize,
    },

    #[error("region-of-interest mask is {rows}x{cols}, image is {image_rows}x{image_cols}")]
    RoiSizeMismatch {
        rows: i32,
        cols: i32,
        image_rows: i32,
        image_cols: i32,
    },

    #[error("invalid line extractor configuration: {0}")]
    InvalidConfig(String),

    #[error("backend returned {descriptors} descriptor rows for {lines} lines")]
    DescriptorCountMismatch { lines: usize, descriptors: usize },

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}
