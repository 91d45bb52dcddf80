/// Error types for the octree index and streaming engine
///
/// Budget exhaustion and slot exhaustion are not errors; they surface as
/// `Admission::Deferred` / `Admission::Rejected` and degrade to LOD rendering.
use std::path::{Path, PathBuf};

use crate::octree::{NodeId, NodeState};

/// Result type for octree operations
pub type OctreeResult<T> = Result<T, OctreeError>;

/// Errors that can occur while building, persisting or streaming an octree
#[derive(Debug, thiserror::Error)]
pub enum OctreeError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema mismatch in {}: expected {expected} values per star, found {found}", path.display())]
    SchemaMismatch {
        expected: usize,
        found: usize,
        path: PathBuf,
    },

    #[error("Corrupted data: {0}")]
    CorruptData(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Invalid values per star: {found} (minimum is {minimum})")]
    InvalidValuesPerStar { found: usize, minimum: usize },

    #[error("Record has {found} values but the dataset uses {expected} per star")]
    RecordWidth { expected: usize, found: usize },

    #[error("values_per_star must be set before records are inserted")]
    ValuesPerStarNotSet,

    #[error("Record width is locked at {current} values per star once records exist")]
    SchemaLocked { current: usize },

    #[error("Index is sealed after LOD slicing; no further inserts are accepted")]
    IndexSealed,

    #[error("Star at ({x}, {y}, {z}) lies outside the index bounds")]
    OutOfBounds { x: f32, y: f32, z: f32 },

    #[error("Payload of node {0} is not resident in memory")]
    PayloadUnavailable(NodeId),

    #[error("Unknown node id {0}")]
    UnknownNode(NodeId),

    #[error("Illegal state transition for node {node}: {from:?} -> {to:?}")]
    IllegalTransition {
        node: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error("Chunk slots are not initialized; call init_buffer_index_stack first")]
    SlotsNotInitialized,

    #[error("Failed to start fetch worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Attaches a path to raw IO errors
pub trait PersistenceErrorContext<T> {
    fn persistence_context(self, path: &Path) -> OctreeResult<T>;
}

impl<T> PersistenceErrorContext<T> for Result<T, std::io::Error> {
    fn persistence_context(self, path: &Path) -> OctreeResult<T> {
        self.map_err(|source| OctreeError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Create a corrupted data error
pub fn corrupted_data(reason: impl Into<String>) -> OctreeError {
    OctreeError::CorruptData(reason.into())
}

/// Create a version mismatch error
pub fn version_mismatch(expected: u32, found: u32) -> OctreeError {
    OctreeError::VersionMismatch { expected, found }
}
