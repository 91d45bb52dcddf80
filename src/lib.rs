//! Octree streaming engine for large star catalogs
//!
//! Stars are bucketed into a sparse octree whose nodes carry a small LOD
//! slice that always stays in memory. Full node payloads are streamed from
//! disk into a fixed pool of renderer chunk slots, under CPU and GPU memory
//! budgets, as the camera moves.

pub mod config;
pub mod error;
pub mod octree;
pub mod persistence;
pub mod streaming;

pub use config::{AdditionalLayers, StreamingConfig};
pub use error::{OctreeError, OctreeResult};
pub use octree::{Aabb, NodeId, NodeState, OctreeNode, SpatialIndex, StarRecord, StarSchema, ROOT_NODE};
pub use persistence::PayloadLayout;
pub use streaming::{
    BudgetTelemetry, FixedMemoryProbe, HostMemoryProbe, MemoryProbe, PrefetchReport, RenderItem,
    RenderSource, SlotDiscipline, SlotId, StreamingContext, TraversalOutput,
};
