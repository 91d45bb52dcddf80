use std::sync::Arc;

use super::Aabb;
use crate::error::{OctreeError, OctreeResult};
use crate::streaming::SlotId;

/// Index of a node in the octree arena. The root is always 0.
pub type NodeId = u32;

pub const ROOT_NODE: NodeId = 0;

/// Residency state of a node's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Unloaded,
    PendingLoad,
    Resident,
    Evicting,
}

impl NodeState {
    /// Unloaded -> PendingLoad -> Resident -> Evicting -> Unloaded, plus the
    /// abort edge PendingLoad -> Unloaded for fetches that produced no data.
    pub fn can_transition_to(self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Unloaded, PendingLoad)
                | (PendingLoad, Resident)
                | (PendingLoad, Unloaded)
                | (Resident, Evicting)
                | (Evicting, Unloaded)
        )
    }
}

/// One node of the star octree
#[derive(Debug, Clone)]
pub struct OctreeNode {
    pub bounds: Aabb,
    pub depth: u32,
    pub parent: Option<NodeId>,
    pub children: Option<[NodeId; 8]>,

    /// Stars in the whole subtree; valid even while unloaded
    pub star_count: u64,

    /// Records in this node's own payload
    pub payload_len: u32,

    /// Present iff the node is Resident
    pub chunk_slot: Option<SlotId>,

    /// Always-resident coarse sample of the payload
    pub lod_slice: Arc<[f32]>,

    /// CPU copy of the payload while resident (or always, for in-memory trees)
    pub payload: Option<Arc<[f32]>>,

    /// Bumped every time new payload data is promoted
    pub generation: u32,

    /// Missing or corrupt payload file; render from the LOD slice only
    pub payload_broken: bool,

    pub(crate) state: NodeState,
    pub(crate) build_data: Vec<f32>,
}

impl OctreeNode {
    pub(crate) fn new(bounds: Aabb, depth: u32, parent: Option<NodeId>) -> Self {
        Self {
            bounds,
            depth,
            parent,
            children: None,
            star_count: 0,
            payload_len: 0,
            chunk_slot: None,
            lod_slice: Arc::from(Vec::new()),
            payload: None,
            generation: 0,
            payload_broken: false,
            state: NodeState::Unloaded,
            build_data: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_resident(&self) -> bool {
        self.state == NodeState::Resident
    }

    /// Stars in the LOD slice
    pub fn lod_star_count(&self, values_per_star: usize) -> u64 {
        if values_per_star == 0 {
            0
        } else {
            (self.lod_slice.len() / values_per_star) as u64
        }
    }

    /// Move to a new residency state, rejecting illegal edges
    pub(crate) fn transition(&mut self, id: NodeId, to: NodeState) -> OctreeResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(OctreeError::IllegalTransition {
                node: id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}
