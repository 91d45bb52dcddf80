/// Hierarchical spatial index over a star catalog
///
/// The octree is an arena of nodes addressed by `NodeId`. Children are
/// created lazily when a leaf overflows `max_stars_per_node`, and always get
/// larger ids than their parent, so a reverse scan of the arena visits
/// children before parents.
///
/// Building is a two step affair: `insert` every record, then call
/// `slice_lod_data` once to produce inner-node payloads and LOD slices.
/// The index is sealed afterwards.
mod bounds;
mod lod;
mod node;
mod record;

pub use bounds::Aabb;
pub use node::{NodeId, NodeState, OctreeNode, ROOT_NODE};
pub use record::{
    position_of, StarRecord, StarSchema, CANONICAL_VALUES_PER_STAR, COLOR_OFFSET,
    MAGNITUDE_OFFSET, POSITION_OFFSET, SPEED_OFFSET, VELOCITY_OFFSET,
};

use std::path::Path;

use glam::Vec3;

use crate::config::StreamingConfig;
use crate::error::{corrupted_data, OctreeError, OctreeResult};
use crate::persistence::{self, PayloadLayout};

/// Octree over the bounding volume of a star dataset
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    nodes: Vec<OctreeNode>,
    values_per_star: usize,
    max_stars_per_node: u32,
    max_depth: u32,
    lod_stride: u32,
    total_stars: u64,
    sealed: bool,
}

impl SpatialIndex {
    /// Create an empty index whose root cube is taken from the config
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            nodes: vec![OctreeNode::new(
                Aabb::cube(config.root_half_extent),
                0,
                None,
            )],
            values_per_star: 0,
            max_stars_per_node: config.max_stars_per_node,
            max_depth: config.max_depth,
            lod_stride: config.lod_stride.max(1),
            total_stars: 0,
            sealed: false,
        }
    }

    /// Reassemble a sealed index from persisted parts
    pub(crate) fn from_parts(
        nodes: Vec<OctreeNode>,
        values_per_star: usize,
        max_stars_per_node: u32,
        max_depth: u32,
        lod_stride: u32,
    ) -> OctreeResult<Self> {
        let total_stars = nodes
            .first()
            .map(|root| root.star_count)
            .ok_or_else(|| corrupted_data("structure has no root node"))?;
        let index = Self {
            nodes,
            values_per_star,
            max_stars_per_node,
            max_depth,
            lod_stride: lod_stride.max(1),
            total_stars,
            sealed: true,
        };
        index.check_invariants()?;
        Ok(index)
    }

    /// Fix the record width. Must happen before the first insert.
    pub fn set_values_per_star(&mut self, values_per_star: usize) -> OctreeResult<()> {
        if values_per_star < CANONICAL_VALUES_PER_STAR {
            return Err(OctreeError::InvalidValuesPerStar {
                found: values_per_star,
                minimum: CANONICAL_VALUES_PER_STAR,
            });
        }
        if (self.total_stars > 0 || self.sealed) && values_per_star != self.values_per_star {
            return Err(OctreeError::SchemaLocked {
                current: self.values_per_star,
            });
        }
        self.values_per_star = values_per_star;
        Ok(())
    }

    /// Add one record during bulk construction
    pub fn insert(&mut self, record: &StarRecord) -> OctreeResult<()> {
        let mut row = Vec::with_capacity(record.width());
        record.write_values(&mut row);
        self.insert_values(&row)
    }

    /// Add one already-flattened row in canonical column order
    pub fn insert_values(&mut self, row: &[f32]) -> OctreeResult<()> {
        if self.sealed {
            return Err(OctreeError::IndexSealed);
        }
        if self.values_per_star == 0 {
            return Err(OctreeError::ValuesPerStarNotSet);
        }
        if row.len() != self.values_per_star {
            return Err(OctreeError::RecordWidth {
                expected: self.values_per_star,
                found: row.len(),
            });
        }

        let position = position_of(row);
        if !self.nodes[ROOT_NODE as usize].bounds.contains(position) {
            return Err(OctreeError::OutOfBounds {
                x: position.x,
                y: position.y,
                z: position.z,
            });
        }

        let mut id = ROOT_NODE;
        loop {
            let node = &mut self.nodes[id as usize];
            node.star_count += 1;
            match node.children {
                Some(children) => {
                    id = children[node.bounds.octant_of(position)];
                }
                None => {
                    node.build_data.extend_from_slice(row);
                    break;
                }
            }
        }
        self.total_stars += 1;

        if self.leaf_overflows(id) {
            self.split(id);
        }
        Ok(())
    }

    fn leaf_overflows(&self, id: NodeId) -> bool {
        let node = &self.nodes[id as usize];
        node.is_leaf()
            && node.depth < self.max_depth
            && node.build_data.len() / self.values_per_star > self.max_stars_per_node as usize
    }

    /// Split an overflowing leaf, cascading while all stars land in one octant
    fn split(&mut self, id: NodeId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            if !self.leaf_overflows(id) {
                continue;
            }
            let first_child = self.nodes.len() as NodeId;
            let (bounds, depth, data) = {
                let node = &mut self.nodes[id as usize];
                (node.bounds, node.depth, std::mem::take(&mut node.build_data))
            };

            let mut children = [0; 8];
            for (octant, child) in children.iter_mut().enumerate() {
                *child = first_child + octant as NodeId;
                self.nodes
                    .push(OctreeNode::new(bounds.octant(octant), depth + 1, Some(id)));
            }

            for row in data.chunks_exact(self.values_per_star) {
                let octant = bounds.octant_of(position_of(row));
                let child = &mut self.nodes[children[octant] as usize];
                child.build_data.extend_from_slice(row);
                child.star_count += 1;
            }
            self.nodes[id as usize].children = Some(children);
            work.extend(children);
        }
    }

    /// Produce inner-node payloads and LOD slices, then seal the index
    pub fn slice_lod_data(&mut self) -> OctreeResult<()> {
        if self.values_per_star == 0 {
            return Err(OctreeError::ValuesPerStarNotSet);
        }
        if self.sealed {
            return Ok(());
        }
        lod::slice_lod_data(
            &mut self.nodes,
            self.values_per_star,
            self.max_stars_per_node as usize,
            self.lod_stride as usize,
        );
        self.sealed = true;
        log::info!(
            "[SpatialIndex::slice_lod_data] Sliced {} nodes holding {} stars",
            self.nodes.len(),
            self.total_stars
        );
        Ok(())
    }

    /// Persist the index; see `persistence` for the file layout
    pub fn write_to_file(&self, path: impl AsRef<Path>, layout: PayloadLayout) -> OctreeResult<()> {
        persistence::write_index(self, path.as_ref(), layout)
    }

    /// Restore an index written by `write_to_file`
    pub fn read_from_file(
        path: impl AsRef<Path>,
        config: &StreamingConfig,
    ) -> OctreeResult<(Self, PayloadLayout)> {
        persistence::read_index(path.as_ref(), config)
    }

    /// Sum of child counts must equal the parent's count
    pub fn check_invariants(&self) -> OctreeResult<()> {
        for (id, node) in self.nodes.iter().enumerate() {
            let Some(children) = node.children else {
                continue;
            };
            let mut sum = 0u64;
            for child in children {
                let child_node = self
                    .nodes
                    .get(child as usize)
                    .ok_or_else(|| corrupted_data(format!("node {} has missing child {}", id, child)))?;
                if child_node.parent != Some(id as NodeId) {
                    return Err(corrupted_data(format!(
                        "child {} does not point back to parent {}",
                        child, id
                    )));
                }
                sum += child_node.star_count;
            }
            if sum != node.star_count {
                return Err(corrupted_data(format!(
                    "node {} counts {} stars but its children hold {}",
                    id, node.star_count, sum
                )));
            }
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> OctreeResult<&OctreeNode> {
        self.nodes
            .get(id as usize)
            .ok_or(OctreeError::UnknownNode(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> OctreeResult<&mut OctreeNode> {
        self.nodes
            .get_mut(id as usize)
            .ok_or(OctreeError::UnknownNode(id))
    }

    pub fn nodes(&self) -> &[OctreeNode] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [OctreeNode] {
        &mut self.nodes
    }

    pub fn root(&self) -> &OctreeNode {
        &self.nodes[ROOT_NODE as usize]
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_stars(&self) -> u64 {
        self.total_stars
    }

    pub fn max_stars_per_node(&self) -> u32 {
        self.max_stars_per_node
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn lod_stride(&self) -> u32 {
        self.lod_stride
    }

    pub fn values_per_star(&self) -> usize {
        self.values_per_star
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Bytes of one full chunk slot
    pub fn chunk_size_bytes(&self) -> u64 {
        self.max_stars_per_node as u64 * self.values_per_star as u64 * 4
    }

    /// Bytes of a node's payload once resident
    pub fn payload_bytes(&self, id: NodeId) -> u64 {
        self.nodes
            .get(id as usize)
            .map(|node| node.payload_len as u64 * self.values_per_star as u64 * 4)
            .unwrap_or(0)
    }

    /// Deepest materialized node whose bounds contain `point`
    pub fn deepest_node_containing(&self, point: Vec3) -> Option<NodeId> {
        let root = &self.nodes[ROOT_NODE as usize];
        if !root.bounds.contains(point) {
            return None;
        }
        let mut id = ROOT_NODE;
        while let Some(children) = self.nodes[id as usize].children {
            id = children[self.nodes[id as usize].bounds.octant_of(point)];
        }
        Some(id)
    }

    /// Parent chain of a node, nearest first
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut current = self.nodes.get(id as usize).and_then(|node| node.parent);
        std::iter::from_fn(move || {
            let next = current?;
            current = self.nodes[next as usize].parent;
            Some(next)
        })
    }

    /// `id` and every descendant at most `levels` below it, breadth first
    pub fn descendants_within(&self, id: NodeId, levels: u32) -> Vec<NodeId> {
        let Some(start) = self.nodes.get(id as usize) else {
            return Vec::new();
        };
        let max_depth = start.depth + levels;
        let mut out = vec![id];
        let mut cursor = 0;
        while cursor < out.len() {
            let node = &self.nodes[out[cursor] as usize];
            cursor += 1;
            if node.depth >= max_depth {
                continue;
            }
            if let Some(children) = node.children {
                out.extend(children);
            }
        }
        out
    }
}
