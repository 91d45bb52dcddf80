/// Per-frame octree traversal
///
/// Walks the tree from the root, culls against the view frustum and picks a
/// render set: nodes whose projected size is under the pixel threshold (or
/// leaves) are drawn as they are, larger nodes are replaced by their
/// children. The output carries only the slot uploads that changed since
/// the previous call.
use std::sync::Arc;

use glam::{Mat4, Vec2};
use rustc_hash::FxHashMap;

use super::frustum::{projected_footprint, Frustum};
use super::residency::{AdmitPriority, ResidencyManager};
use super::slot_allocator::SlotId;
use crate::error::{OctreeError, OctreeResult};
use crate::octree::{NodeId, NodeState, SpatialIndex, ROOT_NODE};

/// Where a rendered node's stars come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderSource {
    /// Full payload, uploaded to this slot
    Slot(SlotId),
    /// The node's always-resident LOD slice
    LodSlice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderItem {
    pub node: NodeId,
    pub source: RenderSource,
    pub star_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TraversalOutput {
    pub render_set: Vec<RenderItem>,
    /// Slot contents that changed; an empty buffer clears the slot
    pub delta: FxHashMap<SlotId, Arc<[f32]>>,
    /// Rendered stars gained minus rendered stars lost since the last traversal
    pub delta_star_count: i64,
}

impl TraversalOutput {
    pub fn rendered_stars(&self) -> u64 {
        self.render_set.iter().map(|item| item.star_count).sum()
    }
}

/// Remembers what the renderer already holds between frames
#[derive(Debug, Default)]
pub struct Traverser {
    uploaded: FxHashMap<SlotId, (NodeId, u32)>,
    rendered_stars: u64,
}

impl Traverser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget uploads, e.g. after the slot pool was reinitialized
    pub fn reset(&mut self) {
        self.uploaded.clear();
        self.rendered_stars = 0;
    }

    pub fn traverse(
        &mut self,
        index: &mut SpatialIndex,
        residency: &mut ResidencyManager,
        view_projection: &Mat4,
        screen_size: Vec2,
        lod_pixel_threshold: f32,
    ) -> OctreeResult<TraversalOutput> {
        let frustum = Frustum::from_view_projection(view_projection);
        let values_per_star = index.values_per_star();
        let mut render_set = Vec::new();
        // Children of a refined node are admitted even when they end up below
        // the threshold; the root only when it is large on screen.
        let mut work = vec![(ROOT_NODE, false)];

        while let Some((id, wanted)) = work.pop() {
            let (bounds, children, star_count) = {
                let node = index.node(id)?;
                (node.bounds, node.children, node.star_count)
            };
            if star_count == 0 || !frustum.intersects_aabb(&bounds) {
                continue;
            }

            let footprint = projected_footprint(view_projection, screen_size, &bounds);
            let above_threshold = footprint >= lod_pixel_threshold;
            let children = match children {
                Some(children) if above_threshold => children,
                _ => {
                    residency.mark_visible(id);
                    if (above_threshold || wanted) && !index.node(id)?.is_resident() {
                        residency.admit(index, id, AdmitPriority::Visible)?;
                    }
                    render_set.push(render_item(index, residency, id, values_per_star)?);
                    continue;
                }
            };

            // Refined nodes are never drawn, so they must not hold a slot.
            if residency.release_refined(index, id)? {
                log::debug!("[Traverser::traverse] Released refined node {}", id);
            }
            for child in children {
                let node = index.node(child)?;
                if node.star_count > 0 && frustum.intersects_aabb(&node.bounds) {
                    work.push((child, true));
                }
            }
        }

        let delta = self.diff_uploads(index, &render_set)?;
        let rendered: u64 = render_set.iter().map(|item| item.star_count).sum();
        let delta_star_count = rendered as i64 - self.rendered_stars as i64;
        self.rendered_stars = rendered;

        Ok(TraversalOutput {
            render_set,
            delta,
            delta_star_count,
        })
    }

    fn diff_uploads(
        &mut self,
        index: &SpatialIndex,
        render_set: &[RenderItem],
    ) -> OctreeResult<FxHashMap<SlotId, Arc<[f32]>>> {
        let mut current = FxHashMap::default();
        let mut delta = FxHashMap::default();
        for item in render_set {
            let RenderSource::Slot(slot) = item.source else {
                continue;
            };
            let node = index.node(item.node)?;
            let key = (item.node, node.generation);
            current.insert(slot, key);
            if self.uploaded.get(&slot) != Some(&key) {
                let payload = node
                    .payload
                    .as_ref()
                    .ok_or(OctreeError::PayloadUnavailable(item.node))?;
                delta.insert(slot, Arc::clone(payload));
            }
        }
        for slot in self.uploaded.keys() {
            if !current.contains_key(slot) {
                delta.insert(*slot, Arc::from(Vec::new()));
            }
        }
        self.uploaded = current;
        Ok(delta)
    }
}

fn render_item(
    index: &SpatialIndex,
    residency: &mut ResidencyManager,
    id: NodeId,
    values_per_star: usize,
) -> OctreeResult<RenderItem> {
    let node = index.node(id)?;
    let item = match (node.state(), node.chunk_slot) {
        (NodeState::Resident, Some(slot)) => {
            residency.mark_referenced(slot);
            RenderItem {
                node: id,
                source: RenderSource::Slot(slot),
                star_count: node.payload_len as u64,
            }
        }
        _ => RenderItem {
            node: id,
            source: RenderSource::LodSlice,
            star_count: node.lod_star_count(values_per_star),
        },
    };
    Ok(item)
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::config::StreamingConfig;
    use crate::octree::{StarRecord, CANONICAL_VALUES_PER_STAR};
    use crate::streaming::fetch::FetchPool;
    use crate::streaming::residency::ResidencyMode;
    use crate::streaming::slot_allocator::{BufferSlotAllocator, SlotDiscipline};

    const SCREEN: Vec2 = Vec2::new(1280.0, 720.0);

    fn setup() -> (SpatialIndex, ResidencyManager) {
        let config = StreamingConfig {
            max_stars_per_node: 16,
            max_depth: 5,
            root_half_extent: 100.0,
            lod_stride: 4,
            ..Default::default()
        };
        let mut index = SpatialIndex::new(&config);
        index.set_values_per_star(CANONICAL_VALUES_PER_STAR).unwrap();
        for i in 0..400 {
            let t = i as f32;
            let position = Vec3::new((t * 17.3) % 190.0 - 95.0, (t * 7.9) % 190.0 - 95.0, (t * 3.7) % 190.0 - 95.0);
            index.insert(&StarRecord::new(position, t % 13.0, 0.0)).unwrap();
        }
        index.slice_lod_data().unwrap();
        let residency = ResidencyManager::new(
            ResidencyMode::InMemory,
            None,
            BufferSlotAllocator::new(64, SlotDiscipline::IndexedStorage, 1),
            FetchPool::new(1).unwrap(),
            0,
        );
        (index, residency)
    }

    fn view(eye: Vec3) -> Mat4 {
        Mat4::perspective_rh(60f32.to_radians(), SCREEN.x / SCREEN.y, 0.1, 100_000.0)
            * Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y)
    }

    #[test]
    fn test_distant_camera_renders_root_lod_only() {
        let (mut index, mut residency) = setup();
        let mut traverser = Traverser::new();
        let output = traverser
            .traverse(&mut index, &mut residency, &view(Vec3::new(0.0, 0.0, 50_000.0)), SCREEN, 250.0)
            .unwrap();
        assert_eq!(output.render_set.len(), 1);
        assert_eq!(output.render_set[0].node, ROOT_NODE);
        assert_eq!(output.render_set[0].source, RenderSource::LodSlice);
        assert!(output.delta.is_empty());
        assert_eq!(residency.num_resident(), 0);
    }

    #[test]
    fn test_repeat_traversal_has_empty_delta() {
        let (mut index, mut residency) = setup();
        let mut traverser = Traverser::new();
        let matrix = view(Vec3::new(0.0, 0.0, 150.0));
        let mut last = TraversalOutput::default();
        for _ in 0..8 {
            residency.begin_frame();
            last = traverser
                .traverse(&mut index, &mut residency, &matrix, SCREEN, 250.0)
                .unwrap();
            residency.end_frame();
        }
        assert!(last.delta.is_empty());
        assert_eq!(last.delta_star_count, 0);
        assert!(last.render_set.iter().any(|item| matches!(item.source, RenderSource::Slot(_))));
    }

    #[test]
    fn test_below_threshold_is_never_refined() {
        let (mut index, mut residency) = setup();
        let mut traverser = Traverser::new();
        let matrix = view(Vec3::new(0.0, 0.0, 150.0));
        // Make the root resident; a huge threshold must still stop at the root.
        residency.admit(&mut index, ROOT_NODE, AdmitPriority::Visible).unwrap();
        let output = traverser
            .traverse(&mut index, &mut residency, &matrix, SCREEN, 1.0e9)
            .unwrap();
        assert_eq!(output.render_set.len(), 1);
        assert_eq!(output.render_set[0].node, ROOT_NODE);
        assert!(matches!(output.render_set[0].source, RenderSource::Slot(_)));
    }

    #[test]
    fn test_refined_nodes_give_their_slots_back() {
        let (mut index, mut residency) = setup();
        let mut traverser = Traverser::new();
        residency.admit(&mut index, ROOT_NODE, AdmitPriority::Visible).unwrap();
        residency.begin_frame();
        residency.begin_frame();
        assert!(index.node(ROOT_NODE).unwrap().is_resident());

        let matrix = view(Vec3::new(0.0, 0.0, 150.0));
        let mut output = TraversalOutput::default();
        for _ in 0..4 {
            residency.begin_frame();
            output = traverser.traverse(&mut index, &mut residency, &matrix, SCREEN, 250.0).unwrap();
            residency.end_frame();
        }

        assert_eq!(index.node(ROOT_NODE).unwrap().state(), NodeState::Unloaded);
        let rendered: Vec<NodeId> = output.render_set.iter().map(|item| item.node).collect();
        for id in residency.resident_nodes() {
            assert!(rendered.contains(&id), "node {} holds a slot but is not drawn", id);
        }
        assert!(output.render_set.iter().any(|item| matches!(item.source, RenderSource::Slot(_))));
    }

    #[test]
    fn test_slot_leaving_render_set_is_cleared() {
        let (mut index, mut residency) = setup();
        let mut traverser = Traverser::new();
        let near = view(Vec3::new(0.0, 0.0, 150.0));
        for _ in 0..4 {
            residency.begin_frame();
            traverser.traverse(&mut index, &mut residency, &near, SCREEN, 250.0).unwrap();
            residency.end_frame();
        }
        let far = traverser
            .traverse(&mut index, &mut residency, &view(Vec3::new(0.0, 0.0, 50_000.0)), SCREEN, 250.0)
            .unwrap();
        assert!(!far.delta.is_empty());
        assert!(far.delta.values().all(|buffer| buffer.is_empty()));
        assert!(far.delta_star_count < 0);
    }
}
