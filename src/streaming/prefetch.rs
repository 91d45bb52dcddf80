/// Speculative loading around the camera
///
/// The node containing the camera anchors a small neighbourhood: climb a few
/// ancestors, then take everything a few levels below that anchor. Requests
/// go out nearest first with `Prefetch` priority, so they only use budget
/// the visible set is not claiming.
use glam::Vec3;
use rustc_hash::FxHashSet;

use super::residency::{AdmitPriority, Admission, ResidencyManager};
use crate::config::AdditionalLayers;
use crate::error::OctreeResult;
use crate::octree::{NodeId, SpatialIndex};

/// Outcome counts for one prefetch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Nodes in the neighbourhood, after dropping empty ones
    pub candidates: usize,
    pub already_resident: usize,
    pub pending: usize,
    pub deferred: usize,
    pub rejected: usize,
    /// The pass stopped early because less than one chunk of budget remained
    pub budget_exhausted: bool,
}

/// Non-empty nodes around `camera_position`, nearest first
pub fn prefetch_candidates(
    index: &SpatialIndex,
    camera_position: Vec3,
    layers: AdditionalLayers,
) -> Vec<NodeId> {
    let Some(start) = index.deepest_node_containing(camera_position) else {
        return Vec::new();
    };
    let anchor = index
        .ancestors(start)
        .take(layers.parent_depth as usize)
        .last()
        .unwrap_or(start);

    let mut seen = FxHashSet::default();
    let mut nodes = Vec::new();
    let path = std::iter::once(start).chain(index.ancestors(start).take_while(|&id| id != anchor));
    for id in index
        .descendants_within(anchor, layers.descendant_depth)
        .into_iter()
        .chain(path)
    {
        if seen.insert(id) {
            nodes.push(id);
        }
    }

    let mut ranked: Vec<(f32, u32, NodeId)> = nodes
        .into_iter()
        .filter_map(|id| {
            let node = index.node(id).ok()?;
            (node.star_count > 0).then(|| (node.bounds.distance_to(camera_position), node.depth, id))
        })
        .collect();
    // Equal distances (the camera inside several nested boxes) favour the deeper node.
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
    ranked.into_iter().map(|(_, _, id)| id).collect()
}

pub fn fetch_surrounding_nodes(
    index: &mut SpatialIndex,
    residency: &mut ResidencyManager,
    camera_position: Vec3,
    chunk_size_bytes: u64,
    layers: AdditionalLayers,
) -> OctreeResult<PrefetchReport> {
    residency.set_camera(camera_position);
    let candidates = prefetch_candidates(index, camera_position, layers);
    let mut report = PrefetchReport {
        candidates: candidates.len(),
        ..Default::default()
    };

    for id in candidates {
        if index.node(id)?.is_resident() {
            report.already_resident += 1;
            continue;
        }
        if residency.remaining_cpu_budget() < chunk_size_bytes {
            report.budget_exhausted = true;
            break;
        }
        match residency.admit(index, id, AdmitPriority::Prefetch)? {
            Admission::Resident => report.already_resident += 1,
            Admission::Pending(_) => report.pending += 1,
            Admission::Deferred => report.deferred += 1,
            Admission::Rejected => report.rejected += 1,
        }
    }

    log::debug!(
        "[prefetch::fetch_surrounding_nodes] {:?} around ({:.1}, {:.1}, {:.1})",
        report,
        camera_position.x,
        camera_position.y,
        camera_position.z
    );
    Ok(report)
}
