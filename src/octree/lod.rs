/// Post-build LOD pass
///
/// Inner nodes get the brightest `max_stars_per_node` records of their
/// children as payload. Every node gets a fixed-stride subsample of its payload
/// as LOD slice, so coarse representations never depend on streaming state.
use std::sync::Arc;

use rayon::prelude::*;

use super::{OctreeNode, MAGNITUDE_OFFSET};

pub(crate) fn slice_lod_data(
    nodes: &mut [OctreeNode],
    values_per_star: usize,
    max_stars_per_node: usize,
    lod_stride: usize,
) {
    // Children always have larger ids than their parent.
    for id in (0..nodes.len()).rev() {
        let payload = match nodes[id].children {
            None => {
                let data = std::mem::take(&mut nodes[id].build_data);
                if data.len() / values_per_star > max_stars_per_node {
                    log::debug!(
                        "[lod::slice_lod_data] Leaf {} at depth {} holds {} stars, keeping the brightest {}",
                        id,
                        nodes[id].depth,
                        data.len() / values_per_star,
                        max_stars_per_node
                    );
                    brightest(data.chunks_exact(values_per_star), max_stars_per_node)
                } else {
                    data
                }
            }
            Some(children) => {
                let rows = children.iter().flat_map(|&child| {
                    nodes[child as usize]
                        .payload
                        .as_deref()
                        .unwrap_or(&[])
                        .chunks_exact(values_per_star)
                });
                brightest(rows, max_stars_per_node)
            }
        };

        let lod_slice = subsample(&payload, values_per_star, lod_stride);
        let node = &mut nodes[id];
        node.payload_len = (payload.len() / values_per_star) as u32;
        node.lod_slice = Arc::from(lod_slice);
        node.payload = Some(Arc::from(payload));
    }
}

/// Brightest (lowest magnitude) rows, stable on ties
fn brightest<'a>(rows: impl Iterator<Item = &'a [f32]>, limit: usize) -> Vec<f32> {
    let mut candidates: Vec<&[f32]> = rows.collect();
    candidates.par_sort_by(|a, b| a[MAGNITUDE_OFFSET].total_cmp(&b[MAGNITUDE_OFFSET]));
    candidates.truncate(limit);
    candidates.concat()
}

/// Every `stride`-th row, starting with the first
pub(crate) fn subsample(payload: &[f32], values_per_star: usize, stride: usize) -> Vec<f32> {
    payload
        .chunks_exact(values_per_star)
        .step_by(stride.max(1))
        .flatten()
        .copied()
        .collect()
}
