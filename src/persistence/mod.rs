//! Persistence for star octrees
//!
//! An index is stored as one structure file (header, node table, LOD
//! slices) plus its payloads. With `PayloadLayout::Inline` the payloads follow
//! the LOD section in the same file. With `PayloadLayout::Streaming` every
//! node with a non-empty payload gets its own file under `<structure>.nodes/`,
//! which the fetch pool reads on demand.

mod payload_file;
mod structure_file;

pub use payload_file::{
    probe_payload_header, read_payload_file, write_payload_file, PayloadHeader,
    PAYLOAD_HEADER_SIZE,
};
pub use structure_file::{read_structure_file, write_structure_file, NodeRecord, StructureHeader};

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::config::StreamingConfig;
use crate::error::{OctreeError, OctreeResult, PersistenceErrorContext};
use crate::octree::{NodeId, SpatialIndex};

/// Payload headers checked at load time; the root and its first children
const SCHEMA_PROBE_LIMIT: usize = 9;

/// Where node payloads live on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLayout {
    /// Payloads appended to the structure file; the whole tree loads at once
    Inline,
    /// One payload file per node, fetched on demand
    Streaming,
}

/// Directory holding per-node payload files for a structure file
pub fn payload_dir_for(structure_path: &Path) -> PathBuf {
    let mut name = structure_path.as_os_str().to_os_string();
    name.push(".nodes");
    PathBuf::from(name)
}

pub fn payload_file_name(id: NodeId) -> String {
    format!("node_{:08}.spl", id)
}

pub fn payload_path(payload_dir: &Path, id: NodeId) -> PathBuf {
    payload_dir.join(payload_file_name(id))
}

pub(crate) fn write_index(index: &SpatialIndex, path: &Path, layout: PayloadLayout) -> OctreeResult<()> {
    if !index.is_sealed() {
        log::warn!(
            "[persistence::write_index] Writing {} before LOD slicing; inner nodes carry no payload",
            path.display()
        );
    }

    if layout == PayloadLayout::Streaming {
        let dir = payload_dir_for(path);
        std::fs::create_dir_all(&dir).persistence_context(&dir)?;
        let vps = index.values_per_star();
        index
            .nodes()
            .par_iter()
            .enumerate()
            .filter(|(_, node)| node.payload_len > 0)
            .try_for_each(|(id, node)| {
                let payload = node
                    .payload
                    .as_ref()
                    .ok_or(OctreeError::PayloadUnavailable(id as NodeId))?;
                write_payload_file(&payload_path(&dir, id as NodeId), payload, vps)
            })?;
    }

    write_structure_file(index, path, layout)?;
    log::info!(
        "[persistence::write_index] Wrote {} nodes ({} stars, {:?}) to {}",
        index.total_nodes(),
        index.total_stars(),
        layout,
        path.display()
    );
    Ok(())
}

pub(crate) fn read_index(path: &Path, config: &StreamingConfig) -> OctreeResult<(SpatialIndex, PayloadLayout)> {
    let (header, mut nodes) = read_structure_file(path)?;
    let layout = if header.layout == 0 {
        PayloadLayout::Inline
    } else {
        PayloadLayout::Streaming
    };
    let vps = header.values_per_star as usize;

    if config.max_stars_per_node != header.max_stars_per_node {
        log::debug!(
            "[persistence::read_index] File uses max_stars_per_node {} (config has {})",
            header.max_stars_per_node,
            config.max_stars_per_node
        );
    }

    if layout == PayloadLayout::Streaming {
        let dir = payload_dir_for(path);
        for (id, node) in nodes.iter_mut().enumerate().take(SCHEMA_PROBE_LIMIT) {
            if node.payload_len == 0 {
                continue;
            }
            let file = payload_path(&dir, id as NodeId);
            match probe_payload_header(&file) {
                Ok(found) if found.values_per_star as usize != vps => {
                    return Err(OctreeError::SchemaMismatch {
                        expected: vps,
                        found: found.values_per_star as usize,
                        path: file,
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!(
                        "[persistence::read_index] Node {} payload unusable, rendering from LOD only: {}",
                        id,
                        err
                    );
                    node.payload_broken = true;
                }
            }
        }
    }

    let index = SpatialIndex::from_parts(
        nodes,
        vps,
        header.max_stars_per_node,
        header.max_depth,
        header.lod_stride,
    )?;
    if index.total_stars() != header.total_records {
        return Err(crate::error::corrupted_data(format!(
            "root counts {} stars, header records {}",
            index.total_stars(),
            header.total_records
        )));
    }

    log::info!(
        "[persistence::read_index] Loaded {} nodes ({} stars, {:?}) from {}",
        index.total_nodes(),
        index.total_stars(),
        layout,
        path.display()
    );
    Ok((index, layout))
}
