/// Structure file: header, node table, LOD slices and optional inline payloads
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use super::PayloadLayout;
use crate::error::{corrupted_data, version_mismatch, OctreeError, OctreeResult, PersistenceErrorContext};
use crate::octree::{Aabb, NodeId, OctreeNode, SpatialIndex, CANONICAL_VALUES_PER_STAR};

const STRUCTURE_MAGIC: [u8; 4] = *b"SOCT";
const STRUCTURE_FORMAT_VERSION: u32 = 1;
const NO_NODE: u32 = u32::MAX;

/// Header for structure files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub layout: u8,
    pub node_count: u32,
    pub total_records: u64,
    pub values_per_star: u32,
    pub max_stars_per_node: u32,
    pub max_depth: u32,
    pub lod_stride: u32,
    /// CRC32 over the node table, LOD section and inline payloads
    pub checksum: u32,
}

/// Fixed-size node table entry
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct NodeRecord {
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub children: [u32; 8],
    pub parent: u32,
    pub depth: u32,
    pub star_count: u64,
    pub payload_len: u32,
    pub lod_len: u32,
}

impl NodeRecord {
    fn from_node(node: &OctreeNode, values_per_star: usize) -> Self {
        Self {
            min: node.bounds.min.to_array(),
            max: node.bounds.max.to_array(),
            children: node.children.unwrap_or([NO_NODE; 8]),
            parent: node.parent.unwrap_or(NO_NODE),
            depth: node.depth,
            star_count: node.star_count,
            payload_len: node.payload_len,
            lod_len: (node.lod_slice.len() / values_per_star.max(1)) as u32,
        }
    }

    fn to_node(&self) -> OctreeNode {
        let parent = (self.parent != NO_NODE).then_some(self.parent as NodeId);
        let mut node = OctreeNode::new(
            Aabb::new(self.min.into(), self.max.into()),
            self.depth,
            parent,
        );
        if self.children[0] != NO_NODE {
            node.children = Some(self.children);
        }
        node.star_count = self.star_count;
        node.payload_len = self.payload_len;
        node
    }
}

fn layout_tag(layout: PayloadLayout) -> u8 {
    match layout {
        PayloadLayout::Inline => 0,
        PayloadLayout::Streaming => 1,
    }
}

fn layout_from_tag(tag: u8) -> OctreeResult<PayloadLayout> {
    match tag {
        0 => Ok(PayloadLayout::Inline),
        1 => Ok(PayloadLayout::Streaming),
        other => Err(corrupted_data(format!("unknown payload layout {}", other))),
    }
}

pub fn write_structure_file(index: &SpatialIndex, path: &Path, layout: PayloadLayout) -> OctreeResult<()> {
    let vps = index.values_per_star();
    let records: Vec<NodeRecord> = index
        .nodes()
        .iter()
        .map(|node| NodeRecord::from_node(node, vps))
        .collect();

    let table: &[u8] = bytemuck::cast_slice(&records);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(table);
    for node in index.nodes() {
        hasher.update(bytemuck::cast_slice(&node.lod_slice[..]));
    }
    if layout == PayloadLayout::Inline {
        for node in index.nodes() {
            if let Some(payload) = node.payload.as_ref() {
                hasher.update(bytemuck::cast_slice(&payload[..]));
            }
        }
    }

    let header = StructureHeader {
        magic: STRUCTURE_MAGIC,
        version: STRUCTURE_FORMAT_VERSION,
        layout: layout_tag(layout),
        node_count: records.len() as u32,
        total_records: index.total_stars(),
        values_per_star: vps as u32,
        max_stars_per_node: index.max_stars_per_node(),
        max_depth: index.max_depth(),
        lod_stride: index.lod_stride(),
        checksum: hasher.finalize(),
    };

    let file = std::fs::File::create(path).persistence_context(path)?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, &header)?;
    writer.write_all(table).persistence_context(path)?;
    for node in index.nodes() {
        writer
            .write_all(bytemuck::cast_slice(&node.lod_slice[..]))
            .persistence_context(path)?;
    }

    if layout == PayloadLayout::Inline {
        for (id, node) in index.nodes().iter().enumerate() {
            if node.payload_len == 0 {
                continue;
            }
            let payload = node
                .payload
                .as_ref()
                .ok_or(OctreeError::PayloadUnavailable(id as NodeId))?;
            writer
                .write_all(bytemuck::cast_slice(&payload[..]))
                .persistence_context(path)?;
        }
    }
    writer.flush().persistence_context(path)
}

/// Bytes of one per-node section, or None on overflow
fn section_bytes(records: &[NodeRecord], vps: usize, len: impl Fn(&NodeRecord) -> u32) -> Option<u64> {
    let row_bytes = (vps as u64).checked_mul(std::mem::size_of::<f32>() as u64)?;
    records
        .iter()
        .try_fold(0u64, |acc, r| acc.checked_add((len(r) as u64).checked_mul(row_bytes)?))
}

pub fn read_structure_file(
    path: &Path,
) -> OctreeResult<(StructureHeader, Vec<OctreeNode>)> {
    let file = std::fs::File::open(path).persistence_context(path)?;
    let file_len = file.metadata().persistence_context(path)?.len();
    let mut reader = BufReader::new(file);

    let header: StructureHeader = bincode::deserialize_from(&mut reader)?;
    if header.magic != STRUCTURE_MAGIC {
        return Err(corrupted_data("invalid structure magic"));
    }
    if header.version != STRUCTURE_FORMAT_VERSION {
        return Err(version_mismatch(STRUCTURE_FORMAT_VERSION, header.version));
    }
    let layout = layout_from_tag(header.layout)?;
    let vps = header.values_per_star as usize;
    if vps < CANONICAL_VALUES_PER_STAR {
        return Err(OctreeError::InvalidValuesPerStar {
            found: vps,
            minimum: CANONICAL_VALUES_PER_STAR,
        });
    }

    let table_len = header.node_count as u64 * std::mem::size_of::<NodeRecord>() as u64;
    if header.node_count == 0 || table_len > file_len {
        return Err(corrupted_data(format!(
            "node table of {} entries does not fit in {} bytes",
            header.node_count, file_len
        )));
    }

    let mut records = vec![NodeRecord::zeroed(); header.node_count as usize];
    reader
        .read_exact(bytemuck::cast_slice_mut(&mut records))
        .persistence_context(path)?;

    let lod_bytes = section_bytes(&records, vps, |r| r.lod_len)
        .ok_or_else(|| corrupted_data("LOD lengths overflow"))?;
    let payload_bytes = match layout {
        PayloadLayout::Inline => section_bytes(&records, vps, |r| r.payload_len)
            .ok_or_else(|| corrupted_data("inline payload lengths overflow"))?,
        PayloadLayout::Streaming => 0,
    };
    let needed = table_len
        .checked_add(lod_bytes)
        .and_then(|n| n.checked_add(payload_bytes));
    if !matches!(needed, Some(needed) if needed <= file_len) {
        return Err(corrupted_data(format!(
            "node table promises more data than the {} byte file holds",
            file_len
        )));
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytemuck::cast_slice(&records));

    let mut nodes = Vec::with_capacity(records.len());
    for record in &records {
        if record.children[0] != NO_NODE
            && record.children.iter().any(|&c| c as usize >= records.len())
        {
            return Err(corrupted_data("child index out of range"));
        }
        let mut node = record.to_node();
        let mut lod = vec![0f32; record.lod_len as usize * vps];
        reader
            .read_exact(bytemuck::cast_slice_mut(&mut lod))
            .persistence_context(path)?;
        hasher.update(bytemuck::cast_slice(&lod));
        node.lod_slice = Arc::from(lod);
        nodes.push(node);
    }

    if layout == PayloadLayout::Inline {
        for node in nodes.iter_mut() {
            let mut payload = vec![0f32; node.payload_len as usize * vps];
            reader
                .read_exact(bytemuck::cast_slice_mut(&mut payload))
                .persistence_context(path)?;
            hasher.update(bytemuck::cast_slice(&payload));
            node.payload = Some(Arc::from(payload));
        }
    }

    if hasher.finalize() != header.checksum {
        return Err(corrupted_data("structure checksum mismatch"));
    }

    Ok((header, nodes))
}
