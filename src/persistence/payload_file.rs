/// Per-node payload files
///
/// A 24 byte header followed by `record_count * values_per_star` native
/// f32 values in canonical column order.
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::error::{corrupted_data, version_mismatch, OctreeError, OctreeResult, PersistenceErrorContext};

const PAYLOAD_MAGIC: [u8; 4] = *b"SPLD";
const PAYLOAD_FORMAT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PayloadHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub values_per_star: u32,
    pub record_count: u32,
    pub checksum: u32,
    pub _padding: u32,
}

pub const PAYLOAD_HEADER_SIZE: usize = std::mem::size_of::<PayloadHeader>();

pub fn write_payload_file(path: &Path, values: &[f32], values_per_star: usize) -> OctreeResult<()> {
    let body: &[u8] = bytemuck::cast_slice(values);
    let header = PayloadHeader {
        magic: PAYLOAD_MAGIC,
        version: PAYLOAD_FORMAT_VERSION,
        values_per_star: values_per_star as u32,
        record_count: (values.len() / values_per_star) as u32,
        checksum: crc32fast::hash(body),
        _padding: 0,
    };
    let mut bytes = Vec::with_capacity(PAYLOAD_HEADER_SIZE + body.len());
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    bytes.extend_from_slice(body);
    std::fs::write(path, bytes).persistence_context(path)
}

/// Read only the header; used to validate the schema at load time
pub fn probe_payload_header(path: &Path) -> OctreeResult<PayloadHeader> {
    use std::io::Read;

    let mut file = std::fs::File::open(path).persistence_context(path)?;
    let mut raw = [0u8; PAYLOAD_HEADER_SIZE];
    file.read_exact(&mut raw).persistence_context(path)?;
    let header: PayloadHeader = bytemuck::pod_read_unaligned(&raw);
    check_header(&header)?;
    Ok(header)
}

/// Read and validate a full payload file
pub fn read_payload_file(
    path: &Path,
    values_per_star: usize,
    expected_records: u32,
) -> OctreeResult<Vec<f32>> {
    let bytes = std::fs::read(path).persistence_context(path)?;
    if bytes.len() < PAYLOAD_HEADER_SIZE {
        return Err(corrupted_data(format!(
            "{} is too small to hold a payload header",
            path.display()
        )));
    }
    let header: PayloadHeader = bytemuck::pod_read_unaligned(&bytes[..PAYLOAD_HEADER_SIZE]);
    check_header(&header)?;

    if header.values_per_star as usize != values_per_star {
        return Err(OctreeError::SchemaMismatch {
            expected: values_per_star,
            found: header.values_per_star as usize,
            path: path.to_path_buf(),
        });
    }
    if header.record_count != expected_records {
        return Err(corrupted_data(format!(
            "{} holds {} records, structure expects {}",
            path.display(),
            header.record_count,
            expected_records
        )));
    }

    let body = &bytes[PAYLOAD_HEADER_SIZE..];
    let expected_len = expected_records as usize * values_per_star * 4;
    if body.len() != expected_len {
        return Err(corrupted_data(format!(
            "{} has {} payload bytes, expected {}",
            path.display(),
            body.len(),
            expected_len
        )));
    }
    if crc32fast::hash(body) != header.checksum {
        return Err(corrupted_data(format!("{} checksum mismatch", path.display())));
    }
    Ok(bytemuck::pod_collect_to_vec(body))
}

fn check_header(header: &PayloadHeader) -> OctreeResult<()> {
    if header.magic != PAYLOAD_MAGIC {
        return Err(corrupted_data("invalid payload magic"));
    }
    if header.version != PAYLOAD_FORMAT_VERSION {
        return Err(version_mismatch(PAYLOAD_FORMAT_VERSION, header.version));
    }
    Ok(())
}
