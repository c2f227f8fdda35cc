//! Parser for Git pack index (.idx) version 2 files.
//!
//! The index is what the push pipeline inspects after an upload has been
//! unpacked: it enumerates every object in the side pack so each one can be
//! vetted against the allowed type set before anything is committed. Offsets
//! carrying the 8-byte-table marker bit are refused; this server does not
//! host packs past the 31-bit boundary.

use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

use crate::{
    errors::GitError,
    hash::ObjectId,
    internal::object::types::ObjectType,
    odb::ObjectDatabase,
};

const IDX_MAGIC: u32 = 0xff744f63;
const IDX_VERSION: u32 = 2;
const OFFSET_LARGE_BIT: u32 = 0x8000_0000;

/// One `.idx` entry augmented with the object header from the ODB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub oid: ObjectId,
    pub crc32: u32,
    pub offset: u32,
    pub size: u64,
    pub obj_type: ObjectType,
}

/// A fully parsed and vetted pack index.
#[derive(Debug, Clone, Default)]
pub struct PackIndex {
    pub entries: Vec<IndexEntry>,
}

impl PackIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, oid: ObjectId) -> bool {
        self.entries.binary_search_by(|e| e.oid.cmp(&oid)).is_ok()
    }
}

/// Parse an on-disk `.idx` file, asking `odb` for each entry's `(size, type)`.
///
/// The trailing checksums are not verified; the object database already vetted
/// the pack payload when it was indexed.
pub async fn parse_index(path: &Path, odb: &dyn ObjectDatabase) -> Result<PackIndex, GitError> {
    let data = tokio::fs::read(path).await?;
    parse_index_bytes(&data, odb).await
}

pub async fn parse_index_bytes(
    data: &[u8],
    odb: &dyn ObjectDatabase,
) -> Result<PackIndex, GitError> {
    let header_len = 8 + 256 * 4;
    if data.len() < header_len {
        return Err(GitError::InvalidIdxFile("truncated header".to_string()));
    }

    let magic = BigEndian::read_u32(&data[0..4]);
    if magic != IDX_MAGIC {
        return Err(GitError::InvalidIdxFile(format!("bad magic {magic:#010x}")));
    }
    let version = BigEndian::read_u32(&data[4..8]);
    if version != IDX_VERSION {
        return Err(GitError::InvalidIdxFile(format!(
            "unsupported version {version}"
        )));
    }

    let mut fanout = [0u32; 256];
    for (i, slot) in fanout.iter_mut().enumerate() {
        *slot = BigEndian::read_u32(&data[8 + i * 4..12 + i * 4]);
    }
    let count = fanout[255] as usize;

    let names_start = header_len;
    let crc_start = names_start + count * 20;
    let offsets_start = crc_start + count * 4;
    let offsets_end = offsets_start + count * 4;
    if data.len() < offsets_end {
        return Err(GitError::InvalidIdxFile(format!(
            "expected {offsets_end} bytes for {count} entries, file has {}",
            data.len()
        )));
    }

    let mut entries = Vec::with_capacity(count);
    let mut previous: Option<ObjectId> = None;
    for i in 0..count {
        let oid = ObjectId::from_slice(&data[names_start + i * 20..names_start + (i + 1) * 20])
            .map_err(GitError::InvalidIdxFile)?;
        if let Some(prev) = previous {
            if oid <= prev {
                return Err(GitError::InvalidIdxFile(format!(
                    "name table not strictly ascending at entry {i}"
                )));
            }
        }
        previous = Some(oid);

        let crc32 = BigEndian::read_u32(&data[crc_start + i * 4..crc_start + (i + 1) * 4]);
        let raw_offset =
            BigEndian::read_u32(&data[offsets_start + i * 4..offsets_start + (i + 1) * 4]);
        if raw_offset & OFFSET_LARGE_BIT != 0 {
            return Err(GitError::LargePackfile);
        }

        let (size, obj_type) = match odb.object_header(oid).await {
            Ok(header) => header,
            Err(GitError::ObjectNotFound(_)) => {
                return Err(GitError::ObjectTypeUnallowed("unknown".to_string()));
            }
            Err(e) => return Err(e),
        };
        if !obj_type.is_upload_allowed() {
            return Err(GitError::ObjectTypeUnallowed(obj_type.to_string()));
        }

        entries.push(IndexEntry {
            oid,
            crc32,
            offset: raw_offset,
            size,
            obj_type,
        });
    }

    Ok(PackIndex { entries })
}
