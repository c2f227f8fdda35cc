//! Streaming indexer for uploaded packs.
//!
//! Consumes the binary pack a client sends after its command phase, inflates
//! every object, and writes the `pack-<hash>.pack` / `pack-<hash>.idx` pair
//! into a side directory. Only undeltified commits, trees, blobs, and tags
//! survive decoding; delta entries are refused outright since this server
//! never advertises thin-pack acceptance on the receive side.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use flate2::bufread::ZlibDecoder;

use crate::{
    errors::GitError,
    hash::ObjectId,
    internal::{object::types::ObjectType, pack::entry::Entry},
    utils::Sha1Writer,
};

const PACK_MAGIC: &[u8; 4] = b"PACK";

/// One decoded object plus the bookkeeping the `.idx` file needs.
#[derive(Debug, Clone)]
pub struct UnpackedEntry {
    pub entry: Entry,
    pub crc32: u32,
    pub offset: u32,
}

/// Decode a complete pack byte stream. Returns the entries in pack order and
/// the trailer hash, verifying the trailer along the way.
pub fn read_pack(data: &[u8]) -> Result<(Vec<UnpackedEntry>, ObjectId), GitError> {
    if data.len() < 12 + 20 {
        return Err(GitError::InvalidPackFile("truncated pack".to_string()));
    }
    if &data[0..4] != PACK_MAGIC {
        return Err(GitError::InvalidPackFile("bad magic".to_string()));
    }
    let version = BigEndian::read_u32(&data[4..8]);
    if version != 2 {
        return Err(GitError::InvalidPackFile(format!(
            "unsupported pack version {version}"
        )));
    }
    let count = BigEndian::read_u32(&data[8..12]) as usize;

    let body_end = data.len() - 20;
    let mut offset = 12usize;
    let mut entries = Vec::with_capacity(count);

    for _ in 0..count {
        let entry_start = offset;
        if offset >= body_end {
            return Err(GitError::InvalidPackFile(
                "object count exceeds pack body".to_string(),
            ));
        }
        let (obj_type, size, header_len) = read_object_header(&data[offset..body_end])?;
        offset += header_len;

        if !matches!(
            obj_type,
            ObjectType::Commit | ObjectType::Tree | ObjectType::Blob | ObjectType::Tag
        ) {
            return Err(GitError::ObjectTypeUnallowed(obj_type.to_string()));
        }

        let mut decoder = ZlibDecoder::new(&data[offset..body_end]);
        let mut payload = Vec::with_capacity(size);
        decoder
            .read_to_end(&mut payload)
            .map_err(|e| GitError::InvalidPackFile(format!("zlib stream: {e}")))?;
        if payload.len() != size {
            return Err(GitError::InvalidPackFile(format!(
                "object size mismatch: header {size}, inflated {}",
                payload.len()
            )));
        }
        offset += decoder.total_in() as usize;

        let hash = ObjectId::from_type_and_data(obj_type, &payload);
        let crc32 = crc32fast::hash(&data[entry_start..offset]);
        entries.push(UnpackedEntry {
            entry: Entry {
                obj_type,
                data: payload,
                hash,
            },
            crc32,
            offset: u32::try_from(entry_start).map_err(|_| GitError::LargePackfile)?,
        });
    }

    if offset != body_end {
        return Err(GitError::InvalidPackFile(format!(
            "{} trailing bytes after last object",
            body_end - offset
        )));
    }

    let trailer = ObjectId::from_slice(&data[body_end..]).map_err(GitError::InvalidPackFile)?;
    let computed = ObjectId::hash_bytes(&data[..body_end]);
    if trailer != computed {
        return Err(GitError::InvalidPackFile("trailer checksum mismatch".to_string()));
    }

    Ok((entries, trailer))
}

/// Varint object header: 3 type bits and the size, four bits then seven per
/// continuation byte.
fn read_object_header(data: &[u8]) -> Result<(ObjectType, usize, usize), GitError> {
    let mut pos = 0usize;
    let first = *data
        .get(pos)
        .ok_or_else(|| GitError::InvalidPackFile("truncated object header".to_string()))?;
    pos += 1;
    let obj_type = ObjectType::from_pack_type_u8((first >> 4) & 0x07)?;
    let mut size = (first & 0x0f) as usize;
    let mut shift = 4usize;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = *data
            .get(pos)
            .ok_or_else(|| GitError::InvalidPackFile("truncated object header".to_string()))?;
        pos += 1;
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
    }
    Ok((obj_type, size, pos))
}

/// Write the pack bytes and a v2 `.idx` for them into `dir`, named after the
/// trailer hash. Returns `(pack_path, idx_path)`.
pub fn write_pack_and_index(
    dir: &Path,
    data: &[u8],
    entries: &[UnpackedEntry],
    pack_hash: ObjectId,
) -> Result<(PathBuf, PathBuf), GitError> {
    fs::create_dir_all(dir)?;
    let pack_path = dir.join(format!("pack-{pack_hash}.pack"));
    let idx_path = dir.join(format!("pack-{pack_hash}.idx"));

    fs::write(&pack_path, data)?;
    fs::write(&idx_path, build_index(entries, pack_hash))?;
    Ok((pack_path, idx_path))
}

/// Serialize the v2 index: magic, version, cumulative fanout, sorted names,
/// CRCs, 31-bit offsets, pack hash, idx hash.
fn build_index(entries: &[UnpackedEntry], pack_hash: ObjectId) -> Vec<u8> {
    let mut sorted: Vec<&UnpackedEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.entry.hash.cmp(&b.entry.hash));
    sorted.dedup_by(|a, b| a.entry.hash == b.entry.hash);

    let mut hasher = Sha1Writer::new();
    let mut out = Vec::new();
    let mut emit = |bytes: &[u8], out: &mut Vec<u8>, hasher: &mut Sha1Writer| {
        hasher.update(bytes);
        out.extend_from_slice(bytes);
    };

    emit(&[0xff, 0x74, 0x4f, 0x63, 0, 0, 0, 2], &mut out, &mut hasher);

    let mut fanout = [0u32; 256];
    for e in &sorted {
        fanout[e.entry.hash.as_bytes()[0] as usize] += 1;
    }
    for i in 1..fanout.len() {
        fanout[i] += fanout[i - 1];
    }
    for count in fanout {
        emit(&count.to_be_bytes(), &mut out, &mut hasher);
    }

    for e in &sorted {
        emit(e.entry.hash.as_bytes(), &mut out, &mut hasher);
    }
    for e in &sorted {
        emit(&e.crc32.to_be_bytes(), &mut out, &mut hasher);
    }
    for e in &sorted {
        emit(&e.offset.to_be_bytes(), &mut out, &mut hasher);
    }

    emit(pack_hash.as_bytes(), &mut out, &mut hasher);
    let idx_hash = hasher.finalize();
    out.extend_from_slice(&idx_hash);
    out
}
