//! In-memory pack encoder.
//!
//! Builds a version-2 packfile from undeltified entries: 12-byte header, one
//! varint-headed zlib stream per object, 20-byte SHA-1 trailer. The encoder
//! deduplicates by object id so walk code can insert freely, and it can either
//! stream chunks through an async channel (the pull path) or produce the whole
//! pack as bytes (the splice path, which writes it to a file afterward).

use std::collections::HashSet;
use std::io::Write;

use flate2::{Compression, write::ZlibEncoder};
use tokio::sync::mpsc;

use crate::{
    errors::GitError, hash::ObjectId, internal::pack::entry::Entry, utils::Sha1Writer,
};

const PACK_MAGIC: &[u8; 4] = b"PACK";
const PACK_VERSION: u32 = 2;

#[derive(Default)]
pub struct PackEncoder {
    entries: Vec<Entry>,
    seen: HashSet<ObjectId>,
}

impl PackEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, ignoring duplicates. Returns whether it was new.
    pub fn insert(&mut self, entry: Entry) -> bool {
        if !self.seen.insert(entry.hash) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode everything into one buffer. Returns the pack bytes and the
    /// trailer hash (which names the pack on disk: `pack-<hash>.pack`).
    pub fn encode(self) -> Result<(Vec<u8>, ObjectId), GitError> {
        let mut out = Vec::new();
        let mut hasher = Sha1Writer::new();

        let mut emit = |bytes: &[u8], out: &mut Vec<u8>, hasher: &mut Sha1Writer| {
            hasher.update(bytes);
            out.extend_from_slice(bytes);
        };

        emit(PACK_MAGIC, &mut out, &mut hasher);
        emit(&PACK_VERSION.to_be_bytes(), &mut out, &mut hasher);
        emit(
            &(self.entries.len() as u32).to_be_bytes(),
            &mut out,
            &mut hasher,
        );

        for entry in &self.entries {
            let header = object_header(entry.obj_type.to_pack_type_u8(), entry.data.len());
            emit(&header, &mut out, &mut hasher);

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&entry.data)?;
            let compressed = encoder.finish()?;
            emit(&compressed, &mut out, &mut hasher);
        }

        let trailer = ObjectId::new(hasher.finalize());
        out.extend_from_slice(trailer.as_bytes());
        Ok((out, trailer))
    }

    /// Encode and stream the pack through `tx` in bounded chunks so the
    /// response body never holds the whole pack at once.
    pub async fn encode_to(self, tx: mpsc::Sender<Vec<u8>>) -> Result<ObjectId, GitError> {
        const CHUNK: usize = 64 * 1024;
        let (bytes, trailer) = self.encode()?;
        for chunk in bytes.chunks(CHUNK) {
            tx.send(chunk.to_vec()).await.map_err(|_| {
                GitError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pack receiver dropped",
                ))
            })?;
        }
        Ok(trailer)
    }
}

/// Varint object header: low nibble of the size shares the first byte with
/// the 3-bit type, remaining size bits follow seven at a time.
fn object_header(obj_type: u8, size: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(4);
    let mut size = size as u64;
    let mut byte = ((obj_type & 0x07) << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        header.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    header.push(byte);
    header
}
