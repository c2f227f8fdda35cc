//! Shared I/O utilities: exact reads, byte counting, and a SHA-1 writer used
//! by the pack encoder and indexer to hash bytes as they stream past.

use std::{
    io,
    io::{BufRead, Read},
};

use sha1::{Digest, Sha1};

pub fn read_bytes(file: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// A lightweight wrapper that counts bytes read from the underlying reader.
pub struct CountingReader<R> {
    pub inner: R,
    pub bytes_read: u64,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.bytes_read += amt as u64;
        self.inner.consume(amt);
    }
}

/// Streaming SHA-1 state exposed through `std::io::Write` so pack and idx
/// writers can tee their output into the trailer hash.
#[derive(Clone, Default)]
pub struct Sha1Writer {
    inner: Sha1,
}

impl Sha1Writer {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> [u8; 20] {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        bytes
    }
}

impl io::Write for Sha1Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
