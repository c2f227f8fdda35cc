//! Pkt-line framing.
//!
//! Every smart-protocol message is a sequence of length-prefixed records:
//! `LLLL<payload>` where `LLLL` is four hex digits covering the whole record.
//! `0000` is the flush sentinel separating protocol phases; `0004` is a valid
//! record with an empty payload and is *not* a flush. End of stream is a third
//! distinct outcome so consumers can loop until either flush or EOF.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::GitError;

/// Largest total record length, header included.
pub const MAX_PKT_LEN: usize = 65520;

/// Largest payload a single pkt-line can carry.
pub const MAX_PKT_PAYLOAD: usize = MAX_PKT_LEN - 4;

/// The literal flush record.
pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// One record read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A payload-carrying record; `Data(Bytes::new())` is the `0004` record.
    Data(Bytes),
    /// The `0000` sentinel.
    Flush,
    /// Clean end of stream at a record boundary.
    Eof,
}

impl PktLine {
    pub fn is_flush(&self) -> bool {
        matches!(self, PktLine::Flush)
    }
}

/// Read one pkt-line from the front of `bytes`, consuming it.
///
/// An empty buffer is `Eof`. A truncated header or payload, a non-hex length,
/// and the impossible lengths 1..=3 are all framing errors.
pub fn read_pkt_line(bytes: &mut Bytes) -> Result<PktLine, GitError> {
    if bytes.is_empty() {
        return Ok(PktLine::Eof);
    }
    if bytes.len() < 4 {
        return Err(GitError::bad_request("truncated pkt-line header"));
    }

    let header = bytes.copy_to_bytes(4);
    let header_str = std::str::from_utf8(&header)
        .map_err(|_| GitError::bad_request("pkt-line length is not hex"))?;
    let pkt_len = usize::from_str_radix(header_str, 16)
        .map_err(|_| GitError::bad_request(format!("invalid pkt-line length `{header_str}`")))?;

    if pkt_len == 0 {
        return Ok(PktLine::Flush);
    }
    if pkt_len < 4 {
        return Err(GitError::bad_request(format!(
            "invalid pkt-line length {pkt_len}"
        )));
    }

    let data_len = pkt_len - 4;
    if bytes.len() < data_len {
        return Err(GitError::bad_request(format!(
            "pkt-line needs {data_len} payload bytes, stream has {}",
            bytes.len()
        )));
    }
    Ok(PktLine::Data(bytes.copy_to_bytes(data_len)))
}

/// Append one pkt-line record carrying `payload`.
pub fn write_pkt_line(buf: &mut BytesMut, payload: &[u8]) -> Result<(), GitError> {
    if payload.len() > MAX_PKT_PAYLOAD {
        return Err(GitError::bad_request(format!(
            "pkt-line payload of {} bytes exceeds the {MAX_PKT_PAYLOAD} byte maximum",
            payload.len()
        )));
    }
    buf.put(format!("{:04x}", payload.len() + 4).as_bytes());
    buf.put(payload);
    Ok(())
}

/// Append one pkt-line record from a string payload.
pub fn write_pkt_line_string(buf: &mut BytesMut, payload: impl AsRef<str>) -> Result<(), GitError> {
    write_pkt_line(buf, payload.as_ref().as_bytes())
}

/// Append the flush sentinel.
pub fn write_flush(buf: &mut BytesMut) {
    buf.put(&FLUSH_PKT[..]);
}

/// Buffered pkt-line writer for the record-oriented sections of a response.
#[derive(Default)]
pub struct PktWriter {
    buf: BytesMut,
}

impl PktWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn write_line(&mut self, payload: &[u8]) -> Result<(), GitError> {
        write_pkt_line(&mut self.buf, payload)
    }

    pub fn write_str(&mut self, payload: impl AsRef<str>) -> Result<(), GitError> {
        write_pkt_line_string(&mut self.buf, payload)
    }

    pub fn flush(&mut self) {
        write_flush(&mut self.buf);
    }

    /// Terminate the stream with one final flush and yield the bytes.
    pub fn close(mut self) -> Bytes {
        self.flush();
        self.buf.freeze()
    }

    /// Yield the bytes written so far without a terminating flush.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_round_trip() {
        let mut buf = BytesMut::new();
        write_pkt_line_string(&mut buf, "want 0123\n").unwrap();
        let mut bytes = buf.freeze();
        match read_pkt_line(&mut bytes).unwrap() {
            PktLine::Data(data) => assert_eq!(&data[..], b"want 0123\n"),
            other => panic!("expected data, got {other:?}"),
        }
        assert_eq!(read_pkt_line(&mut bytes).unwrap(), PktLine::Eof);
    }

    /// `0004` and `0000` must stay distinguishable.
    #[test]
    fn test_empty_payload_is_not_flush() {
        let mut buf = BytesMut::new();
        write_pkt_line(&mut buf, b"").unwrap();
        write_flush(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(read_pkt_line(&mut bytes).unwrap(), PktLine::Data(Bytes::new()));
        assert_eq!(read_pkt_line(&mut bytes).unwrap(), PktLine::Flush);
    }

    #[test]
    fn test_lengths_below_four_are_errors() {
        for header in [b"0001", b"0002", b"0003"] {
            let mut bytes = Bytes::copy_from_slice(header);
            assert!(read_pkt_line(&mut bytes).is_err());
        }
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut bytes = Bytes::from_static(b"000asho"); // claims 6 payload bytes, has 3
        assert!(read_pkt_line(&mut bytes).is_err());
    }

    #[test]
    fn test_non_hex_length_is_error() {
        let mut bytes = Bytes::from_static(b"zzzzpayload");
        assert!(read_pkt_line(&mut bytes).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        let payload = vec![b'a'; MAX_PKT_PAYLOAD + 1];
        assert!(write_pkt_line(&mut buf, &payload).is_err());
        assert!(write_pkt_line(&mut buf, &payload[..MAX_PKT_PAYLOAD]).is_ok());
    }

    #[test]
    fn test_writer_close_appends_flush() {
        let mut writer = PktWriter::new();
        writer.write_str("unpack ok\n").unwrap();
        let bytes = writer.close();
        assert!(bytes.ends_with(FLUSH_PKT));
    }

    quickcheck::quickcheck! {
        /// pkt_read(pkt_write(x)) == x for every payload that fits one record.
        fn prop_round_trip(payload: Vec<u8>) -> bool {
            if payload.len() > MAX_PKT_PAYLOAD {
                return true;
            }
            let mut buf = BytesMut::new();
            write_pkt_line(&mut buf, &payload).unwrap();
            let mut bytes = buf.freeze();
            matches!(read_pkt_line(&mut bytes), Ok(PktLine::Data(data)) if data[..] == payload[..])
        }
    }
}
