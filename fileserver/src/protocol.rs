//! Binary wire protocol for file transfer messages.
//!
//! Every packet on the wire is an 8-byte little-endian body length followed
//! by the body. Body fields are big-endian integers; variable-length fields
//! are a 7-bit varint byte count followed by the raw bytes.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Frame header length: the `i64` body size prefix.
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest accepted packet body (50 MiB). Anything larger is treated as a
/// corrupt or hostile stream.
pub const MAX_PACKAGE_SIZE: i64 = 50 * 1024 * 1024;

/// Commands and responses carried in the body's leading `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgType {
    UploadReq = 1,
    UploadResp = 2,
    DownloadReq = 3,
    DownloadResp = 4,
}

impl MsgType {
    pub fn from_i32(value: i32) -> Option<MsgType> {
        match value {
            1 => Some(MsgType::UploadReq),
            2 => Some(MsgType::UploadResp),
            3 => Some(MsgType::DownloadReq),
            4 => Some(MsgType::DownloadResp),
            _ => None,
        }
    }
}

/// Transfer status codes carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TransferCode {
    Unknown = 0,
    InProgress = 1,
    Complete = 2,
    NotExist = 3,
}

/// Client link classification; decides the download chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NetType {
    Broadband = 0,
    Cellular = 1,
}

impl NetType {
    pub fn from_i32(value: i32) -> NetType {
        if value == 1 {
            NetType::Cellular
        } else {
            NetType::Broadband
        }
    }

    /// Bytes served per download response.
    pub fn chunk_size(&self) -> i64 {
        match self {
            NetType::Broadband => 512 * 1024,
            NetType::Cellular => 64 * 1024,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated field")]
    Truncated,
    #[error("malformed varint length")]
    BadVarint,
    #[error("field of {got} bytes exceeds limit {limit}")]
    FieldTooLong { got: u64, limit: u64 },
}

/// Sequential reader over one packet body.
pub struct StreamReader<'a> {
    buf: &'a [u8],
}

impl<'a> StreamReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        StreamReader { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        if self.buf.remaining() < 4 {
            return Err(ProtocolError::Truncated);
        }
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        if self.buf.remaining() < 8 {
            return Err(ProtocolError::Truncated);
        }
        Ok(self.buf.get_i64())
    }

    /// Read a varint-prefixed byte string. `max_len` of zero means
    /// unbounded (the frame size already caps it).
    pub fn read_bytes(&mut self, max_len: u64) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_varint()?;
        if max_len > 0 && len > max_len {
            return Err(ProtocolError::FieldTooLong {
                got: len,
                limit: max_len,
            });
        }
        let len = len as usize;
        if self.buf.remaining() < len {
            return Err(ProtocolError::Truncated);
        }
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(bytes)
    }

    /// Decode a 7-bit varint (1-10 bytes, little-endian groups).
    fn read_varint(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            if self.buf.remaining() == 0 {
                return Err(ProtocolError::Truncated);
            }
            if shift >= 64 {
                return Err(ProtocolError::BadVarint);
            }
            let byte = self.buf.get_u8();
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

/// Builder for one packet body.
#[derive(Default)]
pub struct StreamWriter {
    buf: BytesMut,
}

impl StreamWriter {
    pub fn new() -> Self {
        StreamWriter {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        write_varint(bytes.len() as u64, &mut self.buf);
        self.buf.put_slice(bytes);
        self
    }

    /// Finish the body and wrap it in the length-prefixed frame.
    pub fn into_frame(self) -> Vec<u8> {
        let body = self.buf;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as i64).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    pub fn body_len(&self) -> usize {
        self.buf.len()
    }
}

fn write_varint(mut value: u64, out: &mut BytesMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_round_trip_big_endian() {
        let mut writer = StreamWriter::new();
        writer.write_i32(-7).write_i64(1 << 40);
        let frame = writer.into_frame();

        // Skip the little-endian length prefix.
        assert_eq!(&frame[..FRAME_HEADER_LEN], &12i64.to_le_bytes()[..]);
        let mut reader = StreamReader::new(&frame[FRAME_HEADER_LEN..]);
        assert_eq!(reader.read_i32().unwrap(), -7);
        assert_eq!(reader.read_i64().unwrap(), 1 << 40);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_bytes_round_trip() {
        let payload = vec![0xaa; 300];
        let mut writer = StreamWriter::new();
        writer.write_bytes(b"md5-key").write_bytes(&payload);
        let frame = writer.into_frame();

        let mut reader = StreamReader::new(&frame[FRAME_HEADER_LEN..]);
        assert_eq!(reader.read_bytes(64).unwrap(), b"md5-key");
        assert_eq!(reader.read_bytes(0).unwrap(), payload);
    }

    #[test]
    fn test_varint_boundary_values() {
        for len in [0usize, 1, 127, 128, 300, 16_383, 16_384] {
            let payload = vec![7u8; len];
            let mut writer = StreamWriter::new();
            writer.write_bytes(&payload);
            let frame = writer.into_frame();
            let mut reader = StreamReader::new(&frame[FRAME_HEADER_LEN..]);
            assert_eq!(reader.read_bytes(0).unwrap().len(), len);
        }
    }

    #[test]
    fn test_truncated_fields_rejected() {
        let mut reader = StreamReader::new(&[0, 0, 1]);
        assert_eq!(reader.read_i32(), Err(ProtocolError::Truncated));

        let mut reader = StreamReader::new(&[5, b'a', b'b']);
        assert_eq!(reader.read_bytes(0), Err(ProtocolError::Truncated));

        // Varint that never terminates.
        let mut reader = StreamReader::new(&[0x80; 11]);
        assert!(matches!(
            reader.read_bytes(0),
            Err(ProtocolError::BadVarint) | Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_field_length_limit_enforced() {
        let mut writer = StreamWriter::new();
        writer.write_bytes(&[1u8; 100]);
        let frame = writer.into_frame();
        let mut reader = StreamReader::new(&frame[FRAME_HEADER_LEN..]);
        assert_eq!(
            reader.read_bytes(64),
            Err(ProtocolError::FieldTooLong {
                got: 100,
                limit: 64
            })
        );
    }

    #[test]
    fn test_msg_type_mapping() {
        assert_eq!(MsgType::from_i32(1), Some(MsgType::UploadReq));
        assert_eq!(MsgType::from_i32(4), Some(MsgType::DownloadResp));
        assert_eq!(MsgType::from_i32(0), None);
        assert_eq!(MsgType::from_i32(99), None);
    }

    #[test]
    fn test_net_type_chunk_sizes() {
        assert_eq!(NetType::from_i32(0).chunk_size(), 512 * 1024);
        assert_eq!(NetType::from_i32(1).chunk_size(), 64 * 1024);
        // Unknown values fall back to broadband.
        assert_eq!(NetType::from_i32(42), NetType::Broadband);
    }
}
