//! Wire protocol for the object storage server.
//!
//! Every request and every response starts with a fixed 80-byte header;
//! payload bytes (if any) follow immediately on the stream. All integers
//! are little-endian.
//!
//! Header layout:
//!
//! ```text
//! offset size field
//! 0      32   object id (4 x u64, word 0 first)
//! 32     8    payload length
//! 40     8    request id / response id (echoed back to the client)
//! 48     2    request type / response type
//! 50     30   reserved, must be zero
//! ```
//!
//! A SET request is followed by `payload_length` object bytes. A GET carries
//! no body; its `payload_length` is the maximum number of payload bytes the
//! client wants back. A DUPLICATE is followed by exactly 32 bytes naming the
//! source object id; the header's object id is the destination.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of an encoded request or response header.
pub const HEADER_SIZE: usize = 80;

/// Size of an object id on the wire (4 x u64).
pub const OBJECT_ID_SIZE: usize = 32;

const RESERVED_SIZE: usize = 30;

// =============================================================================
// Object identifiers
// =============================================================================

/// A 256-bit client-chosen object name, stored as four 64-bit words.
///
/// Ordering is lexicographic on the word array; equality is bitwise.
/// Distinct identifiers may share payload storage (see the register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub [u64; 4]);

impl ObjectId {
    fn put(&self, buf: &mut BytesMut) {
        for word in self.0 {
            buf.put_u64_le(word);
        }
    }

    fn get(buf: &mut impl Buf) -> Self {
        let mut words = [0u64; 4];
        for word in &mut words {
            *word = buf.get_u64_le();
        }
        Self(words)
    }

    /// Decode an id from its 32-byte wire form.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        anyhow::ensure!(
            buf.len() == OBJECT_ID_SIZE,
            "object id must be {} bytes, got {}",
            OBJECT_ID_SIZE,
            buf.len()
        );
        let mut buf = buf;
        Ok(Self::get(&mut buf))
    }

    /// Encode an id into its 32-byte wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OBJECT_ID_SIZE);
        self.put(&mut buf);
        buf.freeze()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:016x}{:016x}{:016x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

// =============================================================================
// Request / response types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestType {
    SetObject = 1,
    GetObject = 2,
    DeleteObject = 3,
    DuplicateObject = 4,
}

impl RequestType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::SetObject),
            2 => Some(Self::GetObject),
            3 => Some(Self::DeleteObject),
            4 => Some(Self::DuplicateObject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseType {
    SetOk = 1,
    GetOk = 2,
    DeleteOk = 3,
    DeleteNotExists = 4,
    DuplicateOk = 5,
}

impl ResponseType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::SetOk),
            2 => Some(Self::GetOk),
            3 => Some(Self::DeleteOk),
            4 => Some(Self::DeleteNotExists),
            5 => Some(Self::DuplicateOk),
            _ => None,
        }
    }
}

// =============================================================================
// Headers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub object_id: ObjectId,
    pub payload_length: u64,
    pub request_id: u64,
    pub request_type: RequestType,
}

impl RequestHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.object_id.put(&mut buf);
        buf.put_u64_le(self.payload_length);
        buf.put_u64_le(self.request_id);
        buf.put_u16_le(self.request_type as u16);
        buf.put_bytes(0, RESERVED_SIZE);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut buf = checked_header(buf)?;
        let object_id = ObjectId::get(&mut buf);
        let payload_length = buf.get_u64_le();
        let request_id = buf.get_u64_le();
        let raw = buf.get_u16_le();
        let request_type =
            RequestType::from_u16(raw).with_context(|| format!("unknown request type {raw}"))?;
        reserved_must_be_zero(buf)?;

        Ok(Self {
            object_id,
            payload_length,
            request_id,
            request_type,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub object_id: ObjectId,
    pub payload_length: u64,
    pub response_id: u64,
    pub response_type: ResponseType,
}

impl ResponseHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.object_id.put(&mut buf);
        buf.put_u64_le(self.payload_length);
        buf.put_u64_le(self.response_id);
        buf.put_u16_le(self.response_type as u16);
        buf.put_bytes(0, RESERVED_SIZE);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut buf = checked_header(buf)?;
        let object_id = ObjectId::get(&mut buf);
        let payload_length = buf.get_u64_le();
        let response_id = buf.get_u64_le();
        let raw = buf.get_u16_le();
        let response_type =
            ResponseType::from_u16(raw).with_context(|| format!("unknown response type {raw}"))?;
        reserved_must_be_zero(buf)?;

        Ok(Self {
            object_id,
            payload_length,
            response_id,
            response_type,
        })
    }
}

fn checked_header(buf: &[u8]) -> Result<&[u8]> {
    anyhow::ensure!(
        buf.len() == HEADER_SIZE,
        "header must be {} bytes, got {}",
        HEADER_SIZE,
        buf.len()
    );
    Ok(buf)
}

fn reserved_must_be_zero(buf: &[u8]) -> Result<()> {
    anyhow::ensure!(
        buf.iter().all(|&b| b == 0),
        "nonzero bytes in reserved header region"
    );
    Ok(())
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read one request header from the stream.
///
/// Returns `None` on a clean end-of-stream at a header boundary. End-of-stream
/// in the middle of a header, and any decode failure, are errors.
pub async fn read_request_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<RequestHeader>> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;

    while filled < HEADER_SIZE {
        let n = r
            .read(&mut buf[filled..])
            .await
            .context("failed to read request header")?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            anyhow::bail!(
                "connection closed mid-header ({filled} of {HEADER_SIZE} bytes read)"
            );
        }
        filled += n;
    }

    RequestHeader::decode(&buf).map(Some)
}

/// Read an exact-length payload body following a request header.
pub async fn read_payload<R: AsyncRead + Unpin>(r: &mut R, len: usize) -> Result<Bytes> {
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("failed to read request payload")?;
    Ok(Bytes::from(payload))
}

/// Write a response header and its payload as one logical frame.
pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    header: &ResponseHeader,
    payload: &[u8],
) -> Result<()> {
    debug_assert_eq!(header.payload_length as usize, payload.len());

    let encoded = header.encode();
    w.write_all(&encoded)
        .await
        .context("failed to write response header")?;
    if !payload.is_empty() {
        w.write_all(payload)
            .await
            .context("failed to write response payload")?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
