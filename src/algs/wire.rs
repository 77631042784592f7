//! Fixed, versioned, little-endian wire types for queue traffic.
//!
//! A *frame* carries the messages one block queued for one neighbor:
//!
//! ```text
//! WireFrameHdr | (WireLen | bytes) * count
//! ```
//!
//! The same header layout (with a different `kind`) is used for the
//! synchronous exchange and the asynchronous exchange. iexchange control
//! traffic travels as a single [`WireToken`].

use crate::block_error::BlockError;
use crate::topology::gid::Gid;
use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Frame kinds.
pub const KIND_EXCHANGE: u16 = 1;
pub const KIND_IEXCHANGE: u16 = 2;

/// All multi-byte integers in these structs are **little-endian** on the wire.
/// We store them pre-LE with `.to_le()` and decode with `.from_le()`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireFrameHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub count_le: u32,
    pub from_le: u64,
    pub to_le: u64,
    pub round_le: u64,
}

impl WireFrameHdr {
    pub fn new(kind: u16, from: Gid, to: Gid, round: u64, count: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            count_le: (count as u32).to_le(),
            from_le: (from.get() as u64).to_le(),
            to_le: (to.get() as u64).to_le(),
            round_le: round.to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn count(&self) -> usize {
        u32::from_le(self.count_le) as usize
    }
    pub fn from(&self) -> Gid {
        Gid::new(u64::from_le(self.from_le) as usize)
    }
    pub fn to(&self) -> Gid {
        Gid::new(u64::from_le(self.to_le) as usize)
    }
    pub fn round(&self) -> u64 {
        u64::from_le(self.round_le)
    }
}

/// Length prefix of one message inside a frame.
#[repr(transparent)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireLen(pub u32);

/// Termination token (`kind == TOKEN`) or terminate notice (`kind == TERMINATE`).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireToken {
    pub kind_le: u32,
    pub black_le: u32,
    pub count_le: i64,
}

impl WireToken {
    pub const TOKEN: u32 = 1;
    pub const TERMINATE: u32 = 2;

    pub fn token(black: bool, count: i64) -> Self {
        Self {
            kind_le: Self::TOKEN.to_le(),
            black_le: u32::from(black).to_le(),
            count_le: count.to_le(),
        }
    }
    pub fn terminate() -> Self {
        Self {
            kind_le: Self::TERMINATE.to_le(),
            black_le: 0,
            count_le: 0,
        }
    }
    pub fn kind(&self) -> u32 {
        u32::from_le(self.kind_le)
    }
    pub fn black(&self) -> bool {
        u32::from_le(self.black_le) != 0
    }
    pub fn count(&self) -> i64 {
        i64::from_le(self.count_le)
    }
    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }
    pub fn from_bytes(buf: &[u8]) -> Result<Self, String> {
        expect_exact_len(buf.len(), size_of::<Self>())?;
        Ok(bytemuck::pod_read_unaligned(buf))
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireFrameHdr>(), 32);
const_assert_eq!(size_of::<WireLen>(), 4);
const_assert_eq!(size_of::<WireToken>(), 16);

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

/// Serialize one queue into a frame.
pub fn encode_frame<'a, I>(kind: u16, from: Gid, to: Gid, round: u64, msgs: I) -> Vec<u8>
where
    I: ExactSizeIterator<Item = &'a Bytes>,
{
    let hdr = WireFrameHdr::new(kind, from, to, round, msgs.len());
    let mut out = bytemuck::bytes_of(&hdr).to_vec();
    for m in msgs {
        out.extend_from_slice(bytemuck::bytes_of(&WireLen((m.len() as u32).to_le())));
        out.extend_from_slice(m);
    }
    out
}

/// Parse a frame produced by [`encode_frame`]; `src` is only used for errors.
pub fn decode_frame(src: usize, buf: &[u8]) -> Result<(WireFrameHdr, Vec<Bytes>), BlockError> {
    let hdr_len = size_of::<WireFrameHdr>();
    if buf.len() < hdr_len {
        return Err(BlockError::comm(
            src,
            format!("frame of {} bytes is shorter than its header", buf.len()),
        ));
    }
    let hdr: WireFrameHdr = bytemuck::pod_read_unaligned(&buf[..hdr_len]);
    if hdr.version() != WIRE_VERSION {
        return Err(BlockError::comm(
            src,
            format!("wire version {} (expected {WIRE_VERSION})", hdr.version()),
        ));
    }
    let data = Bytes::copy_from_slice(&buf[hdr_len..]);
    let mut msgs = Vec::with_capacity(hdr.count());
    let mut pos = 0;
    for i in 0..hdr.count() {
        let len_end = pos + size_of::<WireLen>();
        if len_end > data.len() {
            return Err(BlockError::comm(src, format!("frame truncated before message {i}")));
        }
        let len: WireLen = bytemuck::pod_read_unaligned(&data[pos..len_end]);
        let end = len_end + u32::from_le(len.0) as usize;
        if end > data.len() {
            return Err(BlockError::comm(src, format!("frame truncated inside message {i}")));
        }
        msgs.push(data.slice(len_end..end));
        pos = end;
    }
    if pos != data.len() {
        return Err(BlockError::comm(
            src,
            format!("{} trailing bytes after {} messages", data.len() - pos, hdr.count()),
        ));
    }
    Ok((hdr, msgs))
}
