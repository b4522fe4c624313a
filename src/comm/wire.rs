//! Fixed, versioned, little-endian wire types for control traffic.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::{align_of, size_of};

use crate::pio_error::PioError;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Decode a vector of `T` from an arbitrary (possibly unaligned) byte buffer.
pub fn vec_from_bytes<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, PioError> {
    let width = size_of::<T>();
    if width == 0 || bytes.len() % width != 0 {
        return Err(PioError::Internal(format!(
            "payload of {} bytes is not a whole number of {width}-byte records",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(width)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

/// Decode exactly one `T`.
pub fn read_one<T: Pod>(bytes: &[u8]) -> Result<T, PioError> {
    expect_exact_len(bytes.len(), size_of::<T>())?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), PioError> {
    if actual == expected {
        Ok(())
    } else {
        Err(PioError::Internal(format!(
            "expected {expected} bytes, got {actual}"
        )))
    }
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// All multi-byte integers in these structs are **little-endian** on the wire.
/// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

// ===== Common records ======================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// Status code plus one value, broadcast from a root so every member of a
/// scope observes the same outcome.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireStatus {
    pub code_le: i32,
    pub _pad: u32,
    pub value_le: i64,
}

impl WireStatus {
    pub fn new(code: i32, value: i64) -> Self {
        Self {
            code_le: code.to_le(),
            _pad: 0,
            value_le: value.to_le(),
        }
    }
    pub fn code(&self) -> i32 {
        i32::from_le(self.code_le)
    }
    pub fn value(&self) -> i64 {
        i64::from_le(self.value_le)
    }
}

// ===== Async service envelope ==============================================

/// Header preceding every async service request.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireMsgHdr {
    pub version_le: u16,
    pub tag_le: u16,
    pub comp_idx_le: u32,
    pub seq_le: u64,
    pub prev_tag_le: u16,
    pub reserved_le: u16, // keep zero
    pub payload_len_le: u32,
}

impl WireMsgHdr {
    pub const SIZE: usize = 24;

    pub fn new(tag: u16, comp_idx: u32, seq: u64, prev_tag: u16, payload_len: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            tag_le: tag.to_le(),
            comp_idx_le: comp_idx.to_le(),
            seq_le: seq.to_le(),
            prev_tag_le: prev_tag.to_le(),
            reserved_le: 0,
            payload_len_le: (payload_len as u32).to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn tag(&self) -> u16 {
        u16::from_le(self.tag_le)
    }
    pub fn comp_idx(&self) -> u32 {
        u32::from_le(self.comp_idx_le)
    }
    pub fn seq(&self) -> u64 {
        u64::from_le(self.seq_le)
    }
    pub fn prev_tag(&self) -> u16 {
        u16::from_le(self.prev_tag_le)
    }
    pub fn payload_len(&self) -> usize {
        u32::from_le(self.payload_len_le) as usize
    }
}

// ===== Intercomm handshake =================================================

/// Leader-to-leader record exchanged while building an inter-group channel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHandshake {
    pub context_le: u32,
    pub high_le: u32,
    pub group_len_le: u64,
}

impl WireHandshake {
    pub fn new(context: u32, high: bool, group_len: usize) -> Self {
        Self {
            context_le: context.to_le(),
            high_le: (high as u32).to_le(),
            group_len_le: (group_len as u64).to_le(),
        }
    }
    pub fn context(&self) -> u32 {
        u32::from_le(self.context_le)
    }
    pub fn high(&self) -> bool {
        u32::from_le(self.high_le) != 0
    }
    pub fn group_len(&self) -> usize {
        u64::from_le(self.group_len_le) as usize
    }
}

// ===== Rearranger records ==================================================

/// One global offset (0-based) in a transfer list.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireOffset(pub u64);

impl WireOffset {
    pub fn of(off: u64) -> Self {
        Self(off.to_le())
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.0)
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireStatus>(), 16);
const_assert_eq!(size_of::<WireMsgHdr>(), WireMsgHdr::SIZE);
const_assert_eq!(align_of::<WireMsgHdr>(), 8);
const_assert_eq!(size_of::<WireHandshake>(), 16);
const_assert_eq!(size_of::<WireOffset>(), 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_msg_hdr() {
        let h = WireMsgHdr::new(5, 2, 1031, 4, 77);
        let bytes = cast_slice(&[h]).to_vec();
        let back: WireMsgHdr = read_one(&bytes).unwrap();
        assert_eq!(back.version(), WIRE_VERSION);
        assert_eq!(back.tag(), 5);
        assert_eq!(back.comp_idx(), 2);
        assert_eq!(back.seq(), 1031);
        assert_eq!(back.prev_tag(), 4);
        assert_eq!(back.payload_len(), 77);
    }

    #[test]
    fn unaligned_offsets_decode() {
        let offs = [WireOffset::of(3), WireOffset::of(1 << 40)];
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(cast_slice(&offs));
        let back: Vec<WireOffset> = vec_from_bytes(&bytes[1..]).unwrap();
        assert_eq!(back[1].get(), 1 << 40);
    }

    #[test]
    fn ragged_payload_is_rejected() {
        assert!(vec_from_bytes::<WireOffset>(&[0u8; 9]).is_err());
        assert!(read_one::<WireStatus>(&[0u8; 4]).is_err());
    }
}
