//! Fixed, versioned, little-endian wire types for processor-boundary rounds.
//!
//! Every message is a [`WireHdr`], a [`WireCount`] and `count` records of one
//! Pod type. Per-face messages have the patch face count on both sides, so
//! receive buffers are sized with [`message_len`]. Lists whose length only
//! the sender knows are preceded by a [`KIND_COUNT`] message
//! ([`crate::algs::communicator::exchange_records`]).

use crate::mesh_error::MeshError;
use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Tag of the per-round level exchange on processor patches.
pub const TAG_LEVELS: u16 = 0x4c56;
/// Tag of the post-commit processor patch comparison.
pub const TAG_PATCH_CHECK: u16 = 0x5043;
/// Tag of the global "anything changed" reduction.
pub const TAG_REDUCE: u16 = 0x5244;
/// Tag of the split edge rounds while planning a refinement.
pub const TAG_SPLIT_EDGES: u16 = 0x5345;
/// Tag of the removal candidate rounds while planning a merge.
pub const TAG_MERGE_POINTS: u16 = 0x4d50;

pub const KIND_FACE_LEVELS: u16 = 1;
pub const KIND_COUNT: u16 = 2;
pub const KIND_PATCH_FACES: u16 = 3;
pub const KIND_FLAG: u16 = 4;
pub const KIND_SPLIT_EDGES: u16 = 5;
pub const KIND_POINTS: u16 = 6;

// All multi-byte integers in these structs are **little-endian** on the wire.
// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,  // = WIRE_VERSION.to_le()
    pub kind_le: u16,     // KIND_*
    pub reserved_le: u32, // future use; keep zero
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32, // count of following records
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// Level state of the cell next to one processor face, as seen from the
/// sending rank.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireFaceLevel {
    /// Current level of the cell.
    pub level_le: u32,
    /// `FLAG_*` bits.
    pub flags_le: u32,
}

/// The cell may still be added to the refine set.
pub const FLAG_REFINABLE: u32 = 1;
/// The cell is in the refine set.
pub const FLAG_REFINE: u32 = 2;
/// The cell belongs to a sibling group selected for unrefinement.
pub const FLAG_UNREFINE: u32 = 4;

impl WireFaceLevel {
    pub fn new(level: u32, flags: u32) -> Self {
        Self {
            level_le: level.to_le(),
            flags_le: flags.to_le(),
        }
    }
    pub fn level(&self) -> u32 {
        u32::from_le(self.level_le)
    }
    fn flags(&self) -> u32 {
        u32::from_le(self.flags_le)
    }
    pub fn refinable(&self) -> bool {
        self.flags() & FLAG_REFINABLE != 0
    }
    pub fn refine(&self) -> bool {
        self.flags() & FLAG_REFINE != 0
    }
    pub fn unrefine(&self) -> bool {
        self.flags() & FLAG_UNREFINE != 0
    }
    /// Level the cell will have once the cycle is committed.
    pub fn new_level(&self) -> u32 {
        (self.level() + u32::from(self.refine())).saturating_sub(u32::from(self.unrefine()))
    }
}

/// Shape summary of one processor face, compared across ranks after a commit.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WirePatchFace {
    pub first_global_le: u64,
    pub n_points_le: u32,
    pub reserved_le: u32,
}

impl WirePatchFace {
    pub fn new(n_points: usize, first_global: u64) -> Self {
        Self {
            first_global_le: first_global.to_le(),
            n_points_le: (n_points as u32).to_le(),
            reserved_le: 0,
        }
    }
    pub fn n_points(&self) -> usize {
        u32::from_le(self.n_points_le) as usize
    }
    pub fn first_global(&self) -> u64 {
        u64::from_le(self.first_global_le)
    }
}

/// An edge that gets a mid point, by the sorted global ids of its ends.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireEdge {
    pub lo_le: u64,
    pub hi_le: u64,
    /// Level of the mid point.
    pub level_le: u32,
    pub reserved_le: u32,
}

impl WireEdge {
    pub fn new(a: u64, b: u64, level: u32) -> Self {
        Self {
            lo_le: a.min(b).to_le(),
            hi_le: a.max(b).to_le(),
            level_le: level.to_le(),
            reserved_le: 0,
        }
    }
    pub fn ends(&self) -> (u64, u64) {
        (u64::from_le(self.lo_le), u64::from_le(self.hi_le))
    }
    pub fn level(&self) -> u32 {
        u32::from_le(self.level_le)
    }
}

/// A point by global id.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WirePoint {
    pub global_le: u64,
}

impl WirePoint {
    pub fn new(global: u64) -> Self {
        Self {
            global_le: global.to_le(),
        }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.global_le)
    }
}

/// A single boolean, used by the global reduction.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireFlag {
    pub value_le: u32,
}

impl WireFlag {
    pub fn new(value: bool) -> Self {
        Self {
            value_le: u32::from(value).to_le(),
        }
    }
    pub fn get(&self) -> bool {
        u32::from_le(self.value_le) != 0
    }
}

/// Byte length of a message carrying `n` records of `T`.
pub fn message_len<T: Pod>(n: usize) -> usize {
    size_of::<WireHdr>() + size_of::<WireCount>() + n * size_of::<T>()
}

/// Encode header, count and records into one buffer.
pub fn encode<T: Pod>(kind: u16, records: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message_len::<T>(records.len()));
    out.extend_from_slice(bytemuck::bytes_of(&WireHdr::new(kind)));
    out.extend_from_slice(bytemuck::bytes_of(&WireCount::new(records.len())));
    out.extend_from_slice(cast_slice(records));
    out
}

/// Decode a buffer produced by [`encode`], checking version, kind and length.
pub fn decode<T: Pod>(kind: u16, bytes: &[u8]) -> Result<Vec<T>, MeshError> {
    let hdr_len = size_of::<WireHdr>();
    let count_len = size_of::<WireCount>();
    if bytes.len() < hdr_len + count_len {
        return Err(MeshError::CommError(format!(
            "message of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let hdr: WireHdr = bytemuck::pod_read_unaligned(&bytes[..hdr_len]);
    if hdr.version() != WIRE_VERSION {
        return Err(MeshError::CommError(format!(
            "wire version {} (expected {WIRE_VERSION})",
            hdr.version()
        )));
    }
    if hdr.kind() != kind {
        return Err(MeshError::CommError(format!(
            "message kind {} (expected {kind})",
            hdr.kind()
        )));
    }
    let count: WireCount = bytemuck::pod_read_unaligned(&bytes[hdr_len..hdr_len + count_len]);
    let body = &bytes[hdr_len + count_len..];
    expect_exact_len(body.len(), count.get() * size_of::<T>())?;
    Ok(body
        .chunks_exact(size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), MeshError> {
    if actual == expected {
        Ok(())
    } else {
        Err(MeshError::CommError(format!(
            "expected {expected} bytes, got {actual}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_eq_size;

    assert_eq_size!(WireHdr, u64);
    assert_eq_size!(WireFaceLevel, u64);
    assert_eq_size!(WirePatchFace, [u64; 2]);
    assert_eq_size!(WireEdge, [u64; 3]);
    assert_eq_size!(WirePoint, u64);

    #[test]
    fn edges_are_stored_sorted() {
        let bytes = encode(KIND_SPLIT_EDGES, &[WireEdge::new(9, 4, 2)]);
        let back: Vec<WireEdge> = decode(KIND_SPLIT_EDGES, &bytes).unwrap();
        assert_eq!(back[0].ends(), (4, 9));
        assert_eq!(back[0].level(), 2);
    }

    #[test]
    fn face_levels_survive_encoding() {
        let records = [
            WireFaceLevel::new(3, FLAG_REFINABLE | FLAG_REFINE),
            WireFaceLevel::new(2, FLAG_UNREFINE),
        ];
        let bytes = encode(KIND_FACE_LEVELS, &records);
        assert_eq!(bytes.len(), message_len::<WireFaceLevel>(2));
        let back: Vec<WireFaceLevel> = decode(KIND_FACE_LEVELS, &bytes).unwrap();
        assert_eq!(back[0].level(), 3);
        assert!(back[0].refinable());
        assert_eq!(back[0].new_level(), 4);
        assert!(!back[1].refinable());
        assert_eq!(back[1].new_level(), 1);
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let bytes = encode(KIND_FLAG, &[WireFlag::new(true)]);
        let err = decode::<WireFlag>(KIND_FACE_LEVELS, &bytes).unwrap_err();
        assert!(matches!(err, MeshError::CommError(_)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut bytes = encode(KIND_PATCH_FACES, &[WirePatchFace::new(4, 17)]);
        bytes.truncate(bytes.len() - 1);
        assert!(decode::<WirePatchFace>(KIND_PATCH_FACES, &bytes).is_err());
    }
}
