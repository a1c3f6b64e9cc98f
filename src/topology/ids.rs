//! Strong, zero-cost index handles for mesh entities.
//!
//! A polyhedral mesh stores points, faces and cells in contiguous zero-based
//! arrays, so each entity is identified by its index. The newtypes here keep
//! the three index spaces apart at compile time: a face index can never be
//! passed where a cell index is expected.
//!
//! Indices are only stable *between* topology commits. Inside a
//! [`crate::topology::edit::TopologyEditScript`] the same types double as
//! edit identities: indices below the old entity count name old entities,
//! indices at or above it name entities added by the script.

use std::fmt;

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
        )]
        #[repr(transparent)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Wraps a raw index.
            #[inline]
            pub const fn new(raw: usize) -> Self {
                $name(raw as u32)
            }

            /// Returns the raw index, suitable for slicing.
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0).finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "{}"), self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(raw: usize) -> Self {
                $name::new(raw)
            }
        }

        /// `u32` layout on the wire and in MPI buffers.
        #[cfg(feature = "mpi-support")]
        unsafe impl mpi::datatype::Equivalence for $name {
            type Out = <u32 as mpi::datatype::Equivalence>::Out;

            fn equivalent_datatype() -> Self::Out {
                u32::equivalent_datatype()
            }
        }
    };
}

index_type!(
    /// Index of a mesh point (vertex).
    PointId,
    "p"
);
index_type!(
    /// Index of a mesh face.
    FaceId,
    "f"
);
index_type!(
    /// Index of a mesh cell.
    CellId,
    "c"
);
index_type!(
    /// Index of a boundary patch.
    PatchId,
    "patch"
);

/// Global identity of a point across a decomposed mesh.
///
/// Original points carry whatever identity the decomposition assigned (below
/// [`DERIVED_GLOBAL_BIT`]); points created by refinement derive theirs from the
/// global ids of the points they were interpolated from, so two ranks that
/// create the same point independently agree on its identity.
pub type GlobalPointId = u64;

/// Marks global ids produced by [`derive_global_id`].
pub const DERIVED_GLOBAL_BIT: u64 = 1 << 63;

/// Deterministically mixes a sorted stencil of global ids into a new id.
///
/// The caller passes the defining ids in ascending order; the result only
/// depends on that sequence, never on local indices.
pub fn derive_global_id(sorted_stencil: &[GlobalPointId]) -> GlobalPointId {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15 ^ sorted_stencil.len() as u64;
    for &id in sorted_stencil {
        state = splitmix(state ^ id);
    }
    state | DERIVED_GLOBAL_BIT
}

fn splitmix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod layout_tests {
    use super::*;
    use static_assertions::assert_eq_size;

    assert_eq_size!(PointId, u32);
    assert_eq_size!(FaceId, u32);
    assert_eq_size!(CellId, u32);
    assert_eq_size!(Option<CellId>, u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trip() {
        let c = CellId::new(42);
        assert_eq!(c.index(), 42);
        assert_eq!(CellId::from(42usize), c);
    }

    #[test]
    fn debug_and_display() {
        let f = FaceId::new(7);
        assert_eq!(format!("{f:?}"), "FaceId(7)");
        assert_eq!(format!("{f}"), "f7");
        assert_eq!(format!("{}", CellId::new(3)), "c3");
    }

    #[test]
    fn serde_is_transparent() {
        let p = PointId::new(123);
        let s = serde_json::to_string(&p).unwrap();
        assert_eq!(s, "123");
        let back: PointId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn derived_ids_depend_only_on_stencil() {
        let a = derive_global_id(&[3, 9]);
        let b = derive_global_id(&[3, 9]);
        assert_eq!(a, b);
        assert_ne!(a, derive_global_id(&[3, 10]));
        assert_ne!(derive_global_id(&[1, 2, 3, 4]), derive_global_id(&[1, 2, 3]));
        assert!(a & DERIVED_GLOBAL_BIT != 0);
    }
}
