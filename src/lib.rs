#![cfg_attr(docsrs, feature(doc_cfg))]
//! # hexref
//!
//! hexref adapts unstructured polyhedral finite-volume meshes at runtime by
//! splitting hexahedral cells 2x2x2 and merging the eight children back into
//! their parent. It keeps face neighbours within one refinement level of each
//! other, remembers every split so unrefinement is the exact inverse, and
//! carries field data across each change.
//!
//! ## Features
//! - Octant analysis of hanging-node hexahedra and a batch splitter that
//!   shares edge and face mids between neighbouring cells
//! - A split history with explicit parent/child records and a versioned
//!   checkpoint format
//! - 2:1 balancing across internal and processor faces, with serial,
//!   thread-backed and MPI communicators
//! - One atomic edit script per batch, applied into a new mesh with OpenFOAM
//!   style face ordering
//! - Copy, gradient-corrected, averaged and injected field transfer
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! hexref = "0.1"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! Most users drive everything through [`adapt::DynamicRefineMesh`]: hand it a
//! mesh, register fields, and call `update` with an error indicator once per
//! time step. The lower layers ([`topology::refine`], [`topology::coarsen`],
//! [`topology::apply`]) are public for callers that schedule changes
//! themselves.
//!
//! ## Determinism
//!
//! New points take a global id derived from the global ids they were
//! interpolated from, so ranks sharing a processor face create the same
//! points in the same order without talking to each other.

pub mod adapt;
pub mod algs;
pub mod debug_invariants;
pub mod geometry;
pub mod mesh_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::adapt::{CycleReport, DynamicRefineMesh, DynamicRefineOptions};
    pub use crate::algs::communicator::{Communicator, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::field_transfer::{
        CellField, FieldRegistry, MergeTransfer, PointField, RefineTransfer, TransferOptions,
    };
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::geometry::MeshGeometry;
    pub use crate::mesh_error::MeshError;
    pub use crate::topology::adapt::{AdaptivityOptions, Candidates};
    pub use crate::topology::apply::{MeshMap, apply};
    pub use crate::topology::ids::{CellId, FaceId, PatchId, PointId};
    pub use crate::topology::mesh::{Face, Patch, PolyMesh};
    pub use crate::topology::refine::levels::{RecordId, RefinementLevelState};
    pub use crate::topology::refine::protected::ProtectedCells;
    pub use crate::topology::snapshot::SharedMesh;
}
