//! Mesh topology and its changes.
//!
//! This module provides the polyhedral mesh, the edit scripts that change it
//! and the refinement machinery built on top:
//! - strong ids and the mesh itself ([`ids`], [`mesh`])
//! - octant analysis of hexahedra ([`hex`])
//! - edit scripts, their applier and post-commit checks ([`edit`], [`apply`],
//!   [`validation`])
//! - splitting, merging and candidate selection ([`refine`], [`coarsen`],
//!   [`adapt`])
//!
//! Most users will interact with [`crate::adapt::DynamicRefineMesh`] rather
//! than with these pieces directly.

pub mod adapt;
pub mod apply;
pub mod coarsen;
pub mod edit;
pub mod hex;
pub mod ids;
pub mod mesh;
pub mod refine;
pub mod snapshot;
pub mod validation;

pub use ids::{CellId, FaceId, PatchId, PointId};
pub use mesh::{Face, Patch, PatchKind, PolyMesh};
