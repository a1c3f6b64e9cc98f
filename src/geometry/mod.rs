//! Geometry utilities for hexref.
//!
//! Face area vectors and centroids, cell volumes and centroids, used by the
//! field remapper for gradient correction and volume-weighted averaging.

pub mod metrics;

pub use metrics::MeshGeometry;
