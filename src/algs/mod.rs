//! Re-export public algorithms.

pub mod communicator;
pub mod field_transfer;
pub mod meshgen;
pub mod wire;

pub use communicator::Communicator;
pub use meshgen::{block_mesh, decomposed_box, structured_box};
