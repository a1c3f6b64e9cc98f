//! Sharing the last committed mesh with readers.
//!
//! Writers build a new [`PolyMesh`] off to the side and swap it in with
//! [`SharedMesh::publish`]. Readers holding an older snapshot keep a
//! consistent view for as long as they hold the `Arc`.

use crate::topology::mesh::PolyMesh;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug)]
pub struct SharedMesh {
    current: RwLock<Arc<PolyMesh>>,
    generation: RwLock<u64>,
}

impl SharedMesh {
    pub fn new(mesh: PolyMesh) -> Self {
        Self {
            current: RwLock::new(Arc::new(mesh)),
            generation: RwLock::new(0),
        }
    }

    /// The committed mesh.
    pub fn snapshot(&self) -> Arc<PolyMesh> {
        Arc::clone(&self.current.read())
    }

    /// Number of publishes so far.
    pub fn generation(&self) -> u64 {
        *self.generation.read()
    }

    /// Replace the committed mesh and return the previous one.
    pub fn publish(&self, mesh: PolyMesh) -> Arc<PolyMesh> {
        let mut generation = self.generation.write();
        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(mesh));
        *generation += 1;
        log::debug!("published mesh generation {}", *generation);
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::block_mesh;

    #[test]
    fn readers_keep_their_snapshot() {
        let shared = SharedMesh::new(block_mesh([1, 1, 1], [1.0; 3]).unwrap());
        let before = shared.snapshot();
        let old = shared.publish(block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap());
        assert!(Arc::ptr_eq(&before, &old));
        assert_eq!(before.n_cells(), 1);
        assert_eq!(shared.snapshot().n_cells(), 2);
        assert_eq!(shared.generation(), 1);
    }
}
