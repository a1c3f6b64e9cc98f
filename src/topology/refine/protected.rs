//! Cells excluded from refinement and unrefinement.

use crate::mesh_error::MeshError;
use crate::topology::hex;
use crate::topology::ids::CellId;
use crate::topology::mesh::PolyMesh;
use crate::topology::refine::levels::RefinementLevelState;

/// Read-only bitset over cells. A protected cell never changes level.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProtectedCells {
    bits: Vec<bool>,
}

impl ProtectedCells {
    /// Nothing protected.
    pub fn none(n_cells: usize) -> Self {
        Self {
            bits: vec![false; n_cells],
        }
    }

    pub fn from_mask(mask: Vec<bool>) -> Self {
        Self { bits: mask }
    }

    /// Protect `cells` out of `n_cells`.
    pub fn from_cells(n_cells: usize, cells: &[CellId]) -> Result<Self, MeshError> {
        let mut bits = vec![false; n_cells];
        for c in cells {
            *bits
                .get_mut(c.index())
                .ok_or_else(|| MeshError::input(format!("protected cell {c} out of range")))? = true;
        }
        Ok(Self { bits })
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn contains(&self, cell: CellId) -> bool {
        self.bits.get(cell.index()).copied().unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = CellId> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .map(|(c, _)| CellId::new(c))
    }

    /// Union with `other`; the result has the larger length.
    pub fn union(&self, other: &ProtectedCells) -> ProtectedCells {
        let n = self.len().max(other.len());
        let bits = (0..n)
            .map(|c| self.contains(CellId::new(c)) || other.contains(CellId::new(c)))
            .collect();
        ProtectedCells { bits }
    }

    /// Error unless sized for `mesh`.
    pub fn check_size(&self, mesh: &PolyMesh) -> Result<(), MeshError> {
        if self.len() != mesh.n_cells() {
            return Err(MeshError::input(format!(
                "protected set covers {} cells, mesh has {}",
                self.len(),
                mesh.n_cells()
            )));
        }
        Ok(())
    }
}

/// Cells the splitter cannot handle: anything that is not a hexahedron with
/// exactly 8 anchors at its level.
pub fn protect_unrefinable(mesh: &PolyMesh, levels: &RefinementLevelState) -> ProtectedCells {
    let cell_faces = mesh.cell_faces();
    let bits: Vec<bool> = mesh
        .cells()
        .map(|c| {
            hex::analyse(
                mesh,
                c,
                &cell_faces[c.index()],
                levels.cell_level(c),
                levels.point_levels(),
            )
            .is_err()
        })
        .collect();
    let protected = ProtectedCells { bits };
    if protected.count() > 0 {
        log::debug!("{} cells are not refinable hexahedra", protected.count());
    }
    protected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::block_mesh;

    #[test]
    fn from_cells_checks_range() {
        let p = ProtectedCells::from_cells(4, &[CellId::new(1), CellId::new(3)]).unwrap();
        assert!(p.contains(CellId::new(3)));
        assert!(!p.contains(CellId::new(0)));
        assert_eq!(p.count(), 2);
        assert_eq!(p.iter().collect::<Vec<_>>(), vec![CellId::new(1), CellId::new(3)]);
        assert!(ProtectedCells::from_cells(4, &[CellId::new(4)]).is_err());
    }

    #[test]
    fn block_cells_are_all_refinable() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let levels = RefinementLevelState::for_mesh(&mesh);
        assert_eq!(protect_unrefinable(&mesh, &levels).count(), 0);
    }

    #[test]
    fn wrong_levels_protect_the_cell() {
        let mesh = block_mesh([1, 1, 1], [1.0; 3]).unwrap();
        let mut point_level = vec![0; 8];
        point_level[7] = 1;
        let levels = RefinementLevelState::from_levels(vec![0], point_level);
        let p = protect_unrefinable(&mesh, &levels);
        assert!(p.contains(CellId::new(0)));
    }
}
