//! Face-based polyhedral mesh.
//!
//! The mesh is the collaborator the refinement engine edits: points, faces
//! (ordered point loops with an owner cell and an optional neighbour cell) and
//! cells implied by the faces that reference them.
//!
//! # Conventions
//! - Internal faces come first, ordered by `(owner, neighbour)` with
//!   `owner < neighbour`.
//! - Boundary faces follow, grouped by patch in patch order.
//! - A face loop is oriented so its right-hand normal points out of the owner.
//! - On a processor patch both ranks list the shared faces in the same order;
//!   the rank holding the other side stores each loop reversed with the same
//!   first point.
//!
//! [`crate::topology::validation::check_topology`] verifies all of these.

use crate::mesh_error::MeshError;
use crate::topology::ids::{CellId, FaceId, GlobalPointId, PatchId, PointId};
use crate::topology::validation::check_topology;
use itertools::Itertools;
use std::ops::Range;

/// A polygonal face.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Face {
    /// Point loop; the right-hand normal points out of `owner`.
    pub points: Vec<PointId>,
    /// Cell on the back side of the normal.
    pub owner: CellId,
    /// Cell on the front side, `None` for boundary faces.
    pub neighbour: Option<CellId>,
    /// Boundary patch, `None` for internal faces.
    pub patch: Option<PatchId>,
}

impl Face {
    /// Creates an internal face.
    pub fn internal(points: Vec<PointId>, owner: CellId, neighbour: CellId) -> Self {
        Self {
            points,
            owner,
            neighbour: Some(neighbour),
            patch: None,
        }
    }

    /// Creates a boundary face on `patch`.
    pub fn boundary(points: Vec<PointId>, owner: CellId, patch: PatchId) -> Self {
        Self {
            points,
            owner,
            neighbour: None,
            patch: Some(patch),
        }
    }

    /// `true` when the face separates two local cells.
    pub fn is_internal(&self) -> bool {
        self.neighbour.is_some()
    }

    /// Directed edges of the loop, closing back to the first point.
    pub fn edges(&self) -> impl Iterator<Item = (PointId, PointId)> + '_ {
        self.points.iter().copied().circular_tuple_windows()
    }

    /// The cell on the other side of `cell`, if any.
    pub fn other_cell(&self, cell: CellId) -> Option<CellId> {
        if self.owner == cell {
            self.neighbour
        } else if self.neighbour == Some(cell) {
            Some(self.owner)
        } else {
            None
        }
    }

    /// The loop as seen from `cell`: outward for owner and neighbour alike.
    pub fn loop_outward_from(&self, cell: CellId) -> Vec<PointId> {
        if self.owner == cell {
            self.points.clone()
        } else {
            reverse_loop(&self.points)
        }
    }
}

/// Reverses a loop while keeping its first point in place.
pub fn reverse_loop(points: &[PointId]) -> Vec<PointId> {
    let mut out = Vec::with_capacity(points.len());
    if let Some((&first, rest)) = points.split_first() {
        out.push(first);
        out.extend(rest.iter().rev().copied());
    }
    out
}

/// Kind of boundary patch.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PatchKind {
    /// Physical boundary.
    Wall,
    /// Coupled boundary shared with another rank.
    Processor {
        /// Rank holding the other side.
        neighbour_rank: usize,
    },
}

/// A named group of boundary faces.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Patch {
    /// Patch name.
    pub name: String,
    /// Patch kind.
    pub kind: PatchKind,
}

impl Patch {
    /// Creates a physical boundary patch.
    pub fn wall(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PatchKind::Wall,
        }
    }

    /// Creates a processor patch coupled to `neighbour_rank`.
    pub fn processor(name: impl Into<String>, neighbour_rank: usize) -> Self {
        Self {
            name: name.into(),
            kind: PatchKind::Processor { neighbour_rank },
        }
    }

    /// Rank on the other side when this is a processor patch.
    pub fn neighbour_rank(&self) -> Option<usize> {
        match self.kind {
            PatchKind::Processor { neighbour_rank } => Some(neighbour_rank),
            PatchKind::Wall => None,
        }
    }
}

/// Unstructured polyhedral mesh.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolyMesh {
    points: Vec<[f64; 3]>,
    point_global: Vec<GlobalPointId>,
    faces: Vec<Face>,
    patches: Vec<Patch>,
    n_cells: usize,
}

impl PolyMesh {
    /// Builds a mesh whose global point ids equal the local indices.
    ///
    /// # Errors
    /// [`MeshError::TopologyCorruption`] when the arrays violate the
    /// conventions listed in the module docs.
    pub fn new(
        points: Vec<[f64; 3]>,
        faces: Vec<Face>,
        patches: Vec<Patch>,
        n_cells: usize,
    ) -> Result<Self, MeshError> {
        let point_global = (0..points.len() as u64).collect();
        Self::with_global_ids(points, point_global, faces, patches, n_cells)
    }

    /// Builds a mesh with explicit global point identities.
    pub fn with_global_ids(
        points: Vec<[f64; 3]>,
        point_global: Vec<GlobalPointId>,
        faces: Vec<Face>,
        patches: Vec<Patch>,
        n_cells: usize,
    ) -> Result<Self, MeshError> {
        if point_global.len() != points.len() {
            return Err(MeshError::input(format!(
                "{} global ids for {} points",
                point_global.len(),
                points.len()
            )));
        }
        let mesh = Self::from_parts_unchecked(points, point_global, faces, patches, n_cells);
        check_topology(&mesh)?;
        Ok(mesh)
    }

    pub(crate) fn from_parts_unchecked(
        points: Vec<[f64; 3]>,
        point_global: Vec<GlobalPointId>,
        faces: Vec<Face>,
        patches: Vec<Patch>,
        n_cells: usize,
    ) -> Self {
        Self {
            points,
            point_global,
            faces,
            patches,
            n_cells,
        }
    }

    pub fn n_points(&self) -> usize {
        self.points.len()
    }

    pub fn n_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    /// Number of leading internal faces.
    pub fn n_internal_faces(&self) -> usize {
        self.faces.iter().take_while(|f| f.is_internal()).count()
    }

    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    pub fn point(&self, p: PointId) -> [f64; 3] {
        self.points[p.index()]
    }

    pub fn point_globals(&self) -> &[GlobalPointId] {
        &self.point_global
    }

    pub fn point_global(&self, p: PointId) -> GlobalPointId {
        self.point_global[p.index()]
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    pub fn face(&self, f: FaceId) -> &Face {
        &self.faces[f.index()]
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn cells(&self) -> impl Iterator<Item = CellId> + use<> {
        (0..self.n_cells).map(CellId::new)
    }

    /// Contiguous face range of `patch`.
    pub fn patch_range(&self, patch: PatchId) -> Range<usize> {
        let start = self
            .faces
            .iter()
            .position(|f| f.patch.is_some_and(|p| p >= patch))
            .unwrap_or(self.faces.len());
        let len = self.faces[start..]
            .iter()
            .take_while(|f| f.patch == Some(patch))
            .count();
        start..start + len
    }

    /// Processor patches with their neighbour rank.
    pub fn processor_patches(&self) -> impl Iterator<Item = (PatchId, usize)> + '_ {
        self.patches
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.neighbour_rank().map(|r| (PatchId::new(i), r)))
    }

    /// Faces of every cell, in face order.
    pub fn cell_faces(&self) -> Vec<Vec<FaceId>> {
        let mut out = vec![Vec::with_capacity(6); self.n_cells];
        for (i, face) in self.faces.iter().enumerate() {
            out[face.owner.index()].push(FaceId::new(i));
            if let Some(nei) = face.neighbour {
                out[nei.index()].push(FaceId::new(i));
            }
        }
        out
    }

    /// Faces using every point.
    pub fn point_faces(&self) -> Vec<Vec<FaceId>> {
        let mut out = vec![Vec::new(); self.points.len()];
        for (i, face) in self.faces.iter().enumerate() {
            for p in &face.points {
                out[p.index()].push(FaceId::new(i));
            }
        }
        out
    }

    /// Sorted, unique points of `cell`.
    pub fn cell_points(&self, cell_faces: &[FaceId]) -> Vec<PointId> {
        cell_faces
            .iter()
            .flat_map(|f| self.faces[f.index()].points.iter().copied())
            .sorted_unstable()
            .dedup()
            .collect()
    }

    /// Face neighbours of every cell through internal faces.
    pub fn cell_cells(&self) -> Vec<Vec<CellId>> {
        let mut out = vec![Vec::new(); self.n_cells];
        for face in &self.faces {
            if let Some(nei) = face.neighbour {
                out[face.owner.index()].push(nei);
                out[nei.index()].push(face.owner);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::block_mesh;

    #[test]
    fn reverse_keeps_first_point() {
        let loop_ = [0, 1, 2, 3].map(PointId::new);
        let rev = reverse_loop(&loop_);
        assert_eq!(rev, [0, 3, 2, 1].map(PointId::new).to_vec());
    }

    #[test]
    fn outward_loop_reverses_for_neighbour() {
        let face = Face::internal([0, 1, 2, 3].map(PointId::new).to_vec(), CellId::new(0), CellId::new(1));
        assert_eq!(face.loop_outward_from(CellId::new(0)), face.points);
        assert_eq!(
            face.loop_outward_from(CellId::new(1)),
            reverse_loop(&face.points)
        );
        assert_eq!(face.other_cell(CellId::new(1)), Some(CellId::new(0)));
        assert_eq!(face.other_cell(CellId::new(5)), None);
    }

    #[test]
    fn block_addressing() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        assert_eq!(mesh.n_cells(), 2);
        assert_eq!(mesh.n_points(), 12);
        assert_eq!(mesh.n_faces(), 11);
        assert_eq!(mesh.n_internal_faces(), 1);
        let cell_faces = mesh.cell_faces();
        assert!(cell_faces.iter().all(|f| f.len() == 6));
        assert_eq!(mesh.cell_points(&cell_faces[0]).len(), 8);
        assert_eq!(mesh.cell_cells()[0], vec![CellId::new(1)]);
        let walls = mesh.patch_range(PatchId::new(0));
        assert_eq!(walls.len(), 10);
    }
}
