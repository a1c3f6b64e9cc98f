//! Topology edit scripts.
//!
//! A [`TopologyEditScript`] is an ordered list of primitive edits against one
//! committed mesh. It never touches the mesh itself: the applier
//! ([`crate::topology::apply::apply`]) consumes the script and builds the next
//! mesh in one step.
//!
//! Edits name entities by *edit identity*: an old entity keeps its index and
//! the `k`-th entity added by the script is `n_old + k`. The `add_*` builders
//! return the identity of the new entity so later edits can reference it.

use crate::topology::ids::{CellId, FaceId, GlobalPointId, PatchId, PointId};
use crate::topology::mesh::PolyMesh;

/// One primitive topology change.
#[derive(Clone, Debug, PartialEq)]
pub enum TopologyEdit {
    AddPoint {
        position: [f64; 3],
        /// Point whose data the new point inherits by default.
        master: Option<PointId>,
        /// Old points the position was interpolated from.
        stencil: Vec<PointId>,
        global: GlobalPointId,
        level: u32,
    },
    AddFace {
        points: Vec<PointId>,
        owner: CellId,
        neighbour: Option<CellId>,
        patch: Option<PatchId>,
        /// Face the new face was split from; `None` for faces created inside
        /// a cell.
        master: Option<FaceId>,
        /// The loop runs against the orientation of `master`.
        flip: bool,
    },
    AddCell {
        master: Option<CellId>,
    },
    ModifyFace {
        face: FaceId,
        points: Vec<PointId>,
        owner: CellId,
        neighbour: Option<CellId>,
        patch: Option<PatchId>,
        /// The loop runs against the face's current orientation.
        flip: bool,
    },
    RemoveCell {
        cell: CellId,
        merge_into: Option<CellId>,
    },
    RemoveFace {
        face: FaceId,
        /// Surviving face that absorbs this one.
        merge_into: Option<FaceId>,
    },
    RemovePoint {
        point: PointId,
    },
}

/// Ordered edits against a mesh with known entity counts.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyEditScript {
    n_old_points: usize,
    n_old_faces: usize,
    n_old_cells: usize,
    n_added_points: usize,
    n_added_faces: usize,
    n_added_cells: usize,
    edits: Vec<TopologyEdit>,
}

impl TopologyEditScript {
    /// Empty script against `mesh`.
    pub fn new(mesh: &PolyMesh) -> Self {
        Self {
            n_old_points: mesh.n_points(),
            n_old_faces: mesh.n_faces(),
            n_old_cells: mesh.n_cells(),
            n_added_points: 0,
            n_added_faces: 0,
            n_added_cells: 0,
            edits: Vec::new(),
        }
    }

    pub fn n_old_points(&self) -> usize {
        self.n_old_points
    }
    pub fn n_old_faces(&self) -> usize {
        self.n_old_faces
    }
    pub fn n_old_cells(&self) -> usize {
        self.n_old_cells
    }
    pub fn n_added_points(&self) -> usize {
        self.n_added_points
    }
    pub fn n_added_faces(&self) -> usize {
        self.n_added_faces
    }
    pub fn n_added_cells(&self) -> usize {
        self.n_added_cells
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn edits(&self) -> &[TopologyEdit] {
        &self.edits
    }

    pub fn into_edits(self) -> Vec<TopologyEdit> {
        self.edits
    }

    /// `true` when `p` names a point added by this script.
    pub fn is_added_point(&self, p: PointId) -> bool {
        p.index() >= self.n_old_points
    }

    pub fn add_point(
        &mut self,
        position: [f64; 3],
        master: Option<PointId>,
        stencil: Vec<PointId>,
        global: GlobalPointId,
        level: u32,
    ) -> PointId {
        let id = PointId::new(self.n_old_points + self.n_added_points);
        self.n_added_points += 1;
        self.edits.push(TopologyEdit::AddPoint {
            position,
            master,
            stencil,
            global,
            level,
        });
        id
    }

    pub fn add_face(
        &mut self,
        points: Vec<PointId>,
        owner: CellId,
        neighbour: Option<CellId>,
        patch: Option<PatchId>,
        master: Option<FaceId>,
        flip: bool,
    ) -> FaceId {
        let id = FaceId::new(self.n_old_faces + self.n_added_faces);
        self.n_added_faces += 1;
        self.edits.push(TopologyEdit::AddFace {
            points,
            owner,
            neighbour,
            patch,
            master,
            flip,
        });
        id
    }

    pub fn add_cell(&mut self, master: Option<CellId>) -> CellId {
        let id = CellId::new(self.n_old_cells + self.n_added_cells);
        self.n_added_cells += 1;
        self.edits.push(TopologyEdit::AddCell { master });
        id
    }

    pub fn modify_face(
        &mut self,
        face: FaceId,
        points: Vec<PointId>,
        owner: CellId,
        neighbour: Option<CellId>,
        patch: Option<PatchId>,
        flip: bool,
    ) {
        self.edits.push(TopologyEdit::ModifyFace {
            face,
            points,
            owner,
            neighbour,
            patch,
            flip,
        });
    }

    pub fn remove_cell(&mut self, cell: CellId, merge_into: Option<CellId>) {
        self.edits.push(TopologyEdit::RemoveCell { cell, merge_into });
    }

    pub fn remove_face(&mut self, face: FaceId, merge_into: Option<FaceId>) {
        self.edits.push(TopologyEdit::RemoveFace { face, merge_into });
    }

    pub fn remove_point(&mut self, point: PointId) {
        self.edits.push(TopologyEdit::RemovePoint { point });
    }
}
