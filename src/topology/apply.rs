//! Committing edit scripts.
//!
//! [`apply`] turns a committed mesh plus a [`TopologyEditScript`] into the next
//! committed mesh and the [`MeshMap`] relating the two. The input mesh is never
//! touched, so a failed commit leaves the caller with the previous state.
//!
//! Renumbering keeps surviving entities in their old order and appends added
//! entities in the order the script created them. Faces are then re-sorted to
//! the mesh conventions: internal faces by `(owner, neighbour)`, boundary faces
//! by patch, each kept face immediately followed by the faces split off it.

use crate::mesh_error::MeshError;
use crate::topology::edit::{TopologyEdit, TopologyEditScript};
use crate::topology::ids::{CellId, FaceId, GlobalPointId, PatchId, PointId};
use crate::topology::mesh::{Face, PolyMesh, reverse_loop};
use crate::topology::validation::check_topology;

/// Old ↔ new addressing produced by one commit.
///
/// `*_map` vectors are indexed by new entity and give the old entity it
/// originates from (itself, or the master of an added entity). `reverse_*`
/// vectors are indexed by old entity; `None` marks a removed entity.
/// `added_*` vectors give the new index of the `k`-th added entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshMap {
    pub n_old_points: usize,
    pub n_old_faces: usize,
    pub n_old_cells: usize,

    pub point_map: Vec<Option<PointId>>,
    pub reverse_point_map: Vec<Option<PointId>>,
    pub added_points: Vec<PointId>,
    /// Refinement level carried by each added point.
    pub added_point_levels: Vec<u32>,
    /// Old points each new point is interpolated from.
    pub points_from_points: Vec<Vec<PointId>>,

    pub face_map: Vec<Option<FaceId>>,
    pub reverse_face_map: Vec<Option<FaceId>>,
    pub added_faces: Vec<FaceId>,
    /// The new face is oriented against the face it originates from.
    pub flip_map: Vec<bool>,
    /// Old faces merged into each new face (itself first when it survived).
    pub faces_from_faces: Vec<Vec<FaceId>>,

    pub cell_map: Vec<Option<CellId>>,
    pub reverse_cell_map: Vec<Option<CellId>>,
    pub added_cells: Vec<CellId>,
    /// Old cells merged into each new cell (itself first when it survived).
    pub cells_from_cells: Vec<Vec<CellId>>,
}

impl MeshMap {
    /// New index of an edit identity, `None` if it was removed.
    pub fn resolve_point(&self, p: PointId) -> Option<PointId> {
        resolve(p.index(), &self.reverse_point_map, &self.added_points)
    }

    pub fn resolve_face(&self, f: FaceId) -> Option<FaceId> {
        resolve(f.index(), &self.reverse_face_map, &self.added_faces)
    }

    pub fn resolve_cell(&self, c: CellId) -> Option<CellId> {
        resolve(c.index(), &self.reverse_cell_map, &self.added_cells)
    }

    /// New cells originating from `old` (itself and cells added with it as
    /// master), in new index order.
    pub fn children_of(&self, old: CellId) -> Vec<CellId> {
        self.cell_map
            .iter()
            .enumerate()
            .filter(|(_, origin)| **origin == Some(old))
            .map(|(c, _)| CellId::new(c))
            .collect()
    }

    pub fn n_points(&self) -> usize {
        self.point_map.len()
    }
    pub fn n_faces(&self) -> usize {
        self.face_map.len()
    }
    pub fn n_cells(&self) -> usize {
        self.cell_map.len()
    }
}

fn resolve<T: Copy>(edit: usize, reverse: &[Option<T>], added: &[T]) -> Option<T> {
    if edit < reverse.len() {
        reverse[edit]
    } else {
        added.get(edit - reverse.len()).copied()
    }
}

struct AddedPoint {
    position: [f64; 3],
    master: Option<PointId>,
    stencil: Vec<PointId>,
    global: GlobalPointId,
    level: u32,
}

struct PendingFace {
    face: Face,
    flip: bool,
    origin: Option<FaceId>,
    seq: usize,
}

/// Commit `script` against `mesh`.
///
/// # Errors
/// - [`MeshError::Invariant`] when the script references entities that do not
///   exist or were removed, removes or modifies an entity twice, or leaves a
///   face without a valid owner.
/// - [`MeshError::TopologyCorruption`] when the committed mesh fails
///   [`check_topology`].
pub fn apply(
    mesh: &PolyMesh,
    script: TopologyEditScript,
) -> Result<(PolyMesh, MeshMap), MeshError> {
    let (n_p, n_f, n_c) = (
        script.n_old_points(),
        script.n_old_faces(),
        script.n_old_cells(),
    );
    if (n_p, n_f, n_c) != (mesh.n_points(), mesh.n_faces(), mesh.n_cells()) {
        return Err(MeshError::invariant(format!(
            "script was built for a mesh with {n_p} points, {n_f} faces, {n_c} cells"
        )));
    }

    let mut point_removed = vec![false; n_p];
    let mut face_removed = vec![false; n_f];
    let mut cell_removed = vec![false; n_c];
    let mut cell_merge: Vec<(CellId, CellId)> = Vec::new();
    let mut face_merge: Vec<(FaceId, FaceId)> = Vec::new();
    let mut modified: Vec<Option<Face>> = vec![None; n_f];
    let mut new_points: Vec<AddedPoint> = Vec::new();
    let mut modified_flip: Vec<bool> = vec![false; n_f];
    let mut new_faces: Vec<(Face, Option<FaceId>, bool)> = Vec::new();
    let mut new_cells: Vec<Option<CellId>> = Vec::new();

    let old_point = |p: PointId, what: &str| {
        if p.index() < n_p {
            Ok(())
        } else {
            Err(MeshError::invariant(format!("{what} {p} is not an old point")))
        }
    };

    for edit in script.into_edits() {
        match edit {
            TopologyEdit::AddPoint {
                position,
                master,
                stencil,
                global,
                level,
            } => {
                if let Some(m) = master {
                    old_point(m, "point master")?;
                }
                for &s in &stencil {
                    old_point(s, "stencil point")?;
                }
                new_points.push(AddedPoint {
                    position,
                    master,
                    stencil,
                    global,
                    level,
                });
            }
            TopologyEdit::AddFace {
                points,
                owner,
                neighbour,
                patch,
                master,
                flip,
            } => {
                if master.is_some_and(|m| m.index() >= n_f) {
                    return Err(MeshError::invariant("face master must be an old face"));
                }
                new_faces.push((
                    Face {
                        points,
                        owner,
                        neighbour,
                        patch,
                    },
                    master,
                    flip,
                ));
            }
            TopologyEdit::AddCell { master } => {
                if master.is_some_and(|m| m.index() >= n_c) {
                    return Err(MeshError::invariant("cell master must be an old cell"));
                }
                new_cells.push(master);
            }
            TopologyEdit::ModifyFace {
                face,
                points,
                owner,
                neighbour,
                patch,
                flip,
            } => {
                let slot = modified
                    .get_mut(face.index())
                    .ok_or_else(|| MeshError::invariant(format!("modify of unknown face {face}")))?;
                if slot.is_some() {
                    return Err(MeshError::invariant(format!("face {face} modified twice")));
                }
                *slot = Some(Face {
                    points,
                    owner,
                    neighbour,
                    patch,
                });
                modified_flip[face.index()] = flip;
            }
            TopologyEdit::RemoveCell { cell, merge_into } => {
                mark_removed(&mut cell_removed, cell.index(), "cell")?;
                if let Some(target) = merge_into {
                    cell_merge.push((cell, target));
                }
            }
            TopologyEdit::RemoveFace { face, merge_into } => {
                mark_removed(&mut face_removed, face.index(), "face")?;
                if let Some(target) = merge_into {
                    face_merge.push((face, target));
                }
            }
            TopologyEdit::RemovePoint { point } => {
                mark_removed(&mut point_removed, point.index(), "point")?;
            }
        }
    }

    if let Some(f) = (0..n_f).find(|&f| face_removed[f] && modified[f].is_some()) {
        return Err(MeshError::invariant(format!(
            "face f{f} is both modified and removed"
        )));
    }

    // points
    let mut map = MeshMap {
        n_old_points: n_p,
        n_old_faces: n_f,
        n_old_cells: n_c,
        ..MeshMap::default()
    };
    let mut positions = Vec::with_capacity(n_p + new_points.len());
    let mut globals = Vec::with_capacity(positions.capacity());
    map.reverse_point_map = vec![None; n_p];
    for p in (0..n_p).filter(|&p| !point_removed[p]) {
        let old = PointId::new(p);
        map.reverse_point_map[p] = Some(PointId::new(positions.len()));
        positions.push(mesh.point(old));
        globals.push(mesh.point_global(old));
        map.point_map.push(Some(old));
        map.points_from_points.push(vec![old]);
    }
    for added in new_points {
        map.added_points.push(PointId::new(positions.len()));
        map.added_point_levels.push(added.level);
        positions.push(added.position);
        globals.push(added.global);
        map.point_map.push(added.master);
        map.points_from_points.push(added.stencil);
    }

    // cells
    map.reverse_cell_map = vec![None; n_c];
    for c in (0..n_c).filter(|&c| !cell_removed[c]) {
        let old = CellId::new(c);
        map.reverse_cell_map[c] = Some(CellId::new(map.cell_map.len()));
        map.cell_map.push(Some(old));
        map.cells_from_cells.push(vec![old]);
    }
    for master in new_cells {
        map.added_cells.push(CellId::new(map.cell_map.len()));
        map.cell_map.push(master);
        map.cells_from_cells.push(master.into_iter().collect());
    }
    for (cell, target) in cell_merge {
        let new = map.resolve_cell(target).ok_or_else(|| {
            MeshError::invariant(format!("cell {cell} merged into removed cell {target}"))
        })?;
        map.cells_from_cells[new.index()].push(cell);
    }

    // faces
    let mut pending: Vec<PendingFace> = Vec::with_capacity(n_f + new_faces.len());
    for f in (0..n_f).filter(|&f| !face_removed[f]) {
        let old = FaceId::new(f);
        let face = modified[f].take().unwrap_or_else(|| mesh.face(old).clone());
        pending.push(PendingFace {
            face: renumber_face(&map, mesh, face, &format!("face {old}"))?,
            flip: modified_flip[f],
            origin: Some(old),
            seq: 0,
        });
    }
    for (k, (face, master, flip)) in new_faces.into_iter().enumerate() {
        let label = format!("added face {}", n_f + k);
        pending.push(PendingFace {
            face: renumber_face(&map, mesh, face, &label)?,
            flip,
            origin: master,
            seq: k + 1,
        });
    }
    for p in &mut pending {
        if let Some(nei) = p.face.neighbour {
            if nei < p.face.owner {
                p.face.neighbour = Some(p.face.owner);
                p.face.owner = nei;
                p.face.points = reverse_loop(&p.face.points);
                p.flip = !p.flip;
            }
        }
    }

    let order_key = |p: &PendingFace| {
        let pos = p.origin.map_or(usize::MAX, FaceId::index);
        match (p.face.neighbour, p.face.patch) {
            (Some(nei), _) => (0u8, p.face.owner.index(), nei.index(), pos, p.seq),
            (None, patch) => (1u8, patch.map_or(usize::MAX, PatchId::index), 0, pos, p.seq),
        }
    };
    pending.sort_by_key(order_key);

    map.reverse_face_map = vec![None; n_f];
    map.added_faces = vec![FaceId::new(0); pending.iter().filter(|p| p.seq > 0).count()];
    let mut faces = Vec::with_capacity(pending.len());
    for (new, p) in pending.into_iter().enumerate() {
        let id = FaceId::new(new);
        if p.seq == 0 {
            if let Some(old) = p.origin {
                map.reverse_face_map[old.index()] = Some(id);
            }
        } else {
            map.added_faces[p.seq - 1] = id;
        }
        map.face_map.push(p.origin);
        map.flip_map.push(p.flip);
        map.faces_from_faces
            .push(if p.seq == 0 { p.origin.into_iter().collect() } else { Vec::new() });
        faces.push(p.face);
    }
    for (face, target) in face_merge {
        let new = map.resolve_face(target).ok_or_else(|| {
            MeshError::invariant(format!("face {face} merged into removed face {target}"))
        })?;
        map.faces_from_faces[new.index()].push(face);
    }

    let n_cells = map.cell_map.len();
    let next = PolyMesh::from_parts_unchecked(
        positions,
        globals,
        faces,
        mesh.patches().to_vec(),
        n_cells,
    );
    check_topology(&next)?;
    log::debug!(
        "committed topology change: {} -> {} cells, {} -> {} faces, {} -> {} points",
        n_c,
        next.n_cells(),
        n_f,
        next.n_faces(),
        n_p,
        next.n_points()
    );
    Ok((next, map))
}

fn mark_removed(removed: &mut [bool], index: usize, what: &str) -> Result<(), MeshError> {
    match removed.get_mut(index) {
        None => Err(MeshError::invariant(format!("remove of unknown {what} {index}"))),
        Some(true) => Err(MeshError::invariant(format!("{what} {index} removed twice"))),
        Some(flag) => {
            *flag = true;
            Ok(())
        }
    }
}

fn renumber_face(
    map: &MeshMap,
    mesh: &PolyMesh,
    face: Face,
    label: &str,
) -> Result<Face, MeshError> {
    let points = face
        .points
        .iter()
        .map(|&p| {
            map.resolve_point(p).ok_or_else(|| {
                MeshError::invariant(format!("{label} references removed point {p}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let owner = map.resolve_cell(face.owner).ok_or_else(|| {
        MeshError::invariant(format!("{label} owned by removed cell {}", face.owner))
    })?;
    let neighbour = face
        .neighbour
        .map(|n| {
            map.resolve_cell(n).ok_or_else(|| {
                MeshError::invariant(format!("{label} next to removed cell {n}"))
            })
        })
        .transpose()?;
    match (neighbour, face.patch) {
        (Some(n), None) if n == owner => Err(MeshError::invariant(format!(
            "{label} has the same cell {owner} on both sides"
        ))),
        (Some(n), None) => Ok(Face::internal(points, owner, n)),
        (None, Some(patch)) if patch.index() < mesh.patches().len() => {
            Ok(Face::boundary(points, owner, patch))
        }
        _ => Err(MeshError::invariant(format!(
            "{label} needs exactly one of neighbour and a known patch"
        ))),
    }
}
