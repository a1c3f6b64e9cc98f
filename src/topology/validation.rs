//! Topology sanity checks run after every commit.
//!
//! A failure here means the engine produced a broken mesh, never that the
//! caller passed bad data, so every check reports
//! [`MeshError::TopologyCorruption`].

use crate::algs::communicator::{exchange_records, Communicator};
use crate::algs::wire::{self, WirePatchFace};
use crate::mesh_error::MeshError;
use crate::topology::ids::{CellId, PointId};
use crate::topology::mesh::PolyMesh;
use hashbrown::{HashMap, HashSet};

/// Optional validation toggles.
#[derive(Debug, Clone, Copy)]
pub struct TopologyValidationOptions {
    /// Check face ordering and `owner < neighbour`.
    pub check_ordering: bool,
    /// Check that every cell surface is closed (each edge used twice, with
    /// opposite orientation).
    pub check_closed_cells: bool,
    /// Check that every point is used by a face.
    pub check_unused_points: bool,
}

impl TopologyValidationOptions {
    /// Enable all checks.
    pub fn all() -> Self {
        Self {
            check_ordering: true,
            check_closed_cells: true,
            check_unused_points: true,
        }
    }
}

impl Default for TopologyValidationOptions {
    fn default() -> Self {
        Self::all()
    }
}

/// Run every topology check.
pub fn check_topology(mesh: &PolyMesh) -> Result<(), MeshError> {
    check_topology_with(mesh, TopologyValidationOptions::all())
}

/// Run the selected topology checks.
pub fn check_topology_with(
    mesh: &PolyMesh,
    options: TopologyValidationOptions,
) -> Result<(), MeshError> {
    let n_points = mesh.n_points();
    let n_cells = mesh.n_cells();
    let mut used_points = vec![false; n_points];
    let mut faces_per_cell = vec![0usize; n_cells];
    let mut seen_boundary = false;
    let mut last_internal: Option<(CellId, CellId)> = None;
    let mut last_patch = 0usize;

    for (i, face) in mesh.faces().iter().enumerate() {
        if face.points.len() < 3 {
            return Err(MeshError::corruption(format!(
                "face {i} has only {} points",
                face.points.len()
            )));
        }
        let mut in_face = HashSet::with_capacity(face.points.len());
        for p in &face.points {
            if p.index() >= n_points {
                return Err(MeshError::corruption(format!(
                    "face {i} references removed point {p}"
                )));
            }
            if !in_face.insert(*p) {
                return Err(MeshError::corruption(format!(
                    "face {i} uses point {p} twice"
                )));
            }
            used_points[p.index()] = true;
        }
        if face.owner.index() >= n_cells {
            return Err(MeshError::corruption(format!(
                "face {i} owned by removed cell {}",
                face.owner
            )));
        }
        faces_per_cell[face.owner.index()] += 1;

        match (face.neighbour, face.patch) {
            (Some(nei), None) => {
                if nei.index() >= n_cells {
                    return Err(MeshError::corruption(format!(
                        "face {i} neighbour {nei} out of range"
                    )));
                }
                faces_per_cell[nei.index()] += 1;
                if options.check_ordering {
                    if seen_boundary {
                        return Err(MeshError::corruption(format!(
                            "internal face {i} after boundary faces"
                        )));
                    }
                    if face.owner >= nei {
                        return Err(MeshError::corruption(format!(
                            "internal face {i} has owner {} >= neighbour {nei}",
                            face.owner
                        )));
                    }
                    let key = (face.owner, nei);
                    if last_internal.is_some_and(|last| last > key) {
                        return Err(MeshError::corruption(format!(
                            "internal face {i} breaks upper-triangular order"
                        )));
                    }
                    last_internal = Some(key);
                }
            }
            (None, Some(patch)) => {
                if patch.index() >= mesh.patches().len() {
                    return Err(MeshError::corruption(format!(
                        "face {i} on unknown patch {patch}"
                    )));
                }
                if options.check_ordering && seen_boundary && patch.index() < last_patch {
                    return Err(MeshError::corruption(format!(
                        "boundary face {i} breaks patch grouping"
                    )));
                }
                seen_boundary = true;
                last_patch = patch.index();
            }
            _ => {
                return Err(MeshError::corruption(format!(
                    "face {i} must have exactly one of neighbour and patch"
                )));
            }
        }
    }

    if let Some(cell) = faces_per_cell.iter().position(|&n| n < 4) {
        return Err(MeshError::corruption(format!(
            "cell {cell} has only {} faces",
            faces_per_cell[cell]
        )));
    }

    if options.check_unused_points {
        if let Some(p) = used_points.iter().position(|used| !used) {
            return Err(MeshError::corruption(format!(
                "point {p} is not used by any face"
            )));
        }
    }

    if options.check_closed_cells {
        check_closed_cells(mesh)?;
    }
    Ok(())
}

/// Every cell surface must be a closed, consistently oriented polyhedron.
///
/// With outward loops each undirected edge of a cell is used exactly twice,
/// once in each direction. A hanging point inserted on one face but missing on
/// the adjacent face of the same cell breaks this.
pub fn check_closed_cells(mesh: &PolyMesh) -> Result<(), MeshError> {
    let cell_faces = mesh.cell_faces();
    let mut balance: HashMap<(PointId, PointId), (i32, u32)> = HashMap::new();
    for (c, faces) in cell_faces.iter().enumerate() {
        let cell = CellId::new(c);
        balance.clear();
        for &f in faces {
            let outward = mesh.face(f).loop_outward_from(cell);
            let n = outward.len();
            for k in 0..n {
                let (a, b) = (outward[k], outward[(k + 1) % n]);
                let key = (a.min(b), a.max(b));
                let entry = balance.entry(key).or_insert((0, 0));
                entry.0 += if a < b { 1 } else { -1 };
                entry.1 += 1;
            }
        }
        if let Some(((a, b), _)) = balance
            .iter()
            .find(|(_, (net, count))| *net != 0 || *count != 2)
        {
            return Err(MeshError::corruption(format!(
                "cell {cell} is not closed along edge {a}-{b}"
            )));
        }
    }
    Ok(())
}

/// Compare processor patches with the neighbouring ranks.
///
/// Both sides must agree on the face count of each shared patch and, face by
/// face, on the number of points and the global id of the first point.
pub fn check_processor_patches<C: Communicator>(
    mesh: &PolyMesh,
    comm: &C,
) -> Result<(), MeshError> {
    for (patch, rank) in mesh.processor_patches() {
        let range = mesh.patch_range(patch);
        let local: Vec<WirePatchFace> = mesh.faces()[range]
            .iter()
            .map(|f| WirePatchFace::new(f.points.len(), mesh.point_global(f.points[0])))
            .collect();

        let theirs: Vec<WirePatchFace> =
            exchange_records(comm, rank, wire::TAG_PATCH_CHECK, wire::KIND_PATCH_FACES, &local)?;
        if theirs.len() != local.len() {
            return Err(MeshError::corruption(format!(
                "processor patch {patch} has {} faces here, {} on rank {rank}",
                local.len(),
                theirs.len()
            )));
        }
        for (k, (mine, theirs)) in local.iter().zip(&theirs).enumerate() {
            if mine.n_points() != theirs.n_points() || mine.first_global() != theirs.first_global()
            {
                return Err(MeshError::corruption(format!(
                    "processor patch {patch} face {k} differs from rank {rank}"
                )));
            }
        }
    }
    Ok(())
}
