//! Anchor analysis: recovering the hexahedral lattice of a refined cell.
//!
//! A cell at level `L` is a hexahedron whose 8 corners (its *anchors*) are the
//! cell points with `point_level <= L`. Every other point of the cell is a
//! hanging point left by finer neighbours. Each of the six hex faces is either
//! a single mesh face carrying all four corners, or four sub-faces (one per
//! corner) sharing a level `L + 1` face mid.
//!
//! The anchors are placed on the lattice `(0..2)^3` used by the subdivision
//! tables below:
//!
//! ```text
//!        7 -------- 6
//!       /|         /|
//!      4 -------- 5 |        z
//!      | 3 -------|-2        | y
//!      |/         |/         |/
//!      0 -------- 1          +--- x
//! ```
//!
//! `v0` is the anchor with the smallest global id and `v1` its hex neighbour
//! with the smallest global id. The rest follows from the outward orientation
//! of the faces, so two ranks analysing copies of the same cell agree.

use crate::mesh_error::MeshError;
use crate::topology::ids::{CellId, FaceId, PointId};
use crate::topology::mesh::PolyMesh;
use hashbrown::HashMap;

/// Lattice position of vertex / child octant `i`.
pub const OCTANTS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Hex faces as outward corner cycles: -x, +x, -y, +y, -z, +z.
pub const HEX_FACES: [[usize; 4]; 6] = [
    [0, 4, 7, 3],
    [1, 2, 6, 5],
    [0, 1, 5, 4],
    [3, 7, 6, 2],
    [0, 3, 2, 1],
    [4, 5, 6, 7],
];

/// Hex edges: four along x, four along y, four along z.
pub const HEX_EDGES: [[usize; 2]; 12] = [
    [0, 1],
    [3, 2],
    [4, 5],
    [7, 6],
    [0, 3],
    [1, 2],
    [4, 7],
    [5, 6],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
];

/// Vertex index of a lattice corner in `{0, 1}^3`.
pub fn vertex_at(corner: [usize; 3]) -> usize {
    OCTANTS
        .iter()
        .position(|o| *o == corner)
        .unwrap_or_default()
}

/// How one hex face is represented in the mesh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaceRealization {
    /// A single face holding all four corners.
    Full(FaceId),
    /// Four sub-faces, `pieces[k]` at corner `k`.
    Split {
        face_mid: PointId,
        pieces: [FaceId; 4],
    },
}

/// One of the six faces of an analysed hexahedron.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexFace {
    /// Corner anchors, outward from the cell.
    pub corners: [PointId; 4],
    pub realization: FaceRealization,
    /// Points strictly between corner `k` and corner `k + 1`, in loop order.
    pub edge_points: [Vec<PointId>; 4],
}

impl HexFace {
    /// Position `k` of the directed corner edge `a -> b`, if present.
    pub fn directed_edge(&self, a: PointId, b: PointId) -> Option<usize> {
        (0..4).find(|&k| self.corners[k] == a && self.corners[(k + 1) % 4] == b)
    }

    /// Mesh faces realising this hex face.
    pub fn mesh_faces(&self) -> Vec<FaceId> {
        match &self.realization {
            FaceRealization::Full(f) => vec![*f],
            FaceRealization::Split { pieces, .. } => pieces.to_vec(),
        }
    }

    fn rotate(&mut self, k: usize) {
        self.corners.rotate_left(k);
        self.edge_points.rotate_left(k);
        if let FaceRealization::Split { pieces, .. } = &mut self.realization {
            pieces.rotate_left(k);
        }
    }
}

/// A cell recognised as a (possibly hanging-node) hexahedron.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexCell {
    pub cell: CellId,
    pub level: u32,
    /// Anchors in lattice vertex order.
    pub anchors: [PointId; 8],
    /// Hex faces in [`HEX_FACES`] order.
    pub faces: [HexFace; 6],
}

impl HexCell {
    /// Lattice vertex index of `anchor`.
    pub fn vertex_of(&self, anchor: PointId) -> Option<usize> {
        self.anchors.iter().position(|&a| a == anchor)
    }

    /// Points strictly between the two anchors of hex edge `e`, walking from
    /// the first to the second.
    pub fn edge_path(&self, e: usize) -> Vec<PointId> {
        let [a, b] = HEX_EDGES[e].map(|v| self.anchors[v]);
        for face in &self.faces {
            if let Some(k) = face.directed_edge(a, b) {
                return face.edge_points[k].clone();
            }
            if let Some(k) = face.directed_edge(b, a) {
                return face.edge_points[k].iter().rev().copied().collect();
            }
        }
        Vec::new()
    }

    /// Existing mid point of hex edge `e`, if a neighbour already split it.
    pub fn edge_mid(&self, e: usize, point_level: &[u32]) -> Option<PointId> {
        self.edge_path(e)
            .into_iter()
            .find(|p| point_level[p.index()] == self.level + 1)
    }

    /// Existing mid point of hex face `f`.
    pub fn face_mid(&self, f: usize) -> Option<PointId> {
        match self.faces[f].realization {
            FaceRealization::Split { face_mid, .. } => Some(face_mid),
            FaceRealization::Full(_) => None,
        }
    }
}

struct Piece {
    face: FaceId,
    anchor: PointId,
    front: PointId,
    back: PointId,
    outward: Vec<PointId>,
}

/// Recover the hexahedral structure of `cell`.
///
/// # Errors
/// [`MeshError::Invariant`] when the cell does not have exactly 8 anchors,
/// a face has a number of anchors other than 1 or 4, sub-faces do not come in
/// groups of four, or the faces do not close into a hexahedron.
pub fn analyse(
    mesh: &PolyMesh,
    cell: CellId,
    faces: &[FaceId],
    level: u32,
    point_level: &[u32],
) -> Result<HexCell, MeshError> {
    let not_hex = |why: String| {
        MeshError::invariant(format!("cell {cell} is not a refinable hexahedron: {why}"))
    };
    let lvl = |p: PointId| point_level[p.index()];

    let anchors: Vec<PointId> = mesh
        .cell_points(faces)
        .into_iter()
        .filter(|&p| lvl(p) <= level)
        .collect();
    if anchors.len() != 8 {
        return Err(not_hex(format!("{} anchors", anchors.len())));
    }

    let mut found: Vec<HexFace> = Vec::with_capacity(6);
    let mut pieces: HashMap<PointId, Vec<Piece>> = HashMap::new();
    for &f in faces {
        let mut outward = mesh.face(f).loop_outward_from(cell);
        let corners: Vec<usize> = (0..outward.len())
            .filter(|&i| lvl(outward[i]) <= level)
            .collect();
        match corners.len() {
            4 => {
                outward.rotate_left(corners[0]);
                let pos: Vec<usize> = corners.iter().map(|&i| i - corners[0]).collect();
                let n = outward.len();
                let edge_points = std::array::from_fn(|k| {
                    let end = if k == 3 { n } else { pos[k + 1] };
                    outward[pos[k] + 1..end].to_vec()
                });
                found.push(HexFace {
                    corners: std::array::from_fn(|k| outward[pos[k]]),
                    realization: FaceRealization::Full(f),
                    edge_points,
                });
            }
            1 => {
                outward.rotate_left(corners[0]);
                let mids: Vec<PointId> = outward[1..]
                    .iter()
                    .copied()
                    .filter(|&p| lvl(p) == level + 1)
                    .collect();
                let [front, face_mid, back] = mids[..] else {
                    return Err(not_hex(format!(
                        "sub-face {f} has {} points of level {}",
                        mids.len(),
                        level + 1
                    )));
                };
                pieces.entry(face_mid).or_default().push(Piece {
                    face: f,
                    anchor: outward[0],
                    front,
                    back,
                    outward,
                });
            }
            n => return Err(not_hex(format!("face {f} has {n} anchors"))),
        }
    }

    for (face_mid, group) in pieces {
        found.push(assemble_split_face(face_mid, group).ok_or_else(|| {
            not_hex(format!("sub-faces around {face_mid} do not form a quad"))
        })?);
    }
    if found.len() != 6 {
        return Err(not_hex(format!("{} hex faces", found.len())));
    }

    let global = |p: PointId| mesh.point_global(p);
    let v0 = anchors
        .iter()
        .copied()
        .min_by_key(|&p| global(p))
        .ok_or_else(|| not_hex("no anchors".into()))?;
    let v1 = found
        .iter()
        .flat_map(|face| {
            (0..4).filter_map(move |k| {
                (face.corners[k] == v0).then_some(face.corners[(k + 1) % 4])
            })
        })
        .min_by_key(|&p| global(p))
        .ok_or_else(|| not_hex(format!("anchor {v0} is on no hex face")))?;

    let cycle_from = |a: PointId, b: PointId| -> Option<[PointId; 4]> {
        found.iter().find_map(|face| {
            face.directed_edge(a, b).map(|k| {
                let mut c = face.corners;
                c.rotate_left(k);
                c
            })
        })
    };
    let front = cycle_from(v0, v1).ok_or_else(|| not_hex("open front face".into()))?;
    let bottom = cycle_from(v1, v0).ok_or_else(|| not_hex("open bottom face".into()))?;
    let (v5, v4) = (front[2], front[3]);
    let (v3, v2) = (bottom[2], bottom[3]);
    let top = cycle_from(v4, v5).ok_or_else(|| not_hex("open top face".into()))?;
    let lattice = [v0, v1, v2, v3, v4, v5, top[2], top[3]];

    let mut sorted = lattice;
    sorted.sort_unstable();
    if sorted[..] != anchors[..] {
        return Err(not_hex("anchors do not form a lattice".into()));
    }

    let mut ordered: Vec<HexFace> = Vec::with_capacity(6);
    for cycle in HEX_FACES {
        let expect = cycle.map(|v| lattice[v]);
        let mut face = found
            .iter()
            .find(|face| face.directed_edge(expect[0], expect[1]).is_some())
            .cloned()
            .ok_or_else(|| not_hex(format!("no face on edge {}-{}", expect[0], expect[1])))?;
        let k = face.directed_edge(expect[0], expect[1]).unwrap_or_default();
        face.rotate(k);
        if face.corners != expect {
            return Err(not_hex(format!("face at {} is not a quad of the lattice", expect[0])));
        }
        ordered.push(face);
    }
    let faces: [HexFace; 6] = ordered
        .try_into()
        .map_err(|_| not_hex("hex face count".into()))?;

    Ok(HexCell {
        cell,
        level,
        anchors: lattice,
        faces,
    })
}

/// Chain four sub-faces into one hex face. Neighbouring pieces share the edge
/// mid: the front mid of one is the back mid of the next.
fn assemble_split_face(face_mid: PointId, group: Vec<Piece>) -> Option<HexFace> {
    if group.len() != 4 {
        return None;
    }
    let mut order = vec![0usize];
    while order.len() < 4 {
        let last = &group[*order.last()?];
        let next = group.iter().position(|p| p.back == last.front)?;
        if order.contains(&next) {
            return None;
        }
        order.push(next);
    }
    if group[order[3]].front != group[order[0]].back {
        return None;
    }

    let edge_points = std::array::from_fn(|k| {
        let here = &group[order[k]];
        let next = &group[order[(k + 1) % 4]];
        let to_mid = here.outward.iter().position(|&p| p == here.front).unwrap_or(0);
        let from_mid = next.outward.iter().position(|&p| p == next.back).unwrap_or(0);
        here.outward[1..=to_mid]
            .iter()
            .chain(&next.outward[from_mid + 1..])
            .copied()
            .collect()
    });
    Some(HexFace {
        corners: std::array::from_fn(|k| group[order[k]].anchor),
        realization: FaceRealization::Split {
            face_mid,
            pieces: std::array::from_fn(|k| group[order[k]].face),
        },
        edge_points,
    })
}

/// Analyse many cells; in parallel with the `rayon` feature.
pub fn analyse_cells(
    mesh: &PolyMesh,
    cell_faces: &[Vec<FaceId>],
    cells: &[CellId],
    cell_level: &[u32],
    point_level: &[u32],
) -> Result<Vec<HexCell>, MeshError> {
    let one = |&c: &CellId| {
        analyse(
            mesh,
            c,
            &cell_faces[c.index()],
            cell_level[c.index()],
            point_level,
        )
    };
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        cells.par_iter().map(one).collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        cells.iter().map(one).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::block_mesh;

    #[test]
    fn tables_are_consistent() {
        for (v, corner) in OCTANTS.iter().enumerate() {
            assert_eq!(vertex_at(*corner), v);
        }
        // every edge is used by exactly two faces, once in each direction
        for [a, b] in HEX_EDGES {
            let uses = |x: usize, y: usize| {
                HEX_FACES
                    .iter()
                    .filter(|f| (0..4).any(|k| f[k] == x && f[(k + 1) % 4] == y))
                    .count()
            };
            assert_eq!((uses(a, b), uses(b, a)), (1, 1));
        }
    }

    #[test]
    fn block_cell_lattice_follows_axes() {
        let mesh = block_mesh([2, 2, 2], [2.0, 2.0, 2.0]).unwrap();
        let cell_faces = mesh.cell_faces();
        let levels = vec![0; mesh.n_points()];
        let hex = analyse(&mesh, CellId::new(7), &cell_faces[7], 0, &levels).unwrap();
        for (v, corner) in OCTANTS.iter().enumerate() {
            let x = mesh.point(hex.anchors[v]);
            let expect = corner.map(|c| 1.0 + c as f64);
            assert_eq!(x, expect);
        }
        assert!(hex.faces.iter().all(|f| matches!(f.realization, FaceRealization::Full(_))));
        assert!((0..12).all(|e| hex.edge_path(e).is_empty()));
    }

    #[test]
    fn wrong_level_is_not_a_hex() {
        let mesh = block_mesh([1, 1, 1], [1.0; 3]).unwrap();
        let cell_faces = mesh.cell_faces();
        let mut levels = vec![0; mesh.n_points()];
        levels[3] = 1;
        let err = analyse(&mesh, CellId::new(0), &cell_faces[0], 0, &levels).unwrap_err();
        assert!(matches!(err, MeshError::Invariant(_)));
    }
}
