//! Isotropic 2x2x2 splitting of hexahedral cells.
//!
//! # Expected invariants
//! - Every cell to split is a hexahedron at its level: exactly 8 anchors, each
//!   hex face a single face or four sub-faces around a face mid
//!   ([`crate::topology::hex`]).
//! - Neighbouring cells differ by at most one level, before and after.
//! - Points created for an edge, a face or a cell depend only on the global
//!   ids of the points they are interpolated from. Two ranks splitting the two
//!   sides of a processor face produce the same points and the same sub-faces
//!   in the same order without talking to each other.
//! - A rank that holds a split edge only through edge-adjacent processor
//!   faces learns of the mid from its neighbours before faces are emitted.
//!
//! A batch of cells becomes one [`TopologyEditScript`]. Child `i` of a cell
//! sits at anchor `i` of the lattice; child 0 keeps the parent's cell id.

pub mod checkpoint;
pub mod consistency;
pub mod levels;
pub mod protected;

use crate::algs::communicator::{Communicator, NoComm, exchange_records};
use crate::algs::wire::{KIND_SPLIT_EDGES, TAG_SPLIT_EDGES, WireEdge};
use crate::geometry::MeshGeometry;
use crate::geometry::metrics::mean;
use crate::mesh_error::MeshError;
use crate::topology::apply::{MeshMap, apply};
use crate::topology::edit::TopologyEditScript;
use crate::topology::hex::{self, FaceRealization, HEX_EDGES, HexCell};
use crate::topology::ids::{CellId, FaceId, GlobalPointId, PointId, derive_global_id};
use crate::topology::mesh::PolyMesh;
use consistency::RemoteCells;
use hashbrown::HashMap;
use levels::{FaceSplit, PendingSplit, RecordId, RefinementLevelState};

/// Optional checks on a refinement commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefineOptions {
    /// Recompute cell volumes after the commit and reject inverted or
    /// degenerate children.
    pub check_geometry: bool,
}

/// One batch of splits, ready to commit.
#[derive(Clone, Debug)]
pub struct RefinePlan {
    pub script: TopologyEditScript,
    /// Per split cell, in edit identities.
    pub splits: Vec<PendingSplit>,
}

impl RefinePlan {
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty() && self.script.is_empty()
    }

    /// Apply the script and record the splits in `levels`.
    ///
    /// `levels` is only touched once the commit succeeded. Returns the new
    /// mesh, the commit map and the id of each new record.
    pub fn commit(
        self,
        mesh: &PolyMesh,
        levels: &mut RefinementLevelState,
    ) -> Result<(PolyMesh, MeshMap, Vec<RecordId>), MeshError> {
        self.commit_with(mesh, levels, &RefineOptions::default())
    }

    pub fn commit_with(
        self,
        mesh: &PolyMesh,
        levels: &mut RefinementLevelState,
        options: &RefineOptions,
    ) -> Result<(PolyMesh, MeshMap, Vec<RecordId>), MeshError> {
        let (next, map) = apply(mesh, self.script)?;
        if options.check_geometry {
            MeshGeometry::new(&next).map_err(|e| {
                MeshError::invariant(format!("refinement produced bad geometry: {e}"))
            })?;
        }
        let resolved = self
            .splits
            .iter()
            .map(|s| s.resolve(&map))
            .collect::<Result<Vec<_>, _>>()?;
        let mut updated = levels.clone();
        updated.update_after_topology_change(&map);
        let ids = resolved
            .into_iter()
            .map(|s| updated.record_split(s))
            .collect::<Result<Vec<_>, _>>()?;
        *levels = updated;
        Ok((next, map, ids))
    }
}

/// Split a single cell.
pub fn split(
    cell: CellId,
    mesh: &PolyMesh,
    levels: &RefinementLevelState,
) -> Result<RefinePlan, MeshError> {
    split_cells(mesh, levels, &[cell])
}

/// Split `cells` of a mesh without processor patches.
pub fn split_cells(
    mesh: &PolyMesh,
    levels: &RefinementLevelState,
    cells: &[CellId],
) -> Result<RefinePlan, MeshError> {
    split_cells_coupled(mesh, levels, cells, &RemoteCells::default(), &NoComm)
}

/// Split `cells`; processor faces whose remote cell refines (per `remote`)
/// are split as well.
///
/// Collective: every rank of `comm` must call it, with or without cells.
///
/// # Errors
/// [`MeshError::InvalidInput`] for out of range or repeated cells,
/// [`MeshError::Invariant`] when a cell or a face to split does not have the
/// expected hexahedral structure.
pub fn split_cells_coupled<C: Communicator>(
    mesh: &PolyMesh,
    levels: &RefinementLevelState,
    cells: &[CellId],
    remote: &RemoteCells,
    comm: &C,
) -> Result<RefinePlan, MeshError> {
    levels.check_sizes(mesh)?;
    let mut sorted = cells.to_vec();
    sorted.sort_unstable();
    if let Some(c) = sorted.iter().find(|c| c.index() >= mesh.n_cells()) {
        return Err(MeshError::input(format!("cell {c} out of range")));
    }
    if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(MeshError::input(format!("cell {} listed twice", w[0])));
    }

    let cell_faces = mesh.cell_faces();
    let hexes = hex::analyse_cells(
        mesh,
        &cell_faces,
        &sorted,
        levels.cell_levels(),
        levels.point_levels(),
    )?;

    let mut splitter = Splitter {
        mesh,
        levels,
        script: TopologyEditScript::new(mesh),
        added_level: Vec::new(),
        edge_mid: HashMap::new(),
        face_mid: HashMap::new(),
        cell_split: vec![None; mesh.n_cells()],
        splits: Vec::with_capacity(hexes.len()),
        cuts: Vec::new(),
        cut_of: HashMap::new(),
    };
    splitter.create_points(hexes, remote)?;
    splitter.sync_edge_mids(comm)?;
    splitter.create_cells();
    splitter.create_faces(&cell_faces)?;
    let n_splits = splitter.splits.len();
    let plan = splitter.finish();
    log::debug!(
        "split plan: {n_splits} cells, {} edits",
        plan.script.len()
    );
    Ok(plan)
}

/// A refined cell during planning.
struct CellSplit {
    hex: HexCell,
    children: [CellId; 8],
    edge_mids: [PointId; 12],
    face_mids: [PointId; 6],
    cell_mid: PointId,
}

/// A face cut into four.
struct FaceCut {
    face: FaceId,
    corners: [PointId; 4],
    edge_mids: [PointId; 4],
    face_mid: PointId,
    /// Sub-face at each corner, filled when the faces are emitted.
    pieces: [FaceId; 4],
}

struct Splitter<'a> {
    mesh: &'a PolyMesh,
    levels: &'a RefinementLevelState,
    script: TopologyEditScript,
    /// Level of each point the script adds, in add order.
    added_level: Vec<u32>,
    edge_mid: HashMap<(PointId, PointId), PointId>,
    face_mid: HashMap<FaceId, PointId>,
    cell_split: Vec<Option<usize>>,
    splits: Vec<CellSplit>,
    cuts: Vec<FaceCut>,
    cut_of: HashMap<FaceId, usize>,
}

impl Splitter<'_> {
    fn level(&self, p: PointId) -> u32 {
        let n = self.mesh.n_points();
        if p.index() < n {
            self.levels.point_level(p)
        } else {
            self.added_level[p.index() - n]
        }
    }

    /// New point at the mean of `stencil`, summed in global id order.
    fn add_mean(&mut self, stencil: &[PointId], level: u32) -> PointId {
        let mesh = self.mesh;
        let mut sorted = stencil.to_vec();
        sorted.sort_by_key(|&p| mesh.point_global(p));
        let globals: Vec<u64> = sorted.iter().map(|&p| mesh.point_global(p)).collect();
        let position = mean(sorted.iter().map(|&p| mesh.point(p)));
        let master = sorted.first().copied();
        let id = self
            .script
            .add_point(position, master, sorted, derive_global_id(&globals), level);
        self.added_level.push(level);
        id
    }

    fn new_edge_mid(&mut self, a: PointId, b: PointId, level: u32) -> PointId {
        let key = (a.min(b), a.max(b));
        if let Some(&m) = self.edge_mid.get(&key) {
            return m;
        }
        let m = self.add_mean(&[a, b], level);
        self.edge_mid.insert(key, m);
        m
    }

    fn new_face_mid(&mut self, face: FaceId, corners: &[PointId; 4], level: u32) -> PointId {
        if let Some(&m) = self.face_mid.get(&face) {
            return m;
        }
        let m = self.add_mean(corners, level);
        self.face_mid.insert(face, m);
        m
    }

    /// Mid of the edge `a -> b` whose existing interior points are `between`.
    fn edge_mid_of(
        &mut self,
        a: PointId,
        b: PointId,
        between: &[PointId],
        level: u32,
    ) -> Result<PointId, MeshError> {
        if between.is_empty() {
            return Ok(self.new_edge_mid(a, b, level + 1));
        }
        between
            .iter()
            .copied()
            .find(|&p| self.level(p) == level + 1)
            .ok_or_else(|| {
                MeshError::invariant(format!(
                    "edge {a}-{b} has hanging points but no mid of level {}",
                    level + 1
                ))
            })
    }

    fn create_points(&mut self, hexes: Vec<HexCell>, remote: &RemoteCells) -> Result<(), MeshError> {
        for hex in hexes {
            let level = hex.level;
            let mut edge_mids = [PointId::new(0); 12];
            for (e, slot) in edge_mids.iter_mut().enumerate() {
                let [a, b] = HEX_EDGES[e].map(|v| hex.anchors[v]);
                *slot = self.edge_mid_of(a, b, &hex.edge_path(e), level)?;
            }
            let mut face_mids = [PointId::new(0); 6];
            for (f, slot) in face_mids.iter_mut().enumerate() {
                *slot = match hex.faces[f].realization {
                    FaceRealization::Split { face_mid, .. } => face_mid,
                    FaceRealization::Full(face) => {
                        self.plan_cut(face, level)?;
                        self.face_mid[&face]
                    }
                };
            }
            let cell_mid = self.add_mean(&hex.anchors, level + 1);
            self.cell_split[hex.cell.index()] = Some(self.splits.len());
            self.splits.push(CellSplit {
                children: [hex.cell; 8],
                hex,
                edge_mids,
                face_mids,
                cell_mid,
            });
        }

        // processor faces cut because the remote cell refines
        for (patch, _) in self.mesh.processor_patches() {
            for f in self.mesh.patch_range(patch).map(FaceId::new) {
                let Some(r) = remote.refining_level(f) else {
                    continue;
                };
                let coarse = self.mesh.face(f).points.iter().filter(|&&p| self.level(p) <= r);
                if coarse.count() == 4 {
                    self.plan_cut(f, r)?;
                }
            }
        }
        Ok(())
    }

    /// Share the mids of edges on processor faces until no rank learns one.
    fn sync_edge_mids<C: Communicator>(&mut self, comm: &C) -> Result<(), MeshError> {
        let mesh = self.mesh;
        let patches: Vec<(usize, HashMap<(GlobalPointId, GlobalPointId), (PointId, PointId)>)> = mesh
            .processor_patches()
            .map(|(patch, rank)| {
                let mut edges = HashMap::new();
                for f in mesh.patch_range(patch).map(FaceId::new) {
                    for (a, b) in mesh.face(f).edges() {
                        let (ga, gb) = (mesh.point_global(a), mesh.point_global(b));
                        edges.insert((ga.min(gb), ga.max(gb)), (a.min(b), a.max(b)));
                    }
                }
                (rank, edges)
            })
            .collect();

        let mut rounds = 0usize;
        loop {
            rounds += 1;
            let mut learned = false;
            for (rank, edges) in &patches {
                let mut send: Vec<WireEdge> = edges
                    .iter()
                    .filter_map(|(&(ga, gb), key)| {
                        let m = *self.edge_mid.get(key)?;
                        Some(WireEdge::new(ga, gb, self.level(m)))
                    })
                    .collect();
                send.sort_unstable_by_key(WireEdge::ends);
                let theirs = exchange_records(comm, *rank, TAG_SPLIT_EDGES, KIND_SPLIT_EDGES, &send)?;
                for edge in theirs {
                    let &(a, b) = edges.get(&edge.ends()).ok_or_else(|| {
                        let (ga, gb) = edge.ends();
                        MeshError::corruption(format!(
                            "rank {rank} splits edge {ga}-{gb}, which is not on the shared patch"
                        ))
                    })?;
                    if !self.edge_mid.contains_key(&(a, b)) {
                        self.new_edge_mid(a, b, edge.level());
                        learned = true;
                    }
                }
            }
            if !comm.any(learned)? {
                break;
            }
        }
        log::trace!("edge mids agreed after {rounds} rounds");
        Ok(())
    }

    /// Plan cutting `face`, whose corners are its points of level `<= level`.
    fn plan_cut(&mut self, face: FaceId, level: u32) -> Result<(), MeshError> {
        if self.cut_of.contains_key(&face) {
            return Ok(());
        }
        let points = &self.mesh.face(face).points;
        let at: Vec<usize> = (0..points.len())
            .filter(|&i| self.level(points[i]) <= level)
            .collect();
        if at.len() != 4 {
            return Err(MeshError::invariant(format!(
                "face {face} has {} corners at level {level}",
                at.len()
            )));
        }
        let corners: [PointId; 4] = std::array::from_fn(|k| points[at[k]]);
        let mut edge_mids = [PointId::new(0); 4];
        for k in 0..4 {
            let (i, j) = (at[k], at[(k + 1) % 4]);
            let between: Vec<PointId> = if j > i {
                points[i + 1..j].to_vec()
            } else {
                points[i + 1..].iter().chain(&points[..j]).copied().collect()
            };
            edge_mids[k] = self.edge_mid_of(corners[k], corners[(k + 1) % 4], &between, level)?;
        }
        let face_mid = self.new_face_mid(face, &corners, level + 1);
        self.cut_of.insert(face, self.cuts.len());
        self.cuts.push(FaceCut {
            face,
            corners,
            edge_mids,
            face_mid,
            pieces: [face; 4],
        });
        Ok(())
    }

    fn create_cells(&mut self) {
        for split in &mut self.splits {
            let parent = split.hex.cell;
            for child in split.children.iter_mut().skip(1) {
                *child = self.script.add_cell(Some(parent));
            }
        }
    }

    /// `points` with the new edge mids inserted between their endpoints.
    fn insert_mids(&self, points: &[PointId]) -> Vec<PointId> {
        let mut out = Vec::with_capacity(points.len() * 2);
        for (k, &p) in points.iter().enumerate() {
            out.push(p);
            let q = points[(k + 1) % points.len()];
            if let Some(&m) = self.edge_mid.get(&(p.min(q), p.max(q))) {
                out.push(m);
            }
        }
        out
    }

    /// Cell on side `cell` of a face (or of the piece at `corner`) after the
    /// batch.
    fn side(
        &self,
        cell: CellId,
        original: &[PointId],
        corner: Option<PointId>,
    ) -> Result<CellId, MeshError> {
        let Some(i) = self.cell_split[cell.index()] else {
            return Ok(cell);
        };
        let split = &self.splits[i];
        let anchors: Vec<PointId> = original
            .iter()
            .copied()
            .filter(|&p| self.level(p) <= split.hex.level)
            .collect();
        let at = match (anchors.as_slice(), corner) {
            (&[only], _) => only,
            (&[_, _, _, _], Some(c)) => c,
            _ => {
                return Err(MeshError::invariant(format!(
                    "cannot place a face with {} anchors in a child of {cell}",
                    anchors.len()
                )));
            }
        };
        let v = split.hex.vertex_of(at).ok_or_else(|| {
            MeshError::invariant(format!("{at} is not an anchor of {cell}"))
        })?;
        Ok(split.children[v])
    }

    fn create_faces(&mut self, cell_faces: &[Vec<FaceId>]) -> Result<(), MeshError> {
        let mesh = self.mesh;
        let mut touched = vec![false; mesh.n_faces()];
        for split in &self.splits {
            for &f in &cell_faces[split.hex.cell.index()] {
                touched[f.index()] = true;
            }
        }
        let point_faces = mesh.point_faces();
        for &(a, b) in self.edge_mid.keys() {
            for &f in &point_faces[a.index()] {
                if mesh.face(f).edges().any(|(p, q)| (p, q) == (a, b) || (p, q) == (b, a)) {
                    touched[f.index()] = true;
                }
            }
        }

        for f in (0..mesh.n_faces()).map(FaceId::new) {
            if let Some(&c) = self.cut_of.get(&f) {
                self.emit_cut(c)?;
            } else if touched[f.index()] {
                let face = mesh.face(f);
                let owner = self.side(face.owner, &face.points, None)?;
                let neighbour = face
                    .neighbour
                    .map(|n| self.side(n, &face.points, None))
                    .transpose()?;
                let points = self.insert_mids(&face.points);
                self.script
                    .modify_face(f, points, owner, neighbour, face.patch, false);
            }
        }

        for i in 0..self.splits.len() {
            self.emit_internal_faces(i, &cell_faces[self.splits[i].hex.cell.index()]);
        }
        Ok(())
    }

    fn emit_cut(&mut self, c: usize) -> Result<(), MeshError> {
        let mesh = self.mesh;
        let face = mesh.face(self.cuts[c].face);
        let cut = &self.cuts[c];
        let looped = self.insert_mids(&face.points);
        let lp = looped.as_slice();
        let n = lp.len();
        let pos = |p: PointId| lp.iter().position(|&q| q == p);
        let mut corner_at = [0usize; 4];
        let mut mid_at = [0usize; 4];
        for k in 0..4 {
            corner_at[k] = pos(cut.corners[k]).unwrap_or(0);
            mid_at[k] = pos(cut.edge_mids[k]).ok_or_else(|| {
                MeshError::invariant(format!("edge mid {} missing from face {}", cut.edge_mids[k], cut.face))
            })?;
        }
        let walk = |from: usize, to: usize| {
            let len = (to + n - from) % n;
            (0..=len).map(move |s| lp[(from + s) % n])
        };

        let mut order: Vec<usize> = (0..4).collect();
        order.sort_by_key(|&k| mesh.point_global(cut.corners[k]));
        let mut pieces = [cut.face; 4];
        let mut planned = Vec::with_capacity(4);
        for &k in &order {
            let mut points: Vec<PointId> = walk(corner_at[k], mid_at[k]).collect();
            points.push(cut.face_mid);
            let back = mid_at[(k + 3) % 4];
            points.extend(walk(back, corner_at[k]).take_while(|&p| p != cut.corners[k]));
            let corner = Some(cut.corners[k]);
            let owner = self.side(face.owner, &face.points, corner)?;
            let neighbour = face
                .neighbour
                .map(|nb| self.side(nb, &face.points, corner))
                .transpose()?;
            planned.push((k, points, owner, neighbour));
        }
        let (face_id, patch) = (cut.face, face.patch);
        for (rank, (k, points, owner, neighbour)) in planned.into_iter().enumerate() {
            pieces[k] = if rank == 0 {
                self.script
                    .modify_face(face_id, points, owner, neighbour, patch, false);
                face_id
            } else {
                self.script
                    .add_face(points, owner, neighbour, patch, Some(face_id), false)
            };
        }
        self.cuts[c].pieces = pieces;
        Ok(())
    }

    /// Point at lattice position `g` in `{0, 1, 2}^3` of split `i`.
    fn grid_point(&self, i: usize, g: [usize; 3]) -> PointId {
        let split = &self.splits[i];
        let odd: Vec<usize> = (0..3).filter(|&d| g[d] == 1).collect();
        match odd[..] {
            [] => split.hex.anchors[hex::vertex_at(g.map(|x| x / 2))],
            [d] => {
                let mut lo = g.map(|x| x / 2);
                lo[d] = 0;
                let mut hi = lo;
                hi[d] = 1;
                let (va, vb) = (hex::vertex_at(lo), hex::vertex_at(hi));
                let e = HEX_EDGES
                    .iter()
                    .position(|&[a, b]| (a, b) == (va, vb) || (a, b) == (vb, va))
                    .unwrap_or(0);
                split.edge_mids[e]
            }
            [a, b] => {
                let d = 3 - a - b;
                split.face_mids[2 * d + g[d] / 2]
            }
            _ => split.cell_mid,
        }
    }

    /// Points hanging on the segment `u -> v` of a child face, taken from the
    /// existing faces of the cell.
    fn hanging_between(&self, loops: &[&[PointId]], u: PointId, v: PointId, level: u32) -> Vec<PointId> {
        for lp in loops {
            let n = lp.len();
            for start in (0..n).filter(|&i| lp[i] == u) {
                for step in [1, n - 1] {
                    let mut path = Vec::new();
                    let mut i = (start + step) % n;
                    while self.level(lp[i]) > level && path.len() < n {
                        path.push(lp[i]);
                        i = (i + step) % n;
                    }
                    if lp[i] == v {
                        return path;
                    }
                }
            }
        }
        Vec::new()
    }

    fn emit_internal_faces(&mut self, i: usize, faces: &[FaceId]) {
        let mesh = self.mesh;
        let loops: Vec<&[PointId]> = faces.iter().map(|&f| mesh.face(f).points.as_slice()).collect();
        let child_level = self.splits[i].hex.level + 1;
        for d in 0..3 {
            let (a, b) = ((d + 1) % 3, (d + 2) % 3);
            for (oa, ob) in [(0, 0), (1, 0), (1, 1), (0, 1)] {
                let mut lower = [0; 3];
                lower[a] = oa;
                lower[b] = ob;
                let mut upper = lower;
                upper[d] = 1;
                let mut p = [0; 3];
                p[d] = 1;
                p[a] = oa;
                p[b] = ob;
                let mut corners = [p; 4];
                corners[1][a] += 1;
                corners[2][a] += 1;
                corners[2][b] += 1;
                corners[3][b] += 1;
                let ids = corners.map(|g| self.grid_point(i, g));
                let mut points = Vec::with_capacity(8);
                for k in 0..4 {
                    let (u, v) = (ids[k], ids[(k + 1) % 4]);
                    points.push(u);
                    points.extend(self.hanging_between(&loops, u, v, child_level));
                }
                // segments on sub-faces cut in this batch
                let points = self.insert_mids(&points);
                let split = &self.splits[i];
                let owner = split.children[hex::vertex_at(lower)];
                let neighbour = split.children[hex::vertex_at(upper)];
                self.script
                    .add_face(points, owner, Some(neighbour), None, None, false);
            }
        }
    }

    fn finish(self) -> RefinePlan {
        let cut_of = &self.cut_of;
        let cuts = &self.cuts;
        let splits = self
            .splits
            .iter()
            .map(|s| {
                let face_splits = (0..6)
                    .filter_map(|hf| {
                        let hex_face = &s.hex.faces[hf];
                        let FaceRealization::Full(f) = hex_face.realization else {
                            return None;
                        };
                        let cut = &cuts[*cut_of.get(&f)?];
                        let sub_faces = hex_face.corners.map(|c| {
                            cut.corners
                                .iter()
                                .position(|&k| k == c)
                                .map(|k| cut.pieces[k])
                        });
                        Some(FaceSplit {
                            hex_face: hf as u8,
                            corners: hex_face.corners,
                            face_mid: cut.face_mid,
                            sub_faces,
                        })
                    })
                    .collect();
                PendingSplit {
                    children: s.children,
                    level: s.hex.level,
                    anchors: s.hex.anchors,
                    cell_mid: s.cell_mid,
                    face_mids: s.face_mids,
                    edge_mids: s.edge_mids,
                    face_splits,
                }
            })
            .collect();
        RefinePlan {
            script: self.script,
            splits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::block_mesh;
    use crate::topology::validation::check_closed_cells;

    fn refine_once(
        mesh: &PolyMesh,
        levels: &mut RefinementLevelState,
        cells: &[usize],
    ) -> (PolyMesh, MeshMap) {
        let cells: Vec<CellId> = cells.iter().copied().map(CellId::new).collect();
        let plan = split_cells(mesh, levels, &cells).unwrap();
        let (next, map, ids) = plan.commit(mesh, levels).unwrap();
        assert_eq!(ids.len(), cells.len());
        (next, map)
    }

    #[test]
    fn single_cube_splits_into_octants() {
        let mesh = block_mesh([1, 1, 1], [1.0; 3]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let (next, map) = refine_once(&mesh, &mut levels, &[0]);
        assert_eq!(next.n_cells(), 8);
        assert_eq!(next.n_points(), 27);
        assert_eq!(next.n_internal_faces(), 12);
        assert_eq!(next.n_faces(), 36);
        assert_eq!(map.children_of(CellId::new(0)).len(), 8);
        assert!(map.cell_map.iter().all(|c| *c == Some(CellId::new(0))));
        assert!(levels.cell_levels().iter().all(|&l| l == 1));
        check_closed_cells(&next).unwrap();
        let geom = MeshGeometry::new(&next).unwrap();
        assert!(geom.cell_volumes.iter().all(|v| (v - 0.125).abs() < 1e-12));
    }

    #[test]
    fn neighbour_gets_hanging_points() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let (next, _) = refine_once(&mesh, &mut levels, &[0]);
        assert_eq!(next.n_cells(), 9);
        assert_eq!(next.n_points(), 31);
        assert_eq!(next.n_internal_faces(), 16);
        assert_eq!(next.n_faces(), 41);
        check_closed_cells(&next).unwrap();

        // the coarse cell is still a hexahedron at level 0
        let coarse = next
            .cells()
            .find(|&c| levels.cell_level(c) == 0)
            .unwrap();
        let cell_faces = next.cell_faces();
        let analysed = hex::analyse(
            &next,
            coarse,
            &cell_faces[coarse.index()],
            0,
            levels.point_levels(),
        )
        .unwrap();
        assert_eq!(analysed.faces.iter().filter(|f| matches!(f.realization, FaceRealization::Split { .. })).count(), 1);
    }

    #[test]
    fn refining_next_to_a_split_face_reuses_its_points() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let (once, _) = refine_once(&mesh, &mut levels, &[0]);
        let coarse = once.cells().find(|&c| levels.cell_level(c) == 0).unwrap();
        let (twice, _) = refine_once(&once, &mut levels, &[coarse.index()]);
        assert_eq!(twice.n_cells(), 16);
        assert_eq!(twice.n_points(), 45);
        assert_eq!(twice.n_faces(), 2 * 36 - 4);
        check_closed_cells(&twice).unwrap();
        levels.validate_invariants_for(&twice);
    }

    #[test]
    fn second_level_inside_a_refined_cell() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let (once, _) = refine_once(&mesh, &mut levels, &[0]);
        // a child away from the coarse cell
        let coarse = once.cells().find(|&c| levels.cell_level(c) == 0).unwrap();
        let fine = once
            .cells()
            .find(|&c| {
                c != coarse
                    && once
                        .faces()
                        .iter()
                        .all(|f| f.other_cell(c) != Some(coarse))
            })
            .unwrap();
        let (twice, _) = refine_once(&once, &mut levels, &[fine.index()]);
        assert_eq!(twice.n_cells(), 16);
        check_closed_cells(&twice).unwrap();
        assert_eq!(levels.max_cell_level(), 2);
        let total = MeshGeometry::new(&twice).unwrap().total_volume();
        assert!((total - 2.0).abs() < 1e-12);
    }

    #[test]
    fn bad_requests_are_rejected() {
        let mesh = block_mesh([1, 1, 1], [1.0; 3]).unwrap();
        let levels = RefinementLevelState::for_mesh(&mesh);
        assert!(matches!(
            split_cells(&mesh, &levels, &[CellId::new(1)]),
            Err(MeshError::InvalidInput(_))
        ));
        assert!(matches!(
            split_cells(&mesh, &levels, &[CellId::new(0), CellId::new(0)]),
            Err(MeshError::InvalidInput(_))
        ));
        let mut point_level = vec![0; 8];
        point_level[0] = 1;
        let odd = RefinementLevelState::from_levels(vec![0], point_level);
        assert!(matches!(split(CellId::new(0), &mesh, &odd), Err(MeshError::Invariant(_))));
    }

    impl RefinementLevelState {
        fn validate_invariants_for(&self, mesh: &PolyMesh) {
            use crate::debug_invariants::DebugInvariants;
            self.check_sizes(mesh).unwrap();
            self.validate_invariants().unwrap();
        }
    }
}
