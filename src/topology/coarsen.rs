//! Merging sibling octets back into their parent cell.
//!
//! Merging replaces the 8 leaves of one split record by a single cell and
//! emits the inverse of the split: the 12 faces between the siblings go, the
//! sub-faces of each parent face are joined again wherever everything on the
//! other side agrees, and points the split created are removed once no face
//! needs them as a corner.
//!
//! Point removal never trusts the record alone: a face or edge mid shared with
//! a neighbour that is still refined keeps more than two incident edges and
//! survives. Ranks agree on the points to look at before deciding, so a rank
//! that only shares an edge with a merging cell drops the same mids.
//!
//! One batch holds groups of a single level. A coarse group next to finer
//! groups sees their points only once they are gone, so mixed batches go
//! through [`merge_by_level`] (or one commit per level in the driver).

use crate::algs::communicator::{Communicator, NoComm, exchange_records};
use crate::algs::wire::{KIND_POINTS, TAG_MERGE_POINTS, WirePoint};
use crate::mesh_error::MeshError;
use crate::topology::apply::{MeshMap, apply};
use crate::topology::edit::TopologyEditScript;
use crate::topology::hex::{self, FaceRealization};
use crate::topology::ids::{CellId, FaceId, GlobalPointId, PatchId, PointId};
use crate::topology::mesh::{Face, PolyMesh};
use crate::topology::refine::consistency::RemoteCells;
use crate::topology::refine::levels::{RecordId, RefinementLevelState};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// One batch of merges, ready to commit.
#[derive(Clone, Debug)]
pub struct CoarsenPlan {
    pub script: TopologyEditScript,
    pub records: Vec<RecordId>,
    /// Leaves of each record, in octant order.
    pub groups: Vec<[CellId; 8]>,
}

impl CoarsenPlan {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.script.is_empty()
    }

    /// Apply the script and consume the records in `levels`.
    ///
    /// `levels` is only touched once the commit succeeded.
    pub fn commit(
        self,
        mesh: &PolyMesh,
        levels: &mut RefinementLevelState,
    ) -> Result<(PolyMesh, MeshMap), MeshError> {
        let (next, map) = apply(mesh, self.script)?;
        let mut updated = levels.clone();
        for group in &self.groups {
            updated.record_merge(group)?;
        }
        updated.update_after_topology_change(&map);
        *levels = updated;
        Ok((next, map))
    }
}

/// Merge one sibling group given as its 8 cells.
///
/// # Errors
/// [`MeshError::Invariant`] unless `group` is exactly the intact leaves of
/// one split.
pub fn merge(
    group: &[CellId],
    mesh: &PolyMesh,
    levels: &RefinementLevelState,
) -> Result<CoarsenPlan, MeshError> {
    let record = levels.check_merge(group)?;
    merge_groups(mesh, levels, &[record])
}

/// Merge the sibling groups of `records` in a mesh without processor patches.
pub fn merge_groups(
    mesh: &PolyMesh,
    levels: &RefinementLevelState,
    records: &[RecordId],
) -> Result<CoarsenPlan, MeshError> {
    merge_groups_coupled(mesh, levels, records, &RemoteCells::default(), &NoComm)
}

/// `records` grouped by the level they were split at, finest first.
pub fn level_batches(
    levels: &RefinementLevelState,
    records: &[RecordId],
) -> Result<Vec<(u32, Vec<RecordId>)>, MeshError> {
    let mut by_level: BTreeMap<Reverse<u32>, Vec<RecordId>> = BTreeMap::new();
    for &r in records {
        let record = levels
            .record(r)
            .ok_or_else(|| MeshError::invariant(format!("{r} is not a split record")))?;
        by_level.entry(Reverse(record.level)).or_default().push(r);
    }
    Ok(by_level
        .into_iter()
        .map(|(Reverse(level), batch)| (level, batch))
        .collect())
}

/// Merge groups of any levels in a mesh without processor patches, one
/// commit per level, finest first.
///
/// `levels` is only touched once every commit succeeded. Returns the final
/// mesh and the map of each commit in order.
pub fn merge_by_level(
    mesh: &PolyMesh,
    levels: &mut RefinementLevelState,
    records: &[RecordId],
) -> Result<(PolyMesh, Vec<MeshMap>), MeshError> {
    let mut updated = levels.clone();
    let mut current = mesh.clone();
    let mut maps = Vec::new();
    for (level, batch) in level_batches(levels, records)? {
        let plan = merge_groups(&current, &updated, &batch)?;
        let (next, map) = plan.commit(&current, &mut updated)?;
        log::debug!("merged {} groups of level {level}", batch.len());
        current = next;
        maps.push(map);
    }
    *levels = updated;
    Ok((current, maps))
}

/// Which side of a piece decides whether it can be joined with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Region {
    /// The whole parent face.
    Whole,
    /// The part of the parent face covered by one child.
    Child(CellId),
    /// The piece on its own.
    Face(FaceId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Across {
    Cell(CellId),
    Patch(PatchId, u8, Region),
}

/// Faces that may be joined: the cell they are seen from and what lies across.
type ClassKey = (CellId, Across);

/// Merge the sibling groups of `records`; `remote` gives the level of the
/// remote cells after this cycle across processor faces.
///
/// Collective: every rank of `comm` must call it, with or without records.
///
/// # Errors
/// [`MeshError::Invariant`] for groups that are not intact leaves, or for
/// groups of different levels in one batch.
pub fn merge_groups_coupled<C: Communicator>(
    mesh: &PolyMesh,
    levels: &RefinementLevelState,
    records: &[RecordId],
    remote: &RemoteCells,
    comm: &C,
) -> Result<CoarsenPlan, MeshError> {
    levels.check_sizes(mesh)?;
    let records: Vec<RecordId> = records.iter().copied().sorted_unstable().dedup().collect();

    let mut groups: Vec<[CellId; 8]> = Vec::with_capacity(records.len());
    let mut group_of: Vec<Option<usize>> = vec![None; mesh.n_cells()];
    for &r in &records {
        let cells = levels
            .group_cells(r)
            .ok_or_else(|| MeshError::invariant(format!("{r} is not an intact sibling group")))?;
        levels.check_merge(&cells)?;
        for c in cells {
            if group_of[c.index()].is_some() {
                return Err(MeshError::invariant(format!("{c} is in two groups")));
            }
            group_of[c.index()] = Some(groups.len());
        }
        groups.push(cells);
    }
    let batch_levels: BTreeSet<u32> = records
        .iter()
        .filter_map(|&r| levels.record(r).map(|record| record.level))
        .collect();
    if batch_levels.len() > 1 {
        return Err(MeshError::invariant(format!(
            "groups of levels {batch_levels:?} cannot merge in one batch"
        )));
    }
    let parents: Vec<CellId> = groups
        .iter()
        .map(|g| g.iter().copied().min().unwrap_or(g[0]))
        .collect();
    let final_cell = |c: CellId| group_of[c.index()].map_or(c, |g| parents[g]);

    let mut script = TopologyEditScript::new(mesh);
    let cell_faces = mesh.cell_faces();
    let mut removed: HashSet<FaceId> = HashSet::new();
    let mut classes: BTreeMap<ClassKey, BTreeSet<FaceId>> = BTreeMap::new();
    let mut candidates: BTreeSet<PointId> = BTreeSet::new();

    for (g, cells) in groups.iter().enumerate() {
        let parent = parents[g];
        for &c in cells.iter().filter(|&&c| c != parent) {
            script.remove_cell(c, Some(parent));
        }
        let record = levels.record(records[g]).ok_or_else(|| {
            MeshError::invariant(format!("{} vanished during planning", records[g]))
        })?;
        let level = record.level;
        candidates.extend(record.created_points());

        let mut inner: BTreeSet<FaceId> = BTreeSet::new();
        for &c in cells {
            let child = hex::analyse(
                mesh,
                c,
                &cell_faces[c.index()],
                level + 1,
                levels.point_levels(),
            )?;
            for face in &child.faces {
                if face.corners.contains(&record.cell_mid) {
                    inner.extend(face.mesh_faces());
                    continue;
                }
                let Some(f) = record
                    .face_mids
                    .iter()
                    .position(|m| face.corners.contains(m))
                else {
                    return Err(MeshError::invariant(format!(
                        "a face of {c} touches neither the cell mid nor a face mid of {}",
                        records[g]
                    )));
                };
                for piece in face.mesh_faces() {
                    let across = across_of(mesh, piece, c, f as u8, level, remote, &final_cell);
                    let key = match across {
                        Across::Cell(o) if o < parent => (o, Across::Cell(parent)),
                        other => (parent, other),
                    };
                    classes.entry(key).or_default().insert(piece);
                }
            }
        }
        if inner.len() != 12 {
            return Err(MeshError::invariant(format!(
                "{} has {} faces between siblings, expected 12",
                records[g],
                inner.len()
            )));
        }
        for f in inner {
            script.remove_face(f, None);
            removed.insert(f);
        }
    }

    // split faces whose remote side merges back to our level
    for (patch, _) in mesh.processor_patches() {
        for f in mesh.patch_range(patch).map(FaceId::new) {
            let owner = mesh.face(f).owner;
            if group_of[owner.index()].is_some() || !remote.get(f).is_some_and(|r| r.unrefine()) {
                continue;
            }
            let level = levels.cell_level(owner);
            let Ok(x) = hex::analyse(
                mesh,
                owner,
                &cell_faces[owner.index()],
                level,
                levels.point_levels(),
            ) else {
                continue;
            };
            for (hf, face) in x.faces.iter().enumerate() {
                let FaceRealization::Split { face_mid, pieces } = &face.realization else {
                    continue;
                };
                if !pieces.contains(&f) {
                    continue;
                }
                let coarse = pieces.iter().all(|&p| {
                    mesh.face(p).patch == Some(patch)
                        && remote.new_level(p).is_some_and(|r| r <= level)
                });
                if coarse {
                    let key = (owner, Across::Patch(patch, hf as u8, Region::Whole));
                    classes.entry(key).or_default().extend(pieces.iter().copied());
                    candidates.insert(*face_mid);
                    candidates.extend(
                        face.edge_points
                            .iter()
                            .flatten()
                            .copied()
                            .filter(|&p| levels.point_level(p) == level + 1),
                    );
                }
            }
        }
    }

    // faces touching merged cells follow them
    let mut state: BTreeMap<FaceId, Face> = BTreeMap::new();
    for cells in &groups {
        for &c in cells {
            for &f in &cell_faces[c.index()] {
                if removed.contains(&f) || state.contains_key(&f) {
                    continue;
                }
                let face = mesh.face(f);
                state.insert(
                    f,
                    Face {
                        points: face.points.clone(),
                        owner: final_cell(face.owner),
                        neighbour: face.neighbour.map(final_cell),
                        patch: face.patch,
                    },
                );
            }
        }
    }

    // kept faces now seen from the other side
    let mut flipped: BTreeSet<FaceId> = BTreeSet::new();
    for ((side, across), pieces) in &classes {
        if pieces.len() < 2 {
            continue;
        }
        let loops: Vec<Vec<PointId>> = pieces
            .iter()
            .map(|&p| {
                let face = mesh.face(p);
                if final_cell(face.owner) == *side {
                    face.points.clone()
                } else {
                    face.loop_outward_from(face.neighbour.unwrap_or(face.owner))
                }
            })
            .collect();
        let Some(points) = join_loops(&loops, mesh) else {
            log::debug!("sub-faces {pieces:?} do not join into one face; kept");
            continue;
        };
        let mut iter = pieces.iter().copied();
        let Some(kept) = iter.next() else { continue };
        if final_cell(mesh.face(kept).owner) != *side {
            flipped.insert(kept);
        }
        for other in iter {
            script.remove_face(other, Some(kept));
            removed.insert(other);
            state.remove(&other);
        }
        let merged = match across {
            Across::Cell(o) => Face::internal(points, *side, *o),
            Across::Patch(patch, _, _) => Face::boundary(points, *side, *patch),
        };
        state.insert(kept, merged);
    }

    sync_candidates(mesh, &mut candidates, comm)?;

    // points nothing needs as a corner any more; joined faces carry the
    // points of all their pieces
    let mut point_faces = mesh.point_faces();
    for (&f, face) in &state {
        for &p in &face.points {
            let faces = &mut point_faces[p.index()];
            if !faces.contains(&f) {
                faces.push(f);
            }
        }
    }
    let loop_of = |state: &BTreeMap<FaceId, Face>, f: FaceId| -> Option<Vec<PointId>> {
        if removed.contains(&f) {
            None
        } else {
            Some(
                state
                    .get(&f)
                    .map_or_else(|| mesh.face(f).points.clone(), |s| s.points.clone()),
            )
        }
    };
    let mut dead: HashSet<PointId> = HashSet::new();
    for &p in &candidates {
        let mut incident: HashSet<PointId> = HashSet::new();
        for &f in &point_faces[p.index()] {
            let Some(lp) = loop_of(&state, f) else { continue };
            let n = lp.len();
            for i in (0..n).filter(|&i| lp[i] == p) {
                incident.insert(lp[(i + 1) % n]);
                incident.insert(lp[(i + n - 1) % n]);
            }
        }
        if incident.is_empty() || incident.len() == 2 {
            dead.insert(p);
        }
    }
    let touched: BTreeSet<FaceId> = dead
        .iter()
        .flat_map(|p| point_faces[p.index()].iter().copied())
        .filter(|f| !removed.contains(f))
        .collect();
    for f in touched {
        let face = state.entry(f).or_insert_with(|| mesh.face(f).clone());
        let restart = face.points.first().is_some_and(|p| dead.contains(p));
        face.points.retain(|p| !dead.contains(p));
        if restart {
            if let Some(k) = face
                .points
                .iter()
                .position_min_by_key(|&&p| mesh.point_global(p))
            {
                face.points.rotate_left(k);
            }
        }
        if face.points.len() < 3 {
            return Err(MeshError::invariant(format!(
                "face {f} would keep {} points",
                face.points.len()
            )));
        }
    }

    for (f, face) in state {
        let flip = flipped.contains(&f);
        script.modify_face(f, face.points, face.owner, face.neighbour, face.patch, flip);
    }
    for p in dead.iter().copied().sorted_unstable() {
        script.remove_point(p);
    }
    log::debug!(
        "merge plan: {} groups, {} points removed, {} edits",
        groups.len(),
        dead.len(),
        script.len()
    );
    Ok(CoarsenPlan {
        script,
        records,
        groups,
    })
}

/// Add the candidates of neighbouring ranks that lie on shared patches, until
/// no rank learns a new one.
fn sync_candidates<C: Communicator>(
    mesh: &PolyMesh,
    candidates: &mut BTreeSet<PointId>,
    comm: &C,
) -> Result<(), MeshError> {
    let patches: Vec<(usize, HashMap<GlobalPointId, PointId>)> = mesh
        .processor_patches()
        .map(|(patch, rank)| {
            let on_patch = mesh.faces()[mesh.patch_range(patch)]
                .iter()
                .flat_map(|f| f.points.iter().copied())
                .map(|p| (mesh.point_global(p), p))
                .collect();
            (rank, on_patch)
        })
        .collect();
    loop {
        let mut learned = false;
        for (rank, on_patch) in &patches {
            let send: Vec<WirePoint> = candidates
                .iter()
                .map(|&p| mesh.point_global(p))
                .filter(|g| on_patch.contains_key(g))
                .sorted_unstable()
                .map(WirePoint::new)
                .collect();
            let theirs = exchange_records(comm, *rank, TAG_MERGE_POINTS, KIND_POINTS, &send)?;
            for point in theirs {
                let &p = on_patch.get(&point.get()).ok_or_else(|| {
                    MeshError::corruption(format!(
                        "rank {rank} removes point {}, which is not on the shared patch",
                        point.get()
                    ))
                })?;
                learned |= candidates.insert(p);
            }
        }
        if !comm.any(learned)? {
            return Ok(());
        }
    }
}

/// What lies across `piece`, seen from child `cell` of a parent at `level`.
fn across_of(
    mesh: &PolyMesh,
    piece: FaceId,
    cell: CellId,
    parent_face: u8,
    level: u32,
    remote: &RemoteCells,
    final_cell: &impl Fn(CellId) -> CellId,
) -> Across {
    let face = mesh.face(piece);
    if let Some(other) = face.other_cell(cell) {
        return Across::Cell(final_cell(other));
    }
    let patch = face.patch.unwrap_or(PatchId::new(0));
    let is_processor = mesh
        .patches()
        .get(patch.index())
        .is_some_and(|p| p.neighbour_rank().is_some());
    if !is_processor {
        return Across::Patch(patch, parent_face, Region::Whole);
    }
    let region = match remote.new_level(piece) {
        Some(r) if r <= level => Region::Whole,
        Some(r) if r == level + 1 => Region::Child(cell),
        _ => Region::Face(piece),
    };
    Across::Patch(patch, parent_face, region)
}

/// Join face loops that share edges into one loop, starting at the point with
/// the smallest global id. `None` unless the outline is a single cycle.
fn join_loops(loops: &[Vec<PointId>], mesh: &PolyMesh) -> Option<Vec<PointId>> {
    let mut edges: HashSet<(PointId, PointId)> = HashSet::new();
    for lp in loops {
        for (p, q) in lp.iter().copied().circular_tuple_windows() {
            if !edges.remove(&(q, p)) {
                edges.insert((p, q));
            }
        }
    }
    let mut next: HashMap<PointId, PointId> = HashMap::with_capacity(edges.len());
    for &(p, q) in &edges {
        if next.insert(p, q).is_some() {
            return None;
        }
    }
    let start = next.keys().copied().min_by_key(|&p| mesh.point_global(p))?;
    let mut out = Vec::with_capacity(next.len());
    let mut at = start;
    loop {
        out.push(at);
        at = *next.get(&at)?;
        if at == start || out.len() > next.len() {
            break;
        }
    }
    (at == start && out.len() == next.len()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::block_mesh;
    use crate::topology::refine::split_cells;
    use crate::topology::validation::check_closed_cells;

    fn refine(mesh: &PolyMesh, levels: &mut RefinementLevelState, cells: &[CellId]) -> PolyMesh {
        let plan = split_cells(mesh, levels, cells).unwrap();
        plan.commit(mesh, levels).unwrap().0
    }

    fn face_sets(mesh: &PolyMesh) -> Vec<Vec<u64>> {
        mesh.faces()
            .iter()
            .map(|f| f.points.iter().map(|&p| mesh.point_global(p)).sorted().collect())
            .sorted()
            .collect()
    }

    #[test]
    fn merge_inverts_split() {
        let mesh = block_mesh([1, 1, 1], [1.0; 3]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[CellId::new(0)]);
        let group = levels.sibling_group(CellId::new(3)).unwrap();
        let plan = merge(&group, &fine, &levels).unwrap();
        let (coarse, map) = plan.commit(&fine, &mut levels).unwrap();
        assert_eq!(coarse.n_cells(), 1);
        assert_eq!(coarse.n_points(), 8);
        assert_eq!(coarse.n_faces(), 6);
        assert_eq!(face_sets(&coarse), face_sets(&mesh));
        assert_eq!(levels.cell_level(CellId::new(0)), 0);
        assert_eq!(map.cells_from_cells[0].len(), 8);
        assert!(map.faces_from_faces.iter().all(|from| from.len() == 4));
        assert!(levels.mergeable_groups().is_empty());
        check_closed_cells(&coarse).unwrap();
    }

    #[test]
    fn partial_groups_are_rejected() {
        let mesh = block_mesh([1, 1, 1], [1.0; 3]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[CellId::new(0)]);
        let group = levels.sibling_group(CellId::new(0)).unwrap();
        let before = levels.clone();
        assert!(matches!(
            merge(&group[..7], &fine, &levels),
            Err(MeshError::Invariant(_))
        ));
        assert_eq!(levels, before);
    }

    #[test]
    fn neighbour_merge_restores_the_row() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[CellId::new(0)]);
        let plan = merge_groups(&fine, &levels, &levels.mergeable_groups()).unwrap();
        let (coarse, _) = plan.commit(&fine, &mut levels).unwrap();
        assert_eq!(coarse.n_cells(), 2);
        assert_eq!(coarse.n_points(), 12);
        assert_eq!(coarse.n_faces(), 11);
        assert_eq!(face_sets(&coarse), face_sets(&mesh));
    }

    #[test]
    fn joined_face_seen_from_the_parent_is_flipped() {
        // the pieces between the children and cell 1 are owned by cell 1; the
        // joined face is owned by the parent, cell 0
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[CellId::new(0)]);
        let plan = merge_groups(&fine, &levels, &levels.mergeable_groups()).unwrap();
        let (coarse, map) = plan.commit(&fine, &mut levels).unwrap();
        let flipped: Vec<FaceId> = (0..coarse.n_faces())
            .map(FaceId::new)
            .filter(|f| map.flip_map[f.index()])
            .collect();
        assert_eq!(flipped.len(), 1);
        let face = coarse.face(flipped[0]);
        assert_eq!((face.owner, face.neighbour), (CellId::new(0), Some(CellId::new(1))));
        assert_eq!(map.faces_from_faces[flipped[0].index()].len(), 4);
    }

    #[test]
    fn two_adjacent_groups_merge_together() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[CellId::new(0), CellId::new(1)]);
        assert_eq!(fine.n_cells(), 16);
        let plan = merge_groups(&fine, &levels, &levels.mergeable_groups()).unwrap();
        let (coarse, _) = plan.commit(&fine, &mut levels).unwrap();
        assert_eq!(face_sets(&coarse), face_sets(&mesh));
        check_closed_cells(&coarse).unwrap();
    }

    #[test]
    fn shared_points_survive_a_refined_neighbour() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[CellId::new(0), CellId::new(1)]);
        let first = levels.mergeable_groups()[0];
        let plan = merge_groups(&fine, &levels, &[first]).unwrap();
        let (half, _) = plan.commit(&fine, &mut levels).unwrap();
        assert_eq!(half.n_cells(), 9);
        assert_eq!(half.n_points(), 31);
        assert_eq!(half.n_faces(), 41);
        check_closed_cells(&half).unwrap();
        assert_eq!(levels.mergeable_groups().len(), 1);
    }

    #[test]
    fn coarse_and_fine_groups_merge_one_level_at_a_time() {
        let mesh = block_mesh([2, 1, 1], [2.0, 1.0, 1.0]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[CellId::new(0), CellId::new(1)]);
        let second = levels.sibling_group(CellId::new(1)).unwrap();
        let finer = refine(&fine, &mut levels, &second);
        check_closed_cells(&finer).unwrap();

        // the level 0 group of cell 0 beside eight level 1 groups
        let groups = levels.mergeable_groups();
        assert_eq!(groups.len(), 9);
        let batches = level_batches(&levels, &groups).unwrap();
        assert_eq!(batches.iter().map(|(l, b)| (*l, b.len())).collect::<Vec<_>>(), [(1, 8), (0, 1)]);

        let before = levels.clone();
        assert!(matches!(
            merge_groups(&finer, &levels, &groups),
            Err(MeshError::Invariant(_))
        ));
        assert_eq!(levels, before);

        let (half, maps) = merge_by_level(&finer, &mut levels, &groups).unwrap();
        assert_eq!(maps.len(), 2);
        let mut reference = RefinementLevelState::for_mesh(&mesh);
        let only_second = refine(&mesh, &mut reference, &[CellId::new(1)]);
        assert_eq!(face_sets(&half), face_sets(&only_second));
        check_closed_cells(&half).unwrap();

        let rest = levels.mergeable_groups();
        let (coarse, _) = merge_by_level(&half, &mut levels, &rest).unwrap();
        assert_eq!(face_sets(&coarse), face_sets(&mesh));
        assert_eq!(levels.records().count(), 0);
    }

    #[test]
    fn joined_faces_lose_their_hanging_points() {
        let mesh = block_mesh([1, 1, 1], [1.0; 3]).unwrap();
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[CellId::new(0)]);
        let plan = merge_groups(&fine, &levels, &levels.mergeable_groups()).unwrap();
        let (coarse, _) = plan.commit(&fine, &mut levels).unwrap();
        assert!(coarse.faces().iter().all(|f| f.points.len() == 4));
    }
}
