//! 2:1 balance of a refine/unrefine request.
//!
//! [`consistent_selection`] turns raw candidates into sets that keep every
//! internal and processor face within one level after the cycle. Refinement
//! only ever grows the set, except that a cell whose neighbour cannot follow
//! (protected, or already blocked) is removed and blocked for good; that makes
//! the relaxation monotone and bounded. Unrefinement only ever shrinks, one
//! whole sibling group at a time.
//!
//! Processor faces see the remote cell through a [`WireFaceLevel`] exchanged
//! once per round. A round ends with a global OR of "changed", so every rank
//! leaves the loop in the same round.

use crate::algs::communicator::Communicator;
use crate::algs::wire::{
    self, FLAG_REFINABLE, FLAG_REFINE, FLAG_UNREFINE, KIND_FACE_LEVELS, TAG_LEVELS, WireFaceLevel,
};
use crate::mesh_error::MeshError;
use crate::topology::ids::{CellId, FaceId};
use crate::topology::mesh::PolyMesh;
use crate::topology::refine::levels::{RecordId, RefinementLevelState};
use crate::topology::refine::protected::ProtectedCells;
use hashbrown::HashMap;

/// Tuning for the balance relaxation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsistencyOptions {
    /// Rounds per phase before giving up with [`MeshError::NonConverged`].
    pub max_rounds: usize,
}

impl Default for ConsistencyOptions {
    fn default() -> Self {
        Self { max_rounds: 64 }
    }
}

/// The cells across this rank's processor faces, as last exchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteCells {
    faces: HashMap<FaceId, WireFaceLevel>,
}

impl RemoteCells {
    pub fn get(&self, face: FaceId) -> Option<WireFaceLevel> {
        self.faces.get(&face).copied()
    }

    /// Current level of the remote cell when it refines in this cycle.
    pub fn refining_level(&self, face: FaceId) -> Option<u32> {
        self.get(face).filter(WireFaceLevel::refine).map(|r| r.level())
    }

    /// Level of the remote cell after the cycle.
    pub fn new_level(&self, face: FaceId) -> Option<u32> {
        self.get(face).map(|r| r.new_level())
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// Send the state of each processor face's local cell to the neighbouring
/// rank and collect the remote states.
///
/// Collective: every rank with processor patches must call it in the same
/// round.
pub fn exchange_processor_levels<C, F>(
    mesh: &PolyMesh,
    comm: &C,
    state: F,
) -> Result<RemoteCells, MeshError>
where
    C: Communicator,
    F: Fn(CellId) -> WireFaceLevel,
{
    let mut out = RemoteCells::default();
    for (patch, rank) in mesh.processor_patches() {
        let range = mesh.patch_range(patch);
        let local: Vec<WireFaceLevel> = mesh.faces()[range.clone()]
            .iter()
            .map(|f| state(f.owner))
            .collect();
        let send = wire::encode(KIND_FACE_LEVELS, &local);
        let mut recv = vec![0u8; send.len()];
        comm.exchange(rank, TAG_LEVELS, &send, &mut recv)?;
        let remote: Vec<WireFaceLevel> = wire::decode(KIND_FACE_LEVELS, &recv)?;
        if remote.len() != local.len() {
            return Err(MeshError::corruption(format!(
                "processor patch {patch}: {} faces here, {} on rank {rank}",
                local.len(),
                remote.len()
            )));
        }
        out.faces
            .extend(range.map(FaceId::new).zip(remote));
    }
    Ok(out)
}

/// Balanced candidate sets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Consistent {
    /// Cells to split, ascending.
    pub refine: Vec<CellId>,
    /// Sibling groups to merge, ascending.
    pub unrefine: Vec<RecordId>,
    /// Relaxation rounds over both phases.
    pub rounds: usize,
    /// Remote cells as seen in the final refinement round.
    pub remote: RemoteCells,
}

struct Balance<'a> {
    levels: &'a RefinementLevelState,
    protected: &'a ProtectedCells,
    refine: Vec<bool>,
    blocked: Vec<bool>,
}

impl Balance<'_> {
    fn new_level(&self, c: CellId) -> u32 {
        self.levels.cell_level(c) + u32::from(self.refine[c.index()])
    }

    fn refinable(&self, c: CellId) -> bool {
        let i = c.index();
        !self.protected.contains(c) && !self.blocked[i] && !self.refine[i]
    }

    /// `fine` is more than one level above `coarse`: raise `coarse`, or give
    /// up on `fine`. Returns whether anything changed.
    fn resolve(&mut self, fine: CellId, coarse: CellId) -> bool {
        if self.refinable(coarse) {
            self.refine[coarse.index()] = true;
            true
        } else if self.refine[fine.index()] {
            self.refine[fine.index()] = false;
            self.blocked[fine.index()] = true;
            true
        } else {
            false
        }
    }

    fn wire_state(&self, c: CellId) -> WireFaceLevel {
        let mut flags = 0;
        if self.refinable(c) {
            flags |= FLAG_REFINABLE;
        }
        if self.refine[c.index()] {
            flags |= FLAG_REFINE;
        }
        WireFaceLevel::new(self.levels.cell_level(c), flags)
    }

    fn relax_internal(&mut self, mesh: &PolyMesh) -> bool {
        let mut changed = false;
        loop {
            let mut sweep = false;
            for face in mesh.faces().iter().take_while(|f| f.is_internal()) {
                let (a, Some(b)) = (face.owner, face.neighbour) else {
                    continue;
                };
                let (na, nb) = (self.new_level(a), self.new_level(b));
                if na > nb + 1 {
                    sweep |= self.resolve(a, b);
                } else if nb > na + 1 {
                    sweep |= self.resolve(b, a);
                }
            }
            if !sweep {
                return changed;
            }
            changed = true;
        }
    }
}

/// Balance refine candidates and unrefine groups.
///
/// # Errors
/// - [`MeshError::InvalidInput`] for sizes or ids that do not match `mesh`.
/// - [`MeshError::NonConverged`] when a phase needs more than
///   `options.max_rounds` rounds.
/// - [`MeshError::CommError`] / [`MeshError::TopologyCorruption`] from the
///   processor exchange.
pub fn consistent_selection<C: Communicator>(
    mesh: &PolyMesh,
    levels: &RefinementLevelState,
    refine: &[CellId],
    unrefine: &[RecordId],
    protected: &ProtectedCells,
    comm: &C,
    options: &ConsistencyOptions,
) -> Result<Consistent, MeshError> {
    levels.check_sizes(mesh)?;
    protected.check_size(mesh)?;
    let n = mesh.n_cells();

    let mut balance = Balance {
        levels,
        protected,
        refine: vec![false; n],
        blocked: vec![false; n],
    };
    let mut rejected = 0usize;
    for &c in refine {
        if c.index() >= n {
            return Err(MeshError::input(format!("refine candidate {c} out of range")));
        }
        if protected.contains(c) {
            rejected += 1;
        } else {
            balance.refine[c.index()] = true;
        }
    }
    if rejected > 0 {
        log::warn!("{rejected} protected cells removed from the refine request");
    }

    let processor_faces: Vec<FaceId> = mesh
        .processor_patches()
        .flat_map(|(patch, _)| mesh.patch_range(patch).map(FaceId::new))
        .collect();

    // refinement
    let mut rounds = 0;
    let remote = loop {
        if rounds == options.max_rounds {
            return Err(MeshError::NonConverged { rounds });
        }
        rounds += 1;
        let mut changed = balance.relax_internal(mesh);
        let remote = exchange_processor_levels(mesh, comm, |c| balance.wire_state(c))?;
        for &f in &processor_faces {
            let (Some(theirs), c) = (remote.get(f), mesh.face(f).owner) else {
                continue;
            };
            let (mine, other) = (balance.new_level(c), theirs.new_level());
            if other > mine + 1 && balance.refinable(c) {
                balance.refine[c.index()] = true;
                changed = true;
            } else if mine > other + 1 && !theirs.refinable() && balance.refine[c.index()] {
                balance.refine[c.index()] = false;
                balance.blocked[c.index()] = true;
                changed = true;
            }
        }
        log::debug!("refine balance round {rounds}: changed = {changed}");
        if !comm.any(changed)? {
            break remote;
        }
    };
    let blocked = balance.blocked.iter().filter(|&&b| b).count();
    if blocked > 0 {
        log::warn!("{blocked} refine candidates rejected to keep 2:1 balance");
    }

    // unrefinement
    let mut groups: Vec<(RecordId, [CellId; 8])> = Vec::new();
    let mut in_group: Vec<Option<usize>> = vec![None; n];
    for &r in unrefine {
        let Some(cells) = levels.group_cells(r) else {
            log::warn!("unrefine candidate {r} is not an intact sibling group");
            continue;
        };
        if cells.iter().any(|&c| c.index() >= n || in_group[c.index()].is_some()) {
            continue;
        }
        if cells
            .iter()
            .any(|&c| protected.contains(c) || balance.refine[c.index()])
        {
            continue;
        }
        for c in cells {
            in_group[c.index()] = Some(groups.len());
        }
        groups.push((r, cells));
    }
    let mut alive = vec![true; groups.len()];
    let unrefining = |in_group: &[Option<usize>], alive: &[bool], c: CellId| {
        in_group[c.index()].filter(|&g| alive[g])
    };
    let final_level = |alive: &[bool], c: CellId| {
        let down = u32::from(unrefining(&in_group, alive, c).is_some());
        balance.new_level(c) - down
    };

    let mut unrefine_rounds = 0;
    loop {
        if unrefine_rounds == options.max_rounds {
            return Err(MeshError::NonConverged {
                rounds: unrefine_rounds,
            });
        }
        unrefine_rounds += 1;
        let mut changed = false;
        loop {
            let mut sweep = false;
            for face in mesh.faces().iter().take_while(|f| f.is_internal()) {
                let (a, Some(b)) = (face.owner, face.neighbour) else {
                    continue;
                };
                let (na, nb) = (final_level(&alive, a), final_level(&alive, b));
                let lower = if na + 1 < nb {
                    a
                } else if nb + 1 < na {
                    b
                } else {
                    continue;
                };
                if let Some(g) = unrefining(&in_group, &alive, lower) {
                    alive[g] = false;
                    sweep = true;
                }
            }
            if !sweep {
                break;
            }
            changed = true;
        }
        let remote_final = exchange_processor_levels(mesh, comm, |c| {
            let mut state = balance.wire_state(c);
            if unrefining(&in_group, &alive, c).is_some() {
                state = WireFaceLevel::new(state.level(), FLAG_UNREFINE);
            }
            state
        })?;
        for &f in &processor_faces {
            let (Some(theirs), c) = (remote_final.get(f), mesh.face(f).owner) else {
                continue;
            };
            if final_level(&alive, c) + 1 < theirs.new_level() {
                if let Some(g) = unrefining(&in_group, &alive, c) {
                    alive[g] = false;
                    changed = true;
                }
            }
        }
        log::debug!("unrefine balance round {unrefine_rounds}: changed = {changed}");
        if !comm.any(changed)? {
            break;
        }
    }

    let mut refine: Vec<CellId> = (0..n)
        .filter(|&c| balance.refine[c])
        .map(CellId::new)
        .collect();
    refine.sort_unstable();
    let mut unrefine: Vec<RecordId> = groups
        .iter()
        .zip(&alive)
        .filter(|(_, a)| **a)
        .map(|((r, _), _)| *r)
        .collect();
    unrefine.sort_unstable();
    log::debug!(
        "balanced selection: {} to refine, {} groups to unrefine, {} rounds",
        refine.len(),
        unrefine.len(),
        rounds + unrefine_rounds
    );
    Ok(Consistent {
        refine,
        unrefine,
        rounds: rounds + unrefine_rounds,
        remote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};
    use crate::algs::meshgen::{block_mesh, decomposed_box};
    use crate::topology::ids::PointId;
    use crate::topology::refine::levels::PendingSplit;
    use serial_test::serial;

    fn row(levels: &[u32]) -> (PolyMesh, RefinementLevelState) {
        let mesh = block_mesh([levels.len(), 1, 1], [levels.len() as f64, 1.0, 1.0]).unwrap();
        let state = RefinementLevelState::from_levels(levels.to_vec(), vec![0; mesh.n_points()]);
        (mesh, state)
    }

    fn cells(ids: &[usize]) -> Vec<CellId> {
        ids.iter().copied().map(CellId::new).collect()
    }

    #[test]
    fn refinement_grows_into_coarse_neighbours() {
        let (mesh, levels) = row(&[1, 0, 0]);
        let out = consistent_selection(
            &mesh,
            &levels,
            &cells(&[0]),
            &[],
            &ProtectedCells::none(3),
            &NoComm,
            &ConsistencyOptions::default(),
        )
        .unwrap();
        assert_eq!(out.refine, cells(&[0, 1]));
    }

    #[test]
    fn protected_neighbour_rejects_the_request() {
        let (mesh, levels) = row(&[1, 0, 0]);
        let protected = ProtectedCells::from_cells(3, &cells(&[1])).unwrap();
        let out = consistent_selection(
            &mesh,
            &levels,
            &cells(&[0]),
            &[],
            &protected,
            &NoComm,
            &ConsistencyOptions::default(),
        )
        .unwrap();
        assert!(out.refine.is_empty());
    }

    #[test]
    fn protected_candidates_are_dropped() {
        let (mesh, levels) = row(&[0, 0]);
        let protected = ProtectedCells::from_cells(2, &cells(&[0])).unwrap();
        let out = consistent_selection(
            &mesh,
            &levels,
            &cells(&[0, 1]),
            &[],
            &protected,
            &NoComm,
            &ConsistencyOptions::default(),
        )
        .unwrap();
        assert_eq!(out.refine, cells(&[1]));
    }

    #[test]
    fn round_budget_is_enforced() {
        let (mesh, levels) = row(&[1, 0, 0]);
        let err = consistent_selection(
            &mesh,
            &levels,
            &cells(&[0]),
            &[],
            &ProtectedCells::none(3),
            &NoComm,
            &ConsistencyOptions { max_rounds: 1 },
        )
        .unwrap_err();
        assert_eq!(err, MeshError::NonConverged { rounds: 1 });
    }

    fn fake_group(levels: &mut RefinementLevelState) -> RecordId {
        let p = PointId::new;
        levels
            .record_split(PendingSplit {
                children: std::array::from_fn(CellId::new),
                level: 0,
                anchors: std::array::from_fn(p),
                cell_mid: p(8),
                face_mids: std::array::from_fn(|k| p(9 + k)),
                edge_mids: std::array::from_fn(|k| p(15 + k)),
                face_splits: Vec::new(),
            })
            .unwrap()
    }

    #[test]
    fn unrefinement_keeps_fine_neighbours_balanced() {
        // cells 0..8 pose as one sibling group next to cell 8
        for (neighbour, kept) in [(1, true), (2, false)] {
            let (mesh, mut levels) = row(&[0; 9]);
            let r = fake_group(&mut levels);
            levels.cell_level[8] = neighbour;
            let out = consistent_selection(
                &mesh,
                &levels,
                &[],
                &[r],
                &ProtectedCells::none(9),
                &NoComm,
                &ConsistencyOptions::default(),
            )
            .unwrap();
            assert_eq!(out.unrefine.contains(&r), kept, "neighbour at {neighbour}");
        }
    }

    #[test]
    fn groups_touching_refinement_are_dropped() {
        let (mesh, mut levels) = row(&[0; 9]);
        let r = fake_group(&mut levels);
        let out = consistent_selection(
            &mesh,
            &levels,
            &cells(&[3]),
            &[r],
            &ProtectedCells::none(9),
            &NoComm,
            &ConsistencyOptions::default(),
        )
        .unwrap();
        assert_eq!(out.refine, cells(&[3]));
        assert!(out.unrefine.is_empty());
    }

    fn run_pair(
        rank_levels: [u32; 2],
        requests: [Vec<CellId>; 2],
        protect: [bool; 2],
    ) -> Vec<Consistent> {
        let meshes = decomposed_box([2, 1, 1], [0.0; 3], [2.0, 1.0, 1.0], 2).unwrap();
        let comms = ThreadComm::world(2);
        let handles: Vec<_> = meshes
            .into_iter()
            .zip(comms)
            .zip(requests)
            .enumerate()
            .map(|(rank, ((mesh, comm), request))| {
                let level = rank_levels[rank];
                let guarded = protect[rank];
                std::thread::spawn(move || {
                    let levels =
                        RefinementLevelState::from_levels(vec![level], vec![0; mesh.n_points()]);
                    let protected = if guarded {
                        ProtectedCells::from_cells(1, &[CellId::new(0)]).unwrap()
                    } else {
                        ProtectedCells::none(1)
                    };
                    consistent_selection(
                        &mesh,
                        &levels,
                        &request,
                        &[],
                        &protected,
                        &comm,
                        &ConsistencyOptions::default(),
                    )
                    .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    #[serial]
    fn refinement_crosses_processor_faces() {
        let out = run_pair([1, 0], [cells(&[0]), vec![]], [false, false]);
        assert_eq!(out[0].refine, cells(&[0]));
        assert_eq!(out[1].refine, cells(&[0]));
        assert_eq!(out[0].rounds, out[1].rounds);
        assert_eq!(out[1].remote.len(), 1);
        assert_eq!(out[1].remote.refining_level(FaceId::new(5)), Some(1));
    }

    #[test]
    #[serial]
    fn protected_remote_cell_blocks_refinement() {
        let out = run_pair([1, 0], [cells(&[0]), vec![]], [false, true]);
        assert!(out[0].refine.is_empty());
        assert!(out[1].refine.is_empty());
    }
}
