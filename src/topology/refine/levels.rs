//! Refinement levels and split history.
//!
//! [`RefinementLevelState`] owns the per-cell and per-point refinement levels
//! and the arena of [`SplitRecord`]s. Each record describes one executed
//! 2x2x2 split: the 8 children in octant order, the anchors of the parent and
//! the points the split created. A record is the only way to undo a split, so
//! a merge is accepted only for the exact 8 leaves of one record.
//!
//! Records are tombstoned (`None`) rather than removed, so [`RecordId`]s stay
//! valid across merges. After every commit the whole state is carried through
//! the commit's [`MeshMap`]; a record whose cells or points no longer exist is
//! dropped together with its ancestors.

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshError;
use crate::topology::apply::MeshMap;
use crate::topology::ids::{CellId, FaceId, PointId};
use crate::topology::mesh::PolyMesh;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a record in the split history arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u32);

impl RecordId {
    pub const fn new(raw: usize) -> Self {
        RecordId(raw as u32)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordId").field(&self.0).finish()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One child position of a split.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildSlot {
    /// The child is a current cell.
    Leaf(CellId),
    /// The child was split again.
    Split(RecordId),
}

/// A parent hex face that was split into four sub-faces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceSplit {
    /// Index into [`crate::topology::hex::HEX_FACES`].
    pub hex_face: u8,
    pub corners: [PointId; 4],
    pub face_mid: PointId,
    /// Sub-face at each corner. Informational: `None` once a later commit
    /// removed the face.
    pub sub_faces: [Option<FaceId>; 4],
}

/// One executed split.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRecord {
    pub parent: Option<RecordId>,
    /// Level of the split cell; its children are one level finer.
    pub level: u32,
    pub children: [ChildSlot; 8],
    pub anchors: [PointId; 8],
    pub cell_mid: PointId,
    pub face_mids: [PointId; 6],
    pub edge_mids: [PointId; 12],
    pub face_splits: Vec<FaceSplit>,
}

impl SplitRecord {
    /// The 8 children when none of them was split again.
    pub fn leaves(&self) -> Option<[CellId; 8]> {
        let mut out = [CellId::new(0); 8];
        for (slot, child) in out.iter_mut().zip(&self.children) {
            match child {
                ChildSlot::Leaf(c) => *slot = *c,
                ChildSlot::Split(_) => return None,
            }
        }
        Some(out)
    }

    /// Points the split created, the cell mid first.
    pub fn created_points(&self) -> impl Iterator<Item = PointId> + '_ {
        std::iter::once(self.cell_mid)
            .chain(self.face_mids.iter().copied())
            .chain(self.edge_mids.iter().copied())
    }
}

/// A split as produced by the splitter, before it is recorded.
///
/// Produced in edit identities; [`PendingSplit::resolve`] carries it to the
/// committed numbering.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingSplit {
    /// Children in octant order; child 0 keeps the parent's cell.
    pub children: [CellId; 8],
    pub level: u32,
    pub anchors: [PointId; 8],
    pub cell_mid: PointId,
    pub face_mids: [PointId; 6],
    pub edge_mids: [PointId; 12],
    pub face_splits: Vec<FaceSplit>,
}

impl PendingSplit {
    /// Renumber through the commit that executed the split.
    ///
    /// # Errors
    /// [`MeshError::Invariant`] when a child or point did not survive.
    pub fn resolve(&self, map: &MeshMap) -> Result<PendingSplit, MeshError> {
        let cell = |c: CellId| {
            map.resolve_cell(c)
                .ok_or_else(|| MeshError::invariant(format!("split child {c} was not committed")))
        };
        let point = |p: PointId| {
            map.resolve_point(p)
                .ok_or_else(|| MeshError::invariant(format!("split point {p} was not committed")))
        };
        let mut children = self.children;
        for c in &mut children {
            *c = cell(*c)?;
        }
        let mut anchors = self.anchors;
        for p in &mut anchors {
            *p = point(*p)?;
        }
        let mut face_mids = self.face_mids;
        for p in &mut face_mids {
            *p = point(*p)?;
        }
        let mut edge_mids = self.edge_mids;
        for p in &mut edge_mids {
            *p = point(*p)?;
        }
        let face_splits = self
            .face_splits
            .iter()
            .map(|fs| {
                let mut corners = fs.corners;
                for p in &mut corners {
                    *p = point(*p)?;
                }
                Ok(FaceSplit {
                    hex_face: fs.hex_face,
                    corners,
                    face_mid: point(fs.face_mid)?,
                    sub_faces: fs.sub_faces.map(|f| f.and_then(|f| map.resolve_face(f))),
                })
            })
            .collect::<Result<Vec<_>, MeshError>>()?;
        Ok(PendingSplit {
            children,
            level: self.level,
            anchors,
            cell_mid: point(self.cell_mid)?,
            face_mids,
            edge_mids,
            face_splits,
        })
    }
}

/// Per-cell and per-point levels plus the split history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementLevelState {
    pub(crate) cell_level: Vec<u32>,
    pub(crate) point_level: Vec<u32>,
    pub(crate) history: Vec<Option<SplitRecord>>,
    pub(crate) cell_record: Vec<Option<RecordId>>,
}

impl RefinementLevelState {
    /// Everything at level 0, no history.
    pub fn new(n_cells: usize, n_points: usize) -> Self {
        Self {
            cell_level: vec![0; n_cells],
            point_level: vec![0; n_points],
            history: Vec::new(),
            cell_record: vec![None; n_cells],
        }
    }

    /// Level-0 state sized for `mesh`.
    pub fn for_mesh(mesh: &PolyMesh) -> Self {
        Self::new(mesh.n_cells(), mesh.n_points())
    }

    /// Levels of a mesh refined elsewhere. Without history nothing in it can
    /// be unrefined.
    pub fn from_levels(cell_level: Vec<u32>, point_level: Vec<u32>) -> Self {
        let n_cells = cell_level.len();
        Self {
            cell_level,
            point_level,
            history: Vec::new(),
            cell_record: vec![None; n_cells],
        }
    }

    pub fn n_cells(&self) -> usize {
        self.cell_level.len()
    }

    pub fn n_points(&self) -> usize {
        self.point_level.len()
    }

    #[inline]
    pub fn cell_level(&self, cell: CellId) -> u32 {
        self.cell_level[cell.index()]
    }

    #[inline]
    pub fn point_level(&self, point: PointId) -> u32 {
        self.point_level[point.index()]
    }

    pub fn cell_levels(&self) -> &[u32] {
        &self.cell_level
    }

    pub fn point_levels(&self) -> &[u32] {
        &self.point_level
    }

    pub fn max_cell_level(&self) -> u32 {
        self.cell_level.iter().copied().max().unwrap_or(0)
    }

    /// Error unless the state is sized for `mesh`.
    pub fn check_sizes(&self, mesh: &PolyMesh) -> Result<(), MeshError> {
        if self.n_cells() != mesh.n_cells() || self.n_points() != mesh.n_points() {
            return Err(MeshError::input(format!(
                "levels for {} cells and {} points, mesh has {} and {}",
                self.n_cells(),
                self.n_points(),
                mesh.n_cells(),
                mesh.n_points()
            )));
        }
        Ok(())
    }

    pub fn record(&self, id: RecordId) -> Option<&SplitRecord> {
        self.history.get(id.index()).and_then(Option::as_ref)
    }

    /// Live records.
    pub fn records(&self) -> impl Iterator<Item = (RecordId, &SplitRecord)> + '_ {
        self.history
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (RecordId::new(i), r)))
    }

    /// Record in which `cell` is a child.
    pub fn record_of(&self, cell: CellId) -> Option<RecordId> {
        self.cell_record.get(cell.index()).copied().flatten()
    }

    /// The 8 leaves of `id`, if none of them was split again.
    pub fn group_cells(&self, id: RecordId) -> Option<[CellId; 8]> {
        self.record(id).and_then(SplitRecord::leaves)
    }

    /// The intact sibling octet `cell` belongs to.
    pub fn sibling_group(&self, cell: CellId) -> Option<[CellId; 8]> {
        self.record_of(cell).and_then(|r| self.group_cells(r))
    }

    /// Records whose 8 children are all current cells.
    pub fn mergeable_groups(&self) -> Vec<RecordId> {
        self.records()
            .filter(|(_, r)| r.leaves().is_some())
            .map(|(id, _)| id)
            .collect()
    }

    /// Store a committed split.
    ///
    /// `split` must already be in committed numbering; `children[0]` is the
    /// cell that was split.
    pub fn record_split(&mut self, split: PendingSplit) -> Result<RecordId, MeshError> {
        if let Some(c) = split.children.iter().find(|c| c.index() >= self.n_cells()) {
            return Err(MeshError::invariant(format!("split child {c} out of range")));
        }
        if let Some(p) = split
            .anchors
            .iter()
            .chain(&split.face_mids)
            .chain(&split.edge_mids)
            .find(|p| p.index() >= self.n_points())
        {
            return Err(MeshError::invariant(format!("split point {p} out of range")));
        }
        let parent_cell = split.children[0];
        let parent = self.record_of(parent_cell);
        let id = RecordId::new(self.history.len());
        if let Some(pid) = parent {
            let slot = self
                .history
                .get_mut(pid.index())
                .and_then(Option::as_mut)
                .and_then(|r| {
                    r.children
                        .iter_mut()
                        .find(|s| **s == ChildSlot::Leaf(parent_cell))
                })
                .ok_or_else(|| {
                    MeshError::invariant(format!("{pid} does not hold {parent_cell}"))
                })?;
            *slot = ChildSlot::Split(id);
        }
        for &c in &split.children {
            self.cell_level[c.index()] = split.level + 1;
            self.cell_record[c.index()] = Some(id);
        }
        self.history.push(Some(SplitRecord {
            parent,
            level: split.level,
            children: split.children.map(ChildSlot::Leaf),
            anchors: split.anchors,
            cell_mid: split.cell_mid,
            face_mids: split.face_mids,
            edge_mids: split.edge_mids,
            face_splits: split.face_splits,
        }));
        Ok(id)
    }

    /// Check that `children` are exactly the 8 leaves of one record without
    /// changing anything.
    ///
    /// # Errors
    /// [`MeshError::Invariant`] for any other count, duplicates, cells from
    /// different records, a child that was split again, or a level mismatch.
    pub fn check_merge(&self, children: &[CellId]) -> Result<RecordId, MeshError> {
        if children.len() != 8 {
            return Err(MeshError::invariant(format!(
                "a sibling group has 8 cells, got {}",
                children.len()
            )));
        }
        if let Some(c) = children.iter().find(|c| c.index() >= self.n_cells()) {
            return Err(MeshError::input(format!("cell {c} out of range")));
        }
        let id = self
            .record_of(children[0])
            .ok_or_else(|| MeshError::invariant(format!("{} has no split record", children[0])))?;
        let record = self
            .record(id)
            .ok_or_else(|| MeshError::invariant(format!("{id} was dropped")))?;
        let leaves = record
            .leaves()
            .ok_or_else(|| MeshError::invariant(format!("{id} has a child that was split again")))?;
        let mut given = children.to_vec();
        given.sort_unstable();
        given.dedup();
        let mut expect = leaves.to_vec();
        expect.sort_unstable();
        if given != expect {
            return Err(MeshError::invariant(format!(
                "cells {children:?} are not the sibling group of {id}"
            )));
        }
        if let Some(c) = leaves
            .iter()
            .find(|c| self.cell_level(**c) != record.level + 1)
        {
            return Err(MeshError::invariant(format!(
                "sibling {c} is at level {}, expected {}",
                self.cell_level(*c),
                record.level + 1
            )));
        }
        Ok(id)
    }

    /// Consume the record of a sibling group that is about to be merged.
    ///
    /// The lowest child survives as the merged cell: it takes the record's
    /// level and replaces the record in its parent. Call before committing the
    /// merge, then [`Self::update_after_topology_change`] with its map.
    pub fn record_merge(&mut self, children: &[CellId]) -> Result<SplitRecord, MeshError> {
        let id = self.check_merge(children)?;
        let record = self.history[id.index()]
            .take()
            .ok_or_else(|| MeshError::invariant(format!("{id} was dropped")))?;
        let survivor = children.iter().copied().min().unwrap_or(children[0]);
        if let Some(pid) = record.parent {
            if let Some(slot) = self
                .history
                .get_mut(pid.index())
                .and_then(Option::as_mut)
                .and_then(|p| p.children.iter_mut().find(|s| **s == ChildSlot::Split(id)))
            {
                *slot = ChildSlot::Leaf(survivor);
            }
        }
        for &c in children {
            self.cell_record[c.index()] = None;
        }
        self.cell_record[survivor.index()] = record.parent;
        self.cell_level[survivor.index()] = record.level;
        Ok(record)
    }

    /// Carry levels and history through a commit.
    ///
    /// New cells take the level of the cell they originate from; new points
    /// take the level the script gave them. Records that lost a cell or point
    /// are dropped with their ancestors; their descendants forget the parent.
    pub fn update_after_topology_change(&mut self, map: &MeshMap) {
        let mut cell_level = Vec::with_capacity(map.n_cells());
        let mut cell_record = Vec::with_capacity(map.n_cells());
        for (new, origin) in map.cell_map.iter().enumerate() {
            let level = origin.map_or(0, |o| self.cell_level.get(o.index()).copied().unwrap_or(0));
            cell_level.push(level);
            let survived = origin.is_some_and(|o| {
                map.reverse_cell_map.get(o.index()).copied().flatten() == Some(CellId::new(new))
            });
            cell_record.push(if survived {
                origin.and_then(|o| self.cell_record.get(o.index()).copied().flatten())
            } else {
                None
            });
        }

        let mut point_level = vec![0; map.n_points()];
        for (old, new) in map.reverse_point_map.iter().enumerate() {
            if let Some(new) = new {
                point_level[new.index()] = self.point_level.get(old).copied().unwrap_or(0);
            }
        }
        for (new, level) in map.added_points.iter().zip(&map.added_point_levels) {
            point_level[new.index()] = *level;
        }

        let mut lost = Vec::new();
        for (i, slot) in self.history.iter_mut().enumerate() {
            if let Some(record) = slot {
                if !remap_record(record, map) {
                    lost.push(RecordId::new(i));
                }
            }
        }

        let mut dropped = 0usize;
        let mut stack = lost;
        while let Some(id) = stack.pop() {
            let Some(record) = self.history[id.index()].take() else {
                continue;
            };
            dropped += 1;
            for child in record.children {
                if let ChildSlot::Split(sub) = child {
                    if let Some(r) = self.history[sub.index()].as_mut() {
                        r.parent = None;
                    }
                }
            }
            if let Some(parent) = record.parent {
                stack.push(parent);
            }
        }
        // leaves of dropped records
        for r in cell_record.iter_mut() {
            if r.is_some_and(|id| self.history[id.index()].is_none()) {
                *r = None;
            }
        }
        if dropped > 0 {
            log::warn!("dropped {dropped} split records whose cells or points were removed");
        }

        self.cell_level = cell_level;
        self.cell_record = cell_record;
        self.point_level = point_level;
        crate::debug_invariants!(self.validate_invariants(), "levels after topology change");
    }
}

/// Renumber one record in place; `false` when something it needs is gone.
fn remap_record(record: &mut SplitRecord, map: &MeshMap) -> bool {
    let mut intact = true;
    for slot in &mut record.children {
        if let ChildSlot::Leaf(c) = slot {
            match map.reverse_cell_map.get(c.index()).copied().flatten() {
                Some(new) => *c = new,
                None => intact = false,
            }
        }
    }
    let mut point = |p: &mut PointId| match map.reverse_point_map.get(p.index()).copied().flatten() {
        Some(new) => *p = new,
        None => intact = false,
    };
    record.anchors.iter_mut().for_each(&mut point);
    point(&mut record.cell_mid);
    record.face_mids.iter_mut().for_each(&mut point);
    record.edge_mids.iter_mut().for_each(&mut point);
    for split in &mut record.face_splits {
        split.corners.iter_mut().for_each(&mut point);
        point(&mut split.face_mid);
        for f in &mut split.sub_faces {
            *f = f.and_then(|f| map.reverse_face_map.get(f.index()).copied().flatten());
        }
    }
    intact
}

impl DebugInvariants for RefinementLevelState {
    fn validate_invariants(&self) -> Result<(), MeshError> {
        if self.cell_record.len() != self.cell_level.len() {
            return Err(MeshError::invariant(format!(
                "{} cell records for {} cell levels",
                self.cell_record.len(),
                self.cell_level.len()
            )));
        }
        for (c, id) in self.cell_record.iter().enumerate() {
            let Some(id) = id else { continue };
            let cell = CellId::new(c);
            let record = self
                .record(*id)
                .ok_or_else(|| MeshError::invariant(format!("{cell} points at dropped {id}")))?;
            if !record.children.contains(&ChildSlot::Leaf(cell)) {
                return Err(MeshError::invariant(format!("{id} does not list {cell}")));
            }
        }
        for (id, record) in self.records() {
            for child in &record.children {
                match child {
                    ChildSlot::Leaf(c) => {
                        if self.record_of(*c) != Some(id) {
                            return Err(MeshError::invariant(format!(
                                "{c} does not point back at {id}"
                            )));
                        }
                    }
                    ChildSlot::Split(sub) => {
                        let back = self.record(*sub).and_then(|r| r.parent);
                        if back != Some(id) {
                            return Err(MeshError::invariant(format!(
                                "{sub} does not point back at {id}"
                            )));
                        }
                    }
                }
            }
            if let Some(parent) = record.parent {
                let listed = self
                    .record(parent)
                    .is_some_and(|p| p.children.contains(&ChildSlot::Split(id)));
                if !listed {
                    return Err(MeshError::invariant(format!("{parent} does not list {id}")));
                }
            }
            if record
                .created_points()
                .chain(record.anchors)
                .any(|p| p.index() >= self.point_level.len())
            {
                return Err(MeshError::invariant(format!("{id} names a missing point")));
            }
        }
        Ok(())
    }

    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "RefinementLevelState");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_of(children: [usize; 8], level: u32, first_point: usize) -> PendingSplit {
        let p = |k: usize| PointId::new(first_point + k);
        PendingSplit {
            children: children.map(CellId::new),
            level,
            anchors: std::array::from_fn(p),
            cell_mid: p(8),
            face_mids: std::array::from_fn(|k| p(9 + k)),
            edge_mids: std::array::from_fn(|k| p(15 + k)),
            face_splits: Vec::new(),
        }
    }

    fn state_with_one_split() -> RefinementLevelState {
        let mut state = RefinementLevelState::new(8, 27);
        state
            .record_split(split_of([0, 1, 2, 3, 4, 5, 6, 7], 0, 0))
            .unwrap();
        state
    }

    #[test]
    fn split_sets_levels_and_siblings() {
        let state = state_with_one_split();
        assert!(state.cells_all_at(1));
        let group = state.sibling_group(CellId::new(5)).unwrap();
        assert_eq!(group, [0, 1, 2, 3, 4, 5, 6, 7].map(CellId::new));
        assert_eq!(state.mergeable_groups(), vec![RecordId::new(0)]);
        state.validate_invariants().unwrap();
    }

    #[test]
    fn merge_requires_the_whole_octet() {
        let mut state = state_with_one_split();
        let seven: Vec<CellId> = (0..7).map(CellId::new).collect();
        assert!(matches!(
            state.record_merge(&seven),
            Err(MeshError::Invariant(_))
        ));
        let mut dup: Vec<CellId> = (0..7).map(CellId::new).collect();
        dup.push(CellId::new(0));
        assert!(state.check_merge(&dup).is_err());
        // untouched by the failed attempts
        assert_eq!(state.mergeable_groups().len(), 1);

        let all: Vec<CellId> = (0..8).rev().map(CellId::new).collect();
        let record = state.record_merge(&all).unwrap();
        assert_eq!(record.level, 0);
        assert_eq!(state.cell_level(CellId::new(0)), 0);
        assert!(state.record_of(CellId::new(0)).is_none());
        assert!(state.mergeable_groups().is_empty());
    }

    #[test]
    fn nested_split_blocks_parent_merge() {
        let mut state = state_with_one_split();
        state.cell_level.resize(15, 0);
        state.cell_record.resize(15, None);
        state.point_level.resize(54, 0);
        let inner = state
            .record_split(split_of([3, 8, 9, 10, 11, 12, 13, 14], 1, 27))
            .unwrap();
        assert_eq!(state.record(inner).unwrap().parent, Some(RecordId::new(0)));
        assert_eq!(state.cell_level(CellId::new(3)), 2);
        assert!(state.sibling_group(CellId::new(0)).is_none());
        assert_eq!(state.mergeable_groups(), vec![inner]);
        state.validate_invariants().unwrap();

        let inner_cells: Vec<CellId> = [3, 8, 9, 10, 11, 12, 13, 14].map(CellId::new).to_vec();
        state.record_merge(&inner_cells).unwrap();
        assert_eq!(state.cell_level(CellId::new(3)), 1);
        assert_eq!(state.sibling_group(CellId::new(0)).unwrap()[3], CellId::new(3));
    }

    #[test]
    fn lost_cell_drops_record() {
        let mut state = state_with_one_split();
        // a commit that removes cell 7 and keeps everything else
        let mut map = MeshMap {
            n_old_points: 27,
            n_old_faces: 0,
            n_old_cells: 8,
            ..MeshMap::default()
        };
        map.reverse_cell_map = (0..8).map(|c| (c < 7).then(|| CellId::new(c))).collect();
        map.cell_map = (0..7).map(|c| Some(CellId::new(c))).collect();
        map.reverse_point_map = (0..27).map(|p| Some(PointId::new(p))).collect();
        map.point_map = map.reverse_point_map.clone();
        state.update_after_topology_change(&map);
        assert!(state.mergeable_groups().is_empty());
        assert!(state.record_of(CellId::new(2)).is_none());
        assert_eq!(state.cell_level(CellId::new(2)), 1);
    }

    impl RefinementLevelState {
        fn cells_all_at(&self, level: u32) -> bool {
            self.cell_level.iter().all(|&l| l == level)
        }
    }
}
