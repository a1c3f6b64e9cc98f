//! The refinement cycle driver.
//!
//! [`DynamicRefineMesh`] owns the committed mesh, its refinement levels and
//! the registered fields, and runs one refine/unrefine cycle per
//! [`update`](DynamicRefineMesh::update):
//!
//! 1. candidate selection from the indicator;
//! 2. 2:1 balancing (collective on parallel runs);
//! 3. split commit and field remap;
//! 4. per split level, finest first: exchange of the current levels across
//!    processor faces, merge commit and field remap;
//! 5. publish.
//!
//! Everything in steps 3 and 4 is built on new values. The committed mesh,
//! levels and fields change only when the whole cycle succeeded.

use crate::algs::communicator::{Communicator, NoComm};
use crate::algs::field_transfer::{FieldRegistry, MeshTransition, TransferOptions};
use crate::algs::wire::{FLAG_UNREFINE, WireFaceLevel};
use crate::geometry::MeshGeometry;
use crate::mesh_error::MeshError;
use crate::topology::adapt::{AdaptivityOptions, select_candidates};
use crate::topology::apply::MeshMap;
use crate::topology::coarsen::{level_batches, merge_groups_coupled};
use crate::topology::mesh::PolyMesh;
use crate::topology::refine::checkpoint;
use crate::topology::refine::consistency::{
    ConsistencyOptions, consistent_selection, exchange_processor_levels,
};
use crate::topology::refine::levels::{RecordId, RefinementLevelState};
use crate::topology::refine::protected::{ProtectedCells, protect_unrefinable};
use crate::topology::refine::{RefineOptions, split_cells_coupled};
use crate::topology::snapshot::SharedMesh;
use crate::topology::validation::{check_closed_cells, check_processor_patches};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Everything a cycle can be tuned by.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DynamicRefineOptions {
    pub adaptivity: AdaptivityOptions,
    pub consistency: ConsistencyOptions,
    pub transfer: TransferOptions,
    pub refine: RefineOptions,
    /// Check that every cell is closed after each commit.
    pub check_closed_cells: bool,
}

/// Outcome of one cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Cells split.
    pub refined: usize,
    /// Sibling groups merged.
    pub unrefined: usize,
    /// Balance rounds.
    pub rounds: usize,
    pub cells_before: usize,
    pub cells_after: usize,
}

/// A mesh that refines and unrefines itself from an error indicator.
pub struct DynamicRefineMesh<C: Communicator = NoComm> {
    mesh: Arc<SharedMesh>,
    levels: RefinementLevelState,
    fields: FieldRegistry,
    options: DynamicRefineOptions,
    comm: C,
}

impl DynamicRefineMesh<NoComm> {
    /// Serial driver over an unrefined mesh.
    pub fn serial(mesh: PolyMesh, options: DynamicRefineOptions) -> Self {
        let levels = RefinementLevelState::for_mesh(&mesh);
        Self {
            mesh: Arc::new(SharedMesh::new(mesh)),
            levels,
            fields: FieldRegistry::new(),
            options,
            comm: NoComm,
        }
    }
}

impl<C: Communicator> DynamicRefineMesh<C> {
    /// Driver over an unrefined mesh on one rank of `comm`.
    pub fn new(mesh: PolyMesh, comm: C, options: DynamicRefineOptions) -> Self {
        let levels = RefinementLevelState::for_mesh(&mesh);
        Self {
            mesh: Arc::new(SharedMesh::new(mesh)),
            levels,
            fields: FieldRegistry::new(),
            options,
            comm,
        }
    }

    /// Driver resuming from saved levels.
    pub fn with_levels(
        mesh: PolyMesh,
        levels: RefinementLevelState,
        comm: C,
        options: DynamicRefineOptions,
    ) -> Result<Self, MeshError> {
        levels.check_sizes(&mesh)?;
        Ok(Self {
            mesh: Arc::new(SharedMesh::new(mesh)),
            levels,
            fields: FieldRegistry::new(),
            options,
            comm,
        })
    }

    /// The committed mesh.
    pub fn mesh(&self) -> Arc<PolyMesh> {
        self.mesh.snapshot()
    }

    /// Handle for readers that outlive a borrow of the driver.
    pub fn shared(&self) -> Arc<SharedMesh> {
        Arc::clone(&self.mesh)
    }

    pub fn levels(&self) -> &RefinementLevelState {
        &self.levels
    }

    pub fn fields(&self) -> &FieldRegistry {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut FieldRegistry {
        &mut self.fields
    }

    pub fn options(&self) -> &DynamicRefineOptions {
        &self.options
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Run one refine/unrefine cycle.
    ///
    /// Collective on parallel runs. On error nothing is published and the
    /// driver is left exactly as it was.
    pub fn update(
        &mut self,
        indicator: &[f64],
        protected: &ProtectedCells,
    ) -> Result<CycleReport, MeshError> {
        let start = self.mesh.snapshot();
        self.fields.check_sizes(&start)?;
        protected.check_size(&start)?;
        let protected = protected.union(&protect_unrefinable(&start, &self.levels));

        let candidates =
            select_candidates(&start, &self.levels, indicator, &self.options.adaptivity)?;
        let balanced = consistent_selection(
            &start,
            &self.levels,
            &candidates.refine,
            &candidates.unrefine,
            &protected,
            &self.comm,
            &self.options.consistency,
        )?;

        let mut levels = self.levels.clone();
        let mut fields = self.fields.clone();
        let mut report = CycleReport {
            refined: balanced.refine.len(),
            unrefined: balanced.unrefine.len(),
            rounds: balanced.rounds,
            cells_before: start.n_cells(),
            cells_after: start.n_cells(),
        };

        let plan = split_cells_coupled(
            &start,
            &levels,
            &balanced.refine,
            &balanced.remote,
            &self.comm,
        )?;
        let mut committed: Option<PolyMesh> = None;
        if !plan.is_empty() {
            let (next, map, _) = plan.commit_with(&start, &mut levels, &self.options.refine)?;
            fields = self.remap(&fields, &start, &next, &map)?;
            committed = Some(next);
        }

        // one merge commit per level, finest first, the same levels on every rank
        let batches: BTreeMap<u32, Vec<RecordId>> =
            level_batches(&levels, &balanced.unrefine)?.into_iter().collect();
        let finest = batches.keys().next_back().copied();
        let mut top = 0;
        while self.comm.any(finest.is_some_and(|l| l > top))? {
            top += 1;
        }
        for level in (0..=top).rev() {
            let batch = batches.get(&level).map_or(&[][..], Vec::as_slice);
            if !self.comm.any(!batch.is_empty())? {
                continue;
            }
            let current: &PolyMesh = committed.as_ref().unwrap_or(&*start);
            let mut merging = vec![false; current.n_cells()];
            for &r in batch {
                let cells = levels.group_cells(r).ok_or_else(|| {
                    MeshError::invariant(format!("sibling group {r} did not survive refinement"))
                })?;
                for c in cells {
                    merging[c.index()] = true;
                }
            }
            let remote = exchange_processor_levels(current, &self.comm, |c| {
                let flags = if merging[c.index()] { FLAG_UNREFINE } else { 0 };
                WireFaceLevel::new(levels.cell_level(c), flags)
            })?;
            let plan = merge_groups_coupled(current, &levels, batch, &remote, &self.comm)?;
            if !plan.is_empty() {
                let (next, map) = plan.commit(current, &mut levels)?;
                fields = self.remap(&fields, current, &next, &map)?;
                committed = Some(next);
            }
        }

        let changed = committed.is_some();
        let after: &PolyMesh = committed.as_ref().unwrap_or(&*start);
        if self.options.check_closed_cells && changed {
            check_closed_cells(after)?;
        }
        if self.comm.size() > 1 {
            check_processor_patches(after, &self.comm)?;
        }
        report.cells_after = after.n_cells();

        if let Some(mesh) = committed {
            self.mesh.publish(mesh);
        }
        self.levels = levels;
        self.fields = fields;
        log::info!(
            "refinement cycle: {} split, {} merged, {} rounds, {} -> {} cells",
            report.refined,
            report.unrefined,
            report.rounds,
            report.cells_before,
            report.cells_after
        );
        Ok(report)
    }

    fn remap(
        &self,
        fields: &FieldRegistry,
        old: &PolyMesh,
        new: &PolyMesh,
        map: &MeshMap,
    ) -> Result<FieldRegistry, MeshError> {
        if fields.is_empty() {
            return Ok(FieldRegistry::new());
        }
        let old_geometry = MeshGeometry::new(old)?;
        let new_geometry = MeshGeometry::new(new)?;
        fields.remap(
            &MeshTransition {
                old,
                old_geometry: &old_geometry,
                new,
                new_geometry: &new_geometry,
                map,
            },
            &self.options.transfer,
        )
    }

    /// Write the refinement levels and split history as JSON.
    pub fn save_checkpoint<W: Write>(&self, writer: W) -> Result<(), MeshError> {
        checkpoint::write_json(&self.levels, writer)
    }

    /// Replace the levels and history by a checkpoint of the same mesh.
    pub fn restore_checkpoint<R: Read>(&mut self, reader: R) -> Result<(), MeshError> {
        let levels = checkpoint::read_json(reader)?;
        levels
            .check_sizes(&self.mesh.snapshot())
            .map_err(|e| MeshError::Checkpoint(format!("checkpoint does not fit the mesh: {e}")))?;
        self.levels = levels;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::field_transfer::CellField;
    use crate::algs::meshgen::block_mesh;
    use crate::topology::ids::CellId;

    fn driver(n: usize) -> DynamicRefineMesh {
        let mesh = block_mesh([n, 1, 1], [n as f64, 1.0, 1.0]).unwrap();
        let options = DynamicRefineOptions {
            adaptivity: AdaptivityOptions {
                n_buffer_layers: 0,
                ..Default::default()
            },
            check_closed_cells: true,
            ..Default::default()
        };
        DynamicRefineMesh::serial(mesh, options)
    }

    #[test]
    fn refine_then_unrefine_round_trips() {
        let mut d = driver(3);
        d.fields_mut()
            .insert_scalar("T", CellField::new(vec![1.0, 2.0, 3.0]));
        let none = ProtectedCells::none(3);
        let report = d.update(&[0.2, 0.9, 0.2], &none).unwrap();
        assert_eq!(report.refined, 1);
        assert_eq!(report.cells_after, 10);
        assert_eq!(d.levels().max_cell_level(), 1);
        let t = d.fields().scalar("T").unwrap();
        assert_eq!(t.len(), 10);

        let protected = ProtectedCells::none(10);
        let report = d.update(&[0.0; 10], &protected).unwrap();
        assert_eq!(report.unrefined, 1);
        assert_eq!(report.cells_after, 3);
        assert_eq!(d.fields().scalar("T").unwrap().values(), &[1.0, 2.0, 3.0]);
        assert_eq!(d.levels().max_cell_level(), 0);
    }

    #[test]
    fn failed_cycle_publishes_nothing() {
        let mut d = driver(2);
        let before = d.mesh();
        let levels = d.levels().clone();
        assert!(d.update(&[1.0], &ProtectedCells::none(2)).is_err());
        assert!(Arc::ptr_eq(&before, &d.mesh()));
        assert_eq!(d.levels(), &levels);
        assert_eq!(d.shared().generation(), 0);
    }

    #[test]
    fn quiet_indicator_changes_nothing() {
        let mut d = driver(2);
        let report = d.update(&[0.3, 0.3], &ProtectedCells::none(2)).unwrap();
        assert_eq!(report.refined + report.unrefined, 0);
        assert_eq!(report.cells_before, report.cells_after);
        assert_eq!(d.shared().generation(), 0);
    }

    #[test]
    fn checkpoint_restores_levels() {
        let mut d = driver(2);
        d.update(&[0.9, 0.0], &ProtectedCells::none(2)).unwrap();
        let mut buf = Vec::new();
        d.save_checkpoint(&mut buf).unwrap();
        let saved = d.levels().clone();

        let mut other = DynamicRefineMesh::serial((*d.mesh()).clone(), *d.options());
        assert_ne!(other.levels(), &saved);
        other.restore_checkpoint(buf.as_slice()).unwrap();
        assert_eq!(other.levels(), &saved);
        assert_eq!(other.levels().cell_level(CellId::new(0)), 1);

        let mut small = driver(1);
        assert!(matches!(
            small.restore_checkpoint(buf.as_slice()),
            Err(MeshError::Checkpoint(_))
        ));
    }
}
