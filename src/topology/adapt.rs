//! Choosing refinement and unrefinement candidates from an error indicator.

use crate::mesh_error::MeshError;
use crate::topology::ids::CellId;
use crate::topology::mesh::PolyMesh;
use crate::topology::refine::levels::{RecordId, RefinementLevelState};
use itertools::Itertools;

/// Configuration for candidate selection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptivityOptions {
    /// Indicator value above which cells are refined.
    pub refine_threshold: f64,
    /// Indicator value below which a whole sibling group is unrefined.
    pub unrefine_threshold: f64,
    /// Cells at this level are never refined further.
    pub max_refinement: u32,
    /// Refinement stops before the mesh would exceed this many cells.
    pub max_cells: usize,
    /// Face-neighbour layers added around every selected cell.
    pub n_buffer_layers: usize,
}

impl Default for AdaptivityOptions {
    fn default() -> Self {
        Self {
            refine_threshold: 0.5,
            unrefine_threshold: 0.1,
            max_refinement: 2,
            max_cells: 1 << 24,
            n_buffer_layers: 1,
        }
    }
}

impl AdaptivityOptions {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.unrefine_threshold > self.refine_threshold {
            return Err(MeshError::input(format!(
                "unrefine threshold {} above refine threshold {}",
                self.unrefine_threshold, self.refine_threshold
            )));
        }
        Ok(())
    }
}

/// Cells and sibling groups proposed for one cycle, before balancing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Candidates {
    pub refine: Vec<CellId>,
    pub unrefine: Vec<RecordId>,
}

impl Candidates {
    pub fn is_empty(&self) -> bool {
        self.refine.is_empty() && self.unrefine.is_empty()
    }
}

/// Select candidates from a per-cell `indicator`.
///
/// Cells above the refine threshold and below the maximum level are selected
/// and grown by `n_buffer_layers` face neighbours. When the result would push
/// the mesh past `max_cells`, the cells with the highest indicator win.
/// A sibling group is proposed for unrefinement when all 8 leaves are below
/// the unrefine threshold and none of them is selected for refinement.
///
/// # Errors
/// [`MeshError::InvalidInput`] if `indicator` is not one value per cell or the
/// thresholds are inverted.
pub fn select_candidates(
    mesh: &PolyMesh,
    levels: &RefinementLevelState,
    indicator: &[f64],
    options: &AdaptivityOptions,
) -> Result<Candidates, MeshError> {
    options.validate()?;
    if indicator.len() != mesh.n_cells() {
        return Err(MeshError::input(format!(
            "indicator has {} values for {} cells",
            indicator.len(),
            mesh.n_cells()
        )));
    }
    levels.check_sizes(mesh)?;

    let can_refine = |c: CellId| levels.cell_level(c) < options.max_refinement;
    let mut selected: Vec<bool> = mesh
        .cells()
        .map(|c| indicator[c.index()] > options.refine_threshold && can_refine(c))
        .collect();

    if options.n_buffer_layers > 0 && selected.iter().any(|&s| s) {
        let neighbours = mesh.cell_cells();
        for _ in 0..options.n_buffer_layers {
            let front: Vec<CellId> = mesh.cells().filter(|c| selected[c.index()]).collect();
            for c in front {
                for &n in &neighbours[c.index()] {
                    if can_refine(n) {
                        selected[n.index()] = true;
                    }
                }
            }
        }
    }

    let mut refine: Vec<CellId> = mesh
        .cells()
        .filter(|c| selected[c.index()])
        .sorted_by(|a, b| {
            indicator[b.index()]
                .total_cmp(&indicator[a.index()])
                .then(a.cmp(b))
        })
        .collect();
    let room = options.max_cells.saturating_sub(mesh.n_cells()) / 7;
    if refine.len() > room {
        log::warn!(
            "cell budget {} allows {room} of {} refinement candidates",
            options.max_cells,
            refine.len()
        );
        refine.truncate(room);
    }
    refine.sort_unstable();

    let unrefine = levels
        .mergeable_groups()
        .into_iter()
        .filter(|&r| {
            levels.group_cells(r).is_some_and(|cells| {
                cells.iter().all(|c| {
                    indicator[c.index()] < options.unrefine_threshold && !selected[c.index()]
                })
            })
        })
        .collect();

    Ok(Candidates { refine, unrefine })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::block_mesh;

    fn row(n: usize) -> (PolyMesh, RefinementLevelState) {
        let mesh = block_mesh([n, 1, 1], [n as f64, 1.0, 1.0]).unwrap();
        let levels = RefinementLevelState::for_mesh(&mesh);
        (mesh, levels)
    }

    #[test]
    fn threshold_and_buffer_layers() {
        let (mesh, levels) = row(6);
        let mut indicator = vec![0.2; 6];
        indicator[2] = 0.9;
        let opts = AdaptivityOptions {
            n_buffer_layers: 0,
            ..Default::default()
        };
        let picked = select_candidates(&mesh, &levels, &indicator, &opts).unwrap();
        assert_eq!(picked.refine, vec![CellId::new(2)]);

        let opts = AdaptivityOptions {
            n_buffer_layers: 2,
            ..Default::default()
        };
        let picked = select_candidates(&mesh, &levels, &indicator, &opts).unwrap();
        assert_eq!(
            picked.refine,
            (0..5).map(CellId::new).collect::<Vec<_>>()
        );
    }

    #[test]
    fn max_level_and_budget_limit_refinement() {
        let (mesh, _) = row(3);
        let levels = RefinementLevelState::from_levels(vec![2, 0, 0], vec![0; 16]);
        let indicator = [1.0, 0.8, 0.9];
        let opts = AdaptivityOptions {
            n_buffer_layers: 0,
            max_cells: 3 + 7,
            ..Default::default()
        };
        let picked = select_candidates(&mesh, &levels, &indicator, &opts).unwrap();
        assert_eq!(picked.refine, vec![CellId::new(2)]);
    }

    #[test]
    fn bad_inputs_are_rejected() {
        let (mesh, levels) = row(2);
        assert!(matches!(
            select_candidates(&mesh, &levels, &[0.0], &AdaptivityOptions::default()),
            Err(MeshError::InvalidInput(_))
        ));
        let inverted = AdaptivityOptions {
            refine_threshold: 0.1,
            unrefine_threshold: 0.5,
            ..Default::default()
        };
        assert!(select_candidates(&mesh, &levels, &[0.0; 2], &inverted).is_err());
    }
}
