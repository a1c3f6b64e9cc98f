mod util;
use util::*;

use hexref::adapt::{DynamicRefineMesh, DynamicRefineOptions};
use hexref::algs::communicator::NoComm;
use hexref::geometry::MeshGeometry;
use hexref::mesh_error::MeshError;
use hexref::topology::adapt::AdaptivityOptions;
use hexref::topology::apply::apply;
use hexref::topology::coarsen::merge;
use hexref::topology::ids::{CellId, FaceId};
use hexref::topology::refine::consistency::{ConsistencyOptions, consistent_selection};
use hexref::topology::refine::levels::RefinementLevelState;
use hexref::topology::refine::protected::ProtectedCells;
use hexref::topology::refine::split;
use std::sync::Arc;

fn options() -> DynamicRefineOptions {
    DynamicRefineOptions {
        adaptivity: AdaptivityOptions {
            n_buffer_layers: 0,
            ..Default::default()
        },
        check_closed_cells: true,
        ..Default::default()
    }
}

#[test]
fn single_cube_splits_into_eight() {
    let mesh = row(1);
    let levels = RefinementLevelState::for_mesh(&mesh);
    let plan = split(CellId::new(0), &mesh, &levels).unwrap();
    let (fine, map) = apply(&mesh, plan.script.clone()).unwrap();

    assert_eq!(fine.n_cells(), 8);
    assert_eq!(map.children_of(CellId::new(0)).len(), 8);
    assert!(map.cell_map.iter().all(|&c| c == Some(CellId::new(0))));
    assert_eq!(fine.n_internal_faces(), 12);
    for f in 0..6 {
        let pieces = map
            .face_map
            .iter()
            .filter(|&&origin| origin == Some(FaceId::new(f)))
            .count();
        assert_eq!(pieces, 4, "face f{f}");
    }
    assert_eq!(map.face_map.iter().filter(|o| o.is_none()).count(), 12);

    let mut d = DynamicRefineMesh::serial(mesh, options());
    let report = d.update(&[1.0], &ProtectedCells::none(1)).unwrap();
    assert_eq!(report.refined, 1);
    assert_eq!(report.cells_after, 8);
    assert!((0..8).all(|c| d.levels().cell_level(CellId::new(c)) == 1));
    assert_eq!(d.mesh().n_faces(), 36);
}

#[test]
fn protected_coarse_neighbour_rejects_refinement() {
    // cell 0 is one level finer than its protected neighbour, so splitting a
    // child that touches the neighbour would leave a two-level gap
    let mesh = row(2);
    let mut levels = RefinementLevelState::for_mesh(&mesh);
    let fine = refine(&mesh, &mut levels, &[0]);
    let geometry = MeshGeometry::new(&fine).unwrap();
    let touching = fine
        .cells()
        .find(|c| levels.cell_level(*c) == 1 && geometry.cell_centres[c.index()][0] > 0.5)
        .unwrap();
    let protected = ProtectedCells::from_cells(fine.n_cells(), &[CellId::new(1)]).unwrap();

    let balanced = consistent_selection(
        &fine,
        &levels,
        &[touching],
        &[],
        &protected,
        &NoComm,
        &ConsistencyOptions::default(),
    )
    .unwrap();
    assert!(balanced.refine.is_empty());

    let mut d = DynamicRefineMesh::with_levels(fine.clone(), levels.clone(), NoComm, options())
        .unwrap();
    let before = d.mesh();
    let mut indicator = vec![0.3; fine.n_cells()];
    indicator[touching.index()] = 1.0;
    let report = d.update(&indicator, &protected).unwrap();
    assert_eq!(report.refined, 0);
    assert_eq!(report.cells_after, fine.n_cells());
    assert!(Arc::ptr_eq(&before, &d.mesh()));
    assert_eq!(d.levels(), &levels);
}

#[test]
fn merging_seven_of_eight_children_fails() {
    let mesh = row(1);
    let mut levels = RefinementLevelState::for_mesh(&mesh);
    let fine = refine(&mesh, &mut levels, &[0]);
    let group = levels.sibling_group(CellId::new(0)).unwrap();
    let saved = (fine.clone(), levels.clone());
    for omit in 0..8 {
        let partial: Vec<CellId> = group
            .iter()
            .enumerate()
            .filter(|(k, _)| *k != omit)
            .map(|(_, &c)| c)
            .collect();
        assert!(matches!(
            merge(&partial, &fine, &levels),
            Err(MeshError::Invariant(_))
        ));
    }
    assert_eq!((fine, levels), saved);
}
