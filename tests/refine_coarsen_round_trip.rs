mod util;
use util::*;

use hexref::algs::meshgen::block_mesh;
use hexref::topology::coarsen::{merge, merge_by_level};
use hexref::topology::ids::CellId;
use hexref::topology::mesh::PolyMesh;
use hexref::topology::refine::levels::RefinementLevelState;
use hexref::topology::refine::split_cells;
use hexref::topology::validation::{check_closed_cells, check_topology};

fn merge_all(mesh: &PolyMesh, levels: &mut RefinementLevelState) -> PolyMesh {
    let groups = levels.mergeable_groups();
    merge_by_level(mesh, levels, &groups).unwrap().0
}

#[test]
fn split_then_merge_restores_each_cell() {
    let mesh = block_mesh([2, 2, 1], [2.0, 2.0, 1.0]).unwrap();
    for c in 0..mesh.n_cells() {
        let mut levels = RefinementLevelState::for_mesh(&mesh);
        let fine = refine(&mesh, &mut levels, &[c]);
        assert_eq!(fine.n_cells(), mesh.n_cells() + 7);
        assert_eq!(levels.cell_level(CellId::new(c)), 1);
        check_closed_cells(&fine).unwrap();

        let group = levels.sibling_group(CellId::new(c)).unwrap();
        let (back, _) = merge(&group, &fine, &levels)
            .unwrap()
            .commit(&fine, &mut levels)
            .unwrap();
        assert_eq!(back.n_points(), mesh.n_points());
        assert_eq!(back.n_faces(), mesh.n_faces());
        assert_eq!(back.n_cells(), mesh.n_cells());
        assert_eq!(back.n_internal_faces(), mesh.n_internal_faces());
        assert_eq!(face_signature(&back), face_signature(&mesh));
        assert_eq!(levels.cell_level(CellId::new(c)), 0);
        assert_eq!(levels.records().count(), 0);
        check_topology(&back).unwrap();
    }
}

#[test]
fn two_levels_unwind_in_order() {
    let mesh = row(1);
    let mut levels = RefinementLevelState::for_mesh(&mesh);
    let once = refine(&mesh, &mut levels, &[0]);
    let twice = refine(&once, &mut levels, &[0]);
    assert_eq!(twice.n_cells(), 15);
    assert_eq!(levels.max_cell_level(), 2);
    check_closed_cells(&twice).unwrap();
    assert_balanced(&twice, &levels);

    // the level-1 group is not intact until the level-2 group is gone
    assert_eq!(levels.mergeable_groups().len(), 1);
    let back_once = merge_all(&twice, &mut levels);
    assert_eq!(face_signature(&back_once), face_signature(&once));
    let back = merge_all(&back_once, &mut levels);
    assert_eq!(face_signature(&back), face_signature(&mesh));
}

#[test]
fn volume_is_conserved() {
    let mesh = block_mesh([2, 2, 2], [1.0, 1.0, 1.0]).unwrap();
    let mut levels = RefinementLevelState::for_mesh(&mesh);
    let fine = refine(&mesh, &mut levels, &[0, 3, 5]);
    assert!((total_volume(&fine) - 1.0).abs() < 1e-12);
    let finer = refine(&fine, &mut levels, &[0]);
    assert!((total_volume(&finer) - 1.0).abs() < 1e-12);
    assert_balanced(&finer, &levels);

    let mut current = finer;
    while !levels.mergeable_groups().is_empty() {
        current = merge_all(&current, &mut levels);
        assert!((total_volume(&current) - 1.0).abs() < 1e-12);
        check_closed_cells(&current).unwrap();
    }
    assert_eq!(face_signature(&current), face_signature(&mesh));
}

#[test]
fn refining_next_to_a_refined_cell_reuses_its_points() {
    let mesh = row(2);
    let mut one_by_one = RefinementLevelState::for_mesh(&mesh);
    let first = refine(&mesh, &mut one_by_one, &[0]);
    let hanging = first.n_points();
    let both = refine(&first, &mut one_by_one, &[1]);
    // the shared face contributes its 5 new points only once
    assert_eq!(hanging, 27 + 4);
    assert_eq!(both.n_points(), 45);

    let mut at_once = RefinementLevelState::for_mesh(&mesh);
    let together = refine(&mesh, &mut at_once, &[0, 1]);
    assert_eq!(face_signature(&both), face_signature(&together));
    check_closed_cells(&both).unwrap();
}

#[test]
fn merging_beside_a_refined_cell_keeps_the_shared_points() {
    let mesh = row(2);
    let mut levels = RefinementLevelState::for_mesh(&mesh);
    let both = refine(&mesh, &mut levels, &[0, 1]);
    let group = levels.sibling_group(CellId::new(0)).unwrap();
    let (half, _) = merge(&group, &both, &levels)
        .unwrap()
        .commit(&both, &mut levels)
        .unwrap();

    let mut reference = RefinementLevelState::for_mesh(&mesh);
    let only_second = refine(&mesh, &mut reference, &[1]);
    assert_eq!(face_signature(&half), face_signature(&only_second));
    check_closed_cells(&half).unwrap();
    assert_balanced(&half, &levels);
}

#[test]
fn plans_leave_inputs_alone() {
    let mesh = row(2);
    let levels = RefinementLevelState::for_mesh(&mesh);
    let before = (mesh.clone(), levels.clone());
    let plan = split_cells(&mesh, &levels, &cells(&[1])).unwrap();
    assert!(!plan.is_empty());
    drop(plan);
    assert_eq!((mesh, levels), before);
}
