#![allow(dead_code)]
use hexref::algs::communicator::ThreadComm;
use hexref::algs::meshgen::block_mesh;
use hexref::geometry::MeshGeometry;
use hexref::topology::ids::CellId;
use hexref::topology::mesh::PolyMesh;
use hexref::topology::refine::levels::RefinementLevelState;
use hexref::topology::refine::split_cells;
use itertools::Itertools;

pub fn cells(ids: &[usize]) -> Vec<CellId> {
    ids.iter().copied().map(CellId::new).collect()
}

/// `n` unit cubes along x.
pub fn row(n: usize) -> PolyMesh {
    block_mesh([n, 1, 1], [n as f64, 1.0, 1.0]).unwrap()
}

/// Split `targets` and commit, updating `levels`.
pub fn refine(mesh: &PolyMesh, levels: &mut RefinementLevelState, targets: &[usize]) -> PolyMesh {
    let plan = split_cells(mesh, levels, &cells(targets)).unwrap();
    plan.commit(mesh, levels).unwrap().0
}

/// Faces as sorted global point ids, sorted; equal for topologically equal
/// meshes regardless of numbering or loop start.
pub fn face_signature(mesh: &PolyMesh) -> Vec<Vec<u64>> {
    mesh.faces()
        .iter()
        .map(|f| f.points.iter().map(|&p| mesh.point_global(p)).sorted().collect())
        .sorted()
        .collect()
}

pub fn total_volume(mesh: &PolyMesh) -> f64 {
    MeshGeometry::new(mesh).unwrap().total_volume()
}

/// Panic unless every internal face joins cells at most one level apart.
pub fn assert_balanced(mesh: &PolyMesh, levels: &RefinementLevelState) {
    for (f, face) in mesh.faces().iter().enumerate() {
        if let Some(n) = face.neighbour {
            let (a, b) = (levels.cell_level(face.owner), levels.cell_level(n));
            assert!(a.abs_diff(b) <= 1, "face f{f}: levels {a} and {b}");
        }
    }
}

/// Run `body` once per mesh, each on its own thread and rank.
pub fn on_ranks<T, F>(meshes: Vec<PolyMesh>, body: F) -> Vec<T>
where
    T: Send,
    F: Fn(PolyMesh, ThreadComm) -> T + Sync,
{
    let comms = ThreadComm::world(meshes.len());
    let body = &body;
    std::thread::scope(|s| {
        let handles: Vec<_> = meshes
            .into_iter()
            .zip(comms)
            .map(|(mesh, comm)| s.spawn(move || body(mesh, comm)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}
