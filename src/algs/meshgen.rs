//! Structured hexahedral box meshes, serial or decomposed over ranks.
//!
//! These are seed builders for tests, benchmarks and demos: every cell is an
//! axis-aligned hexahedron at refinement level 0, all boundary faces go to a
//! single `walls` patch and, for decomposed meshes, the faces shared with a
//! neighbouring rank go to processor patches.

use crate::mesh_error::MeshError;
use crate::topology::ids::{CellId, GlobalPointId, PatchId, PointId};
use crate::topology::mesh::{Face, Patch, PolyMesh, reverse_loop};

/// Name of the physical boundary patch of generated meshes.
pub const WALL_PATCH: &str = "walls";

fn invalid_geometry(message: impl Into<String>) -> MeshError {
    MeshError::InvalidInput(message.into())
}

fn check_box(cells: [usize; 3], min: [f64; 3], max: [f64; 3]) -> Result<(), MeshError> {
    if cells.contains(&0) {
        return Err(invalid_geometry("nx, ny, and nz must be positive"));
    }
    if (0..3).any(|d| !(max[d] > min[d])) {
        return Err(invalid_geometry(format!(
            "box max {max:?} must exceed min {min:?} in every direction"
        )));
    }
    Ok(())
}

/// Block `[lo, hi)` of a global `nx × ny × nz` lattice.
struct Block {
    global: [usize; 3],
    lo: [usize; 3],
    hi: [usize; 3],
    min: [f64; 3],
    h: [f64; 3],
    rank: usize,
    /// Rank across the low and the high side of each axis.
    low: [Option<usize>; 3],
    high: [Option<usize>; 3],
}

impl Block {
    fn local(&self) -> [usize; 3] {
        std::array::from_fn(|d| self.hi[d] - self.lo[d])
    }

    fn n_cells(&self) -> usize {
        self.local().iter().product()
    }

    fn cell(&self, [i, j, k]: [usize; 3]) -> CellId {
        let n = self.local();
        CellId::new(i + n[0] * (j + n[1] * k))
    }

    fn point(&self, [i, j, k]: [usize; 3]) -> PointId {
        let n = self.local();
        PointId::new(i + (n[0] + 1) * (j + (n[1] + 1) * k))
    }

    fn global_point(&self, at: [usize; 3]) -> GlobalPointId {
        let n = self.global;
        let [i, j, k]: [usize; 3] = std::array::from_fn(|d| self.lo[d] + at[d]);
        (i + (n[0] + 1) * (j + (n[1] + 1) * k)) as GlobalPointId
    }

    /// Quad on the lattice plane normal to `d` at corner `at`, oriented with
    /// its normal along `+d`.
    fn plus_loop(&self, d: usize, at: [usize; 3]) -> Vec<PointId> {
        let (a, b) = ((d + 1) % 3, (d + 2) % 3);
        let step = |mut p: [usize; 3], axes: &[usize]| {
            for &axis in axes {
                p[axis] += 1;
            }
            p
        };
        vec![
            self.point(at),
            self.point(step(at, &[a])),
            self.point(step(at, &[a, b])),
            self.point(step(at, &[b])),
        ]
    }

    fn points(&self) -> (Vec<[f64; 3]>, Vec<GlobalPointId>) {
        let n = self.local();
        let mut coords = Vec::with_capacity((n[0] + 1) * (n[1] + 1) * (n[2] + 1));
        let mut globals = Vec::with_capacity(coords.capacity());
        for k in 0..=n[2] {
            for j in 0..=n[1] {
                for i in 0..=n[0] {
                    let at = [i, j, k];
                    coords.push(std::array::from_fn(|d| {
                        self.min[d] + self.h[d] * (self.lo[d] + at[d]) as f64
                    }));
                    globals.push(self.global_point(at));
                }
            }
        }
        (coords, globals)
    }

    fn cells_in_order(&self) -> impl Iterator<Item = [usize; 3]> + use<> {
        let n = self.local();
        (0..n[2]).flat_map(move |k| (0..n[1]).flat_map(move |j| (0..n[0]).map(move |i| [i, j, k])))
    }

    fn faces(&self) -> (Vec<Face>, Vec<Patch>) {
        let n = self.local();
        let mut faces = Vec::new();

        // Cells are numbered x-fastest, so the +x, +y, +z neighbours of a cell
        // come in ascending index order.
        for at in self.cells_in_order() {
            let owner = self.cell(at);
            for d in 0..3 {
                if at[d] + 1 < n[d] {
                    let mut next = at;
                    next[d] += 1;
                    faces.push(Face::internal(self.plus_loop(d, next), owner, self.cell(next)));
                }
            }
        }

        let walls = PatchId::new(0);
        for at in self.cells_in_order() {
            let owner = self.cell(at);
            for d in 0..3 {
                if at[d] == 0 && self.low[d].is_none() {
                    faces.push(Face::boundary(reverse_loop(&self.plus_loop(d, at)), owner, walls));
                }
                if at[d] + 1 == n[d] && self.high[d].is_none() {
                    let mut next = at;
                    next[d] += 1;
                    faces.push(Face::boundary(self.plus_loop(d, next), owner, walls));
                }
            }
        }

        // Both sides of a plane walk its cells in the same order; the high
        // side stores the loop reversed, starting at the same corner.
        let mut patches = vec![Patch::wall(WALL_PATCH)];
        let rank = self.rank;
        for d in 0..3 {
            if let Some(nbr) = self.low[d] {
                let patch = PatchId::new(patches.len());
                patches.push(Patch::processor(format!("procBoundary{rank}to{nbr}"), nbr));
                for at in self.cells_in_order().filter(|at| at[d] == 0) {
                    faces.push(Face::boundary(
                        reverse_loop(&self.plus_loop(d, at)),
                        self.cell(at),
                        patch,
                    ));
                }
            }
            if let Some(nbr) = self.high[d] {
                let patch = PatchId::new(patches.len());
                patches.push(Patch::processor(format!("procBoundary{rank}to{nbr}"), nbr));
                for at in self.cells_in_order().filter(|at| at[d] + 1 == n[d]) {
                    let mut next = at;
                    next[d] += 1;
                    faces.push(Face::boundary(self.plus_loop(d, next), self.cell(at), patch));
                }
            }
        }
        (faces, patches)
    }

    fn build(&self) -> Result<PolyMesh, MeshError> {
        let (points, globals) = self.points();
        let (faces, patches) = self.faces();
        PolyMesh::with_global_ids(points, globals, faces, patches, self.n_cells())
    }
}

/// Generate a structured hex box over `[min, max]` with `nx × ny × nz` cells.
///
/// Cells are numbered x-fastest; point global ids equal the lattice index.
pub fn structured_box(
    cells: [usize; 3],
    min: [f64; 3],
    max: [f64; 3],
) -> Result<PolyMesh, MeshError> {
    check_box(cells, min, max)?;
    Block {
        global: cells,
        lo: [0; 3],
        hi: cells,
        min,
        h: std::array::from_fn(|d| (max[d] - min[d]) / cells[d] as f64),
        rank: 0,
        low: [None; 3],
        high: [None; 3],
    }
    .build()
}

/// Structured hex box with one corner at the origin.
pub fn block_mesh(cells: [usize; 3], size: [f64; 3]) -> Result<PolyMesh, MeshError> {
    structured_box(cells, [0.0; 3], size)
}

/// Split a structured box into `n_ranks` slabs along x, one mesh per rank.
///
/// Neighbouring slabs share a processor patch. Both sides list its faces in
/// the same `(k, j)` order; the right-hand rank stores each loop reversed with
/// the same first point. Global point ids are those of the undecomposed box,
/// so `decomposed_box(.., 1)` and [`structured_box`] agree.
pub fn decomposed_box(
    cells: [usize; 3],
    min: [f64; 3],
    max: [f64; 3],
    n_ranks: usize,
) -> Result<Vec<PolyMesh>, MeshError> {
    decomposed_grid(cells, min, max, [n_ranks, 1])
}

/// Split a structured box into a `px × py` grid of ranks, x fastest.
///
/// Ranks that share a face get a processor patch per neighbour, laid out as
/// in [`decomposed_box`]. Diagonal ranks share only an edge of points and no
/// patch.
pub fn decomposed_grid(
    cells: [usize; 3],
    min: [f64; 3],
    max: [f64; 3],
    ranks: [usize; 2],
) -> Result<Vec<PolyMesh>, MeshError> {
    check_box(cells, min, max)?;
    for d in 0..2 {
        if ranks[d] == 0 || ranks[d] > cells[d] {
            return Err(invalid_geometry(format!(
                "cannot split {} cell layers over {} ranks",
                cells[d], ranks[d]
            )));
        }
    }
    let h = std::array::from_fn(|d| (max[d] - min[d]) / cells[d] as f64);
    let rank_of = |x: usize, y: usize| x + ranks[0] * y;
    let mut meshes = Vec::with_capacity(ranks[0] * ranks[1]);
    for y in 0..ranks[1] {
        for x in 0..ranks[0] {
            let block = Block {
                global: cells,
                lo: [x * cells[0] / ranks[0], y * cells[1] / ranks[1], 0],
                hi: [(x + 1) * cells[0] / ranks[0], (y + 1) * cells[1] / ranks[1], cells[2]],
                min,
                h,
                rank: rank_of(x, y),
                low: [
                    x.checked_sub(1).map(|x| rank_of(x, y)),
                    y.checked_sub(1).map(|y| rank_of(x, y)),
                    None,
                ],
                high: [
                    (x + 1 < ranks[0]).then(|| rank_of(x + 1, y)),
                    (y + 1 < ranks[1]).then(|| rank_of(x, y + 1)),
                    None,
                ],
            };
            meshes.push(block.build()?);
        }
    }
    Ok(meshes)
}
