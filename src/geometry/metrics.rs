//! Face and cell geometry of a polyhedral mesh.
//!
//! Faces are decomposed into triangles around their point average, cells into
//! pyramids around the average of their face centres. Both decompositions are
//! exact for planar faces and for hexahedra whose faces carry hanging points.

use crate::mesh_error::MeshError;
use crate::topology::ids::{CellId, FaceId, PointId};
use crate::topology::mesh::PolyMesh;

const EPS: f64 = 1e-300;

#[inline]
pub fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

#[inline]
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
pub fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

/// Arithmetic mean of `points`, summed in the given order.
pub fn mean(points: impl IntoIterator<Item = [f64; 3]>) -> [f64; 3] {
    let mut sum = [0.0; 3];
    let mut n = 0usize;
    for p in points {
        sum = add(sum, p);
        n += 1;
    }
    if n == 0 { sum } else { scale(sum, 1.0 / n as f64) }
}

/// Area vector (normal × area, right-hand rule) and centroid of a face loop.
pub fn face_area_centre(points: &[[f64; 3]], face: &[PointId]) -> ([f64; 3], [f64; 3]) {
    let xs: Vec<[f64; 3]> = face.iter().map(|p| points[p.index()]).collect();
    if xs.len() == 3 {
        let area = scale(cross(sub(xs[1], xs[0]), sub(xs[2], xs[0])), 0.5);
        return (area, mean(xs.iter().copied()));
    }
    let xa = mean(xs.iter().copied());
    let n = xs.len();
    let mut area = [0.0; 3];
    let mut tris = Vec::with_capacity(n);
    for i in 0..n {
        let (a, b) = (xs[i], xs[(i + 1) % n]);
        let tri = scale(cross(sub(a, xa), sub(b, xa)), 0.5);
        area = add(area, tri);
        tris.push((tri, scale(add(add(a, b), xa), 1.0 / 3.0)));
    }
    let mag = norm(area);
    if mag < EPS {
        return (area, xa);
    }
    let unit = scale(area, 1.0 / mag);
    let mut weight = 0.0;
    let mut centre = [0.0; 3];
    for (tri, c) in tris {
        let w = dot(tri, unit);
        weight += w;
        centre = add(centre, scale(c, w));
    }
    if weight.abs() < EPS {
        (area, xa)
    } else {
        (area, scale(centre, 1.0 / weight))
    }
}

/// Precomputed face and cell geometry of one committed mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshGeometry {
    pub face_areas: Vec<[f64; 3]>,
    pub face_centres: Vec<[f64; 3]>,
    pub cell_volumes: Vec<f64>,
    pub cell_centres: Vec<[f64; 3]>,
}

impl MeshGeometry {
    /// Compute face and cell geometry.
    ///
    /// # Errors
    /// [`MeshError::InvalidInput`] when a cell has a non-positive volume.
    pub fn new(mesh: &PolyMesh) -> Result<Self, MeshError> {
        let points = mesh.points();
        let (face_areas, face_centres): (Vec<_>, Vec<_>) = mesh
            .faces()
            .iter()
            .map(|f| face_area_centre(points, &f.points))
            .unzip();

        let cell_faces = mesh.cell_faces();
        let cell = |c: usize| cell_volume_centre(mesh, CellId::new(c), &cell_faces[c], &face_areas, &face_centres);

        #[cfg(feature = "rayon")]
        let per_cell: Vec<(f64, [f64; 3])> = {
            use rayon::prelude::*;
            (0..mesh.n_cells()).into_par_iter().map(cell).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let per_cell: Vec<(f64, [f64; 3])> = (0..mesh.n_cells()).map(cell).collect();

        if let Some(c) = per_cell.iter().position(|(v, _)| !(*v > 0.0)) {
            return Err(MeshError::InvalidInput(format!(
                "cell c{c} has non-positive volume {}",
                per_cell[c].0
            )));
        }
        let (cell_volumes, cell_centres) = per_cell.into_iter().unzip();
        Ok(Self {
            face_areas,
            face_centres,
            cell_volumes,
            cell_centres,
        })
    }

    /// Sum of all cell volumes.
    pub fn total_volume(&self) -> f64 {
        self.cell_volumes.iter().sum()
    }
}

fn cell_volume_centre(
    mesh: &PolyMesh,
    cell: CellId,
    faces: &[FaceId],
    face_areas: &[[f64; 3]],
    face_centres: &[[f64; 3]],
) -> (f64, [f64; 3]) {
    let estimate = mean(faces.iter().map(|f| face_centres[f.index()]));
    let mut volume = 0.0;
    let mut centre = [0.0; 3];
    for &f in faces {
        let outward = if mesh.face(f).owner == cell {
            face_areas[f.index()]
        } else {
            scale(face_areas[f.index()], -1.0)
        };
        let xf = face_centres[f.index()];
        let pyramid = dot(outward, sub(xf, estimate)) / 3.0;
        volume += pyramid;
        centre = add(centre, scale(add(scale(xf, 0.75), scale(estimate, 0.25)), pyramid));
    }
    if volume.abs() < EPS {
        (volume, estimate)
    } else {
        (volume, scale(centre, 1.0 / volume))
    }
}
