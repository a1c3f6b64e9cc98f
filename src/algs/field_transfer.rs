//! Field transfer across one topology change.
//!
//! Cell and point fields are mapped from the mesh before a commit to the mesh
//! after it using the [`MeshMap`] the applier returned:
//! - split children receive their parent's value, optionally corrected by the
//!   parent's gradient ([`RefineTransfer`]);
//! - a merged parent receives the volume-weighted mean of its children or the
//!   surviving child's value ([`MergeTransfer`]);
//! - new points receive their master's value or the mean over their
//!   interpolation stencil ([`PointTransfer`]).

use crate::geometry::metrics::{MeshGeometry, norm, sub};
use crate::mesh_error::MeshError;
use crate::topology::apply::MeshMap;
use crate::topology::ids::{CellId, PointId};
use crate::topology::mesh::PolyMesh;
use num_traits::{AsPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Values a field can carry: a vector space over `f64`.
pub trait FieldValue: Copy + Debug + PartialEq {
    fn zero() -> Self;
    fn add(self, other: Self) -> Self;
    fn scale(self, factor: f64) -> Self;
}

macro_rules! float_field_value {
    ($($t:ty),*) => {$(
        impl FieldValue for $t {
            #[inline]
            fn zero() -> Self {
                <$t as Zero>::zero()
            }
            #[inline]
            fn add(self, other: Self) -> Self {
                self + other
            }
            #[inline]
            fn scale(self, factor: f64) -> Self {
                self * AsPrimitive::<$t>::as_(factor)
            }
        }
    )*};
}
float_field_value!(f32, f64);

impl<T: FieldValue> FieldValue for [T; 3] {
    fn zero() -> Self {
        [T::zero(); 3]
    }
    fn add(self, other: Self) -> Self {
        std::array::from_fn(|k| self[k].add(other[k]))
    }
    fn scale(self, factor: f64) -> Self {
        self.map(|v| v.scale(factor))
    }
}

/// One value per cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellField<T> {
    values: Vec<T>,
}

/// One value per point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointField<T> {
    values: Vec<T>,
}

macro_rules! field_common {
    ($name:ident, $id:ty, $count:ident, $what:literal) => {
        impl<T: FieldValue> $name<T> {
            pub fn new(values: Vec<T>) -> Self {
                Self { values }
            }

            pub fn uniform(n: usize, value: T) -> Self {
                Self {
                    values: vec![value; n],
                }
            }

            pub fn len(&self) -> usize {
                self.values.len()
            }

            pub fn is_empty(&self) -> bool {
                self.values.is_empty()
            }

            pub fn values(&self) -> &[T] {
                &self.values
            }

            pub fn values_mut(&mut self) -> &mut [T] {
                &mut self.values
            }

            pub fn into_values(self) -> Vec<T> {
                self.values
            }

            #[inline]
            pub fn get(&self, id: $id) -> Option<T> {
                self.values.get(id.index()).copied()
            }

            /// Error unless there is one value per entity of `mesh`.
            pub fn check_size(&self, mesh: &PolyMesh) -> Result<(), MeshError> {
                if self.values.len() != mesh.$count() {
                    return Err(MeshError::input(format!(
                        concat!("field has {} values for {} ", $what),
                        self.values.len(),
                        mesh.$count()
                    )));
                }
                Ok(())
            }
        }
    };
}
field_common!(CellField, CellId, n_cells, "cells");
field_common!(PointField, PointId, n_points, "points");

/// How children of a split cell are initialised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefineTransfer {
    /// Every child takes the parent value.
    #[default]
    Copy,
    /// `phi + grad(phi) . (x_child - x_parent)` with a Gauss gradient of the
    /// field on the mesh before the split.
    GradientCorrected,
}

/// How a merged parent is initialised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeTransfer {
    /// Volume-weighted mean of the children.
    #[default]
    Average,
    /// The value of the child that survives as the parent.
    Inject,
}

/// How added points are initialised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointTransfer {
    /// Mean over the points the new point was interpolated from.
    #[default]
    StencilMean,
    /// The value of the master point.
    Master,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    pub refine: RefineTransfer,
    pub merge: MergeTransfer,
    pub points: PointTransfer,
}

/// The two sides of one commit.
#[derive(Clone, Copy, Debug)]
pub struct MeshTransition<'a> {
    pub old: &'a PolyMesh,
    pub old_geometry: &'a MeshGeometry,
    pub new: &'a PolyMesh,
    pub new_geometry: &'a MeshGeometry,
    pub map: &'a MeshMap,
}

impl MeshTransition<'_> {
    fn check(&self) -> Result<(), MeshError> {
        if self.map.n_old_cells != self.old.n_cells()
            || self.map.n_cells() != self.new.n_cells()
            || self.map.n_old_points != self.old.n_points()
            || self.map.n_points() != self.new.n_points()
        {
            return Err(MeshError::input(
                "mesh map does not connect the two meshes given",
            ));
        }
        if self.old_geometry.cell_volumes.len() != self.old.n_cells()
            || self.new_geometry.cell_volumes.len() != self.new.n_cells()
        {
            return Err(MeshError::input("geometry does not match its mesh"));
        }
        Ok(())
    }
}

/// Gauss gradient with linearly interpolated face values; boundary faces take
/// the owner value.
pub fn gauss_gradient<T: FieldValue>(
    mesh: &PolyMesh,
    geometry: &MeshGeometry,
    field: &CellField<T>,
) -> Result<Vec<[T; 3]>, MeshError> {
    field.check_size(mesh)?;
    let mut grad = vec![[T::zero(); 3]; mesh.n_cells()];
    let cc = &geometry.cell_centres;
    for (f, face) in mesh.faces().iter().enumerate() {
        let s = geometry.face_areas[f];
        let o = face.owner.index();
        let phi_f = match face.neighbour {
            Some(n) => {
                let n = n.index();
                let fc = geometry.face_centres[f];
                let d_o = norm(sub(fc, cc[o]));
                let d_n = norm(sub(cc[n], fc));
                let w = if d_o + d_n > 0.0 { d_n / (d_o + d_n) } else { 0.5 };
                let value = field.values[o].scale(w).add(field.values[n].scale(1.0 - w));
                for k in 0..3 {
                    grad[n][k] = grad[n][k].add(value.scale(-s[k]));
                }
                value
            }
            None => field.values[o],
        };
        for k in 0..3 {
            grad[o][k] = grad[o][k].add(phi_f.scale(s[k]));
        }
    }
    for (c, g) in grad.iter_mut().enumerate() {
        let inv = 1.0 / geometry.cell_volumes[c];
        *g = g.map(|v| v.scale(inv));
    }
    Ok(grad)
}

/// Map a cell field over one commit.
pub fn remap_cell_field<T: FieldValue>(
    field: &CellField<T>,
    step: &MeshTransition<'_>,
    options: &TransferOptions,
) -> Result<CellField<T>, MeshError> {
    step.check()?;
    field.check_size(step.old)?;
    let map = step.map;

    let mut n_from = vec![0usize; step.old.n_cells()];
    for origin in map.cell_map.iter().flatten() {
        n_from[origin.index()] += 1;
    }
    let gradient = match options.refine {
        RefineTransfer::GradientCorrected if n_from.iter().any(|&n| n > 1) => {
            Some(gauss_gradient(step.old, step.old_geometry, field)?)
        }
        _ => None,
    };

    let mut values = Vec::with_capacity(map.n_cells());
    for (c, origin) in map.cell_map.iter().enumerate() {
        let sources = &map.cells_from_cells[c];
        let value = match (origin, sources.as_slice()) {
            (_, [first, _, ..]) => match options.merge {
                MergeTransfer::Inject => field.values[first.index()],
                MergeTransfer::Average => {
                    let volumes = &step.old_geometry.cell_volumes;
                    let total: f64 = sources.iter().map(|s| volumes[s.index()]).sum();
                    sources.iter().fold(T::zero(), |acc, s| {
                        acc.add(field.values[s.index()].scale(volumes[s.index()] / total))
                    })
                }
            },
            (Some(o), _) => {
                let phi = field.values[o.index()];
                match &gradient {
                    Some(grad) if n_from[o.index()] > 1 => {
                        let d = sub(
                            step.new_geometry.cell_centres[c],
                            step.old_geometry.cell_centres[o.index()],
                        );
                        let g = grad[o.index()];
                        (0..3).fold(phi, |acc, k| acc.add(g[k].scale(d[k])))
                    }
                    _ => phi,
                }
            }
            (None, _) => {
                return Err(MeshError::invariant(format!(
                    "cell c{c} was added without a master cell"
                )));
            }
        };
        values.push(value);
    }
    Ok(CellField { values })
}

/// Map a point field over one commit.
pub fn remap_point_field<T: FieldValue>(
    field: &PointField<T>,
    map: &MeshMap,
    options: &TransferOptions,
) -> Result<PointField<T>, MeshError> {
    if field.len() != map.n_old_points {
        return Err(MeshError::input(format!(
            "point field has {} values, mesh map starts from {} points",
            field.len(),
            map.n_old_points
        )));
    }
    let mut values = Vec::with_capacity(map.n_points());
    for (p, (master, stencil)) in map.point_map.iter().zip(&map.points_from_points).enumerate() {
        let value = match (options.points, master, stencil.is_empty()) {
            (PointTransfer::Master, Some(m), _) | (PointTransfer::StencilMean, Some(m), true) => {
                field.values[m.index()]
            }
            (_, _, false) => {
                let w = 1.0 / stencil.len() as f64;
                stencil
                    .iter()
                    .fold(T::zero(), |acc, s| acc.add(field.values[s.index()].scale(w)))
            }
            (_, None, true) => {
                return Err(MeshError::invariant(format!(
                    "point p{p} has neither master nor stencil"
                )));
            }
        };
        values.push(value);
    }
    Ok(PointField { values })
}

/// Named fields carried through refinement cycles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRegistry {
    scalars: BTreeMap<String, CellField<f64>>,
    vectors: BTreeMap<String, CellField<[f64; 3]>>,
    point_scalars: BTreeMap<String, PointField<f64>>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, field: CellField<f64>) {
        self.scalars.insert(name.into(), field);
    }

    pub fn insert_vector(&mut self, name: impl Into<String>, field: CellField<[f64; 3]>) {
        self.vectors.insert(name.into(), field);
    }

    pub fn insert_point_scalar(&mut self, name: impl Into<String>, field: PointField<f64>) {
        self.point_scalars.insert(name.into(), field);
    }

    pub fn scalar(&self, name: &str) -> Option<&CellField<f64>> {
        self.scalars.get(name)
    }

    pub fn vector(&self, name: &str) -> Option<&CellField<[f64; 3]>> {
        self.vectors.get(name)
    }

    pub fn point_scalar(&self, name: &str) -> Option<&PointField<f64>> {
        self.point_scalars.get(name)
    }

    pub fn len(&self) -> usize {
        self.scalars.len() + self.vectors.len() + self.point_scalars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Error unless every field matches `mesh`.
    pub fn check_sizes(&self, mesh: &PolyMesh) -> Result<(), MeshError> {
        for (name, f) in &self.scalars {
            f.check_size(mesh).map_err(|e| named(name, e))?;
        }
        for (name, f) in &self.vectors {
            f.check_size(mesh).map_err(|e| named(name, e))?;
        }
        for (name, f) in &self.point_scalars {
            f.check_size(mesh).map_err(|e| named(name, e))?;
        }
        Ok(())
    }

    /// Every field mapped over `step`. `self` is left as it was.
    pub fn remap(
        &self,
        step: &MeshTransition<'_>,
        options: &TransferOptions,
    ) -> Result<FieldRegistry, MeshError> {
        let mut out = FieldRegistry::new();
        for (name, f) in &self.scalars {
            let mapped = remap_cell_field(f, step, options).map_err(|e| named(name, e))?;
            out.scalars.insert(name.clone(), mapped);
        }
        for (name, f) in &self.vectors {
            let mapped = remap_cell_field(f, step, options).map_err(|e| named(name, e))?;
            out.vectors.insert(name.clone(), mapped);
        }
        for (name, f) in &self.point_scalars {
            let mapped = remap_point_field(f, step.map, options).map_err(|e| named(name, e))?;
            out.point_scalars.insert(name.clone(), mapped);
        }
        Ok(out)
    }
}

fn named(name: &str, err: MeshError) -> MeshError {
    match err {
        MeshError::InvalidInput(msg) => MeshError::InvalidInput(format!("field '{name}': {msg}")),
        other => other,
    }
}
