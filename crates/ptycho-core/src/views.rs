//! Extraction and insertion of probe-sized views of the object.
//!
//! A view is the window of the object frame illuminated at one scan
//! position. Gathering copies views out of a shared object into a
//! (height, width, n) stack; scattering adds a stack back into the object
//! frame, summing wherever views overlap.

use ndarray::{s, Array2, Array3, Axis};
use num_complex::Complex64;

use crate::solver::SolverError;

/// Mapping between a shared object array and its per-position views.
pub trait ViewOperator: Send + Sync {
    /// Copy the views at `positions` out of `object`.
    fn gather(&self, object: &Array2<Complex64>, positions: &[usize]) -> Array3<Complex64>;

    /// Add `patches` into `update` and `weights` into `illumination` at the
    /// views for `positions`.
    fn scatter_add(
        &self,
        update: &mut Array2<Complex64>,
        illumination: &mut Array2<f64>,
        patches: &Array3<Complex64>,
        weights: &Array3<f64>,
        positions: &[usize],
    );

    /// Total number of scan positions.
    fn n_positions(&self) -> usize;
}

/// Scan positions given as integer top-left offsets into the object frame.
#[derive(Debug, Clone)]
pub struct ScanGrid {
    offsets: Vec<[usize; 2]>,
    window: (usize, usize),
}

impl ScanGrid {
    /// Build a scan grid, checking that every view fits inside the object.
    pub fn new(
        offsets: Vec<[usize; 2]>,
        window: (usize, usize),
        object_shape: (usize, usize),
    ) -> Result<Self, SolverError> {
        if offsets.is_empty() {
            return Err(SolverError::InvalidGeometry("Scan has no positions".into()));
        }
        for (i, &[row, col]) in offsets.iter().enumerate() {
            if row + window.0 > object_shape.0 || col + window.1 > object_shape.1 {
                return Err(SolverError::InvalidGeometry(format!(
                    "View {} at ({}, {}) with window {}x{} leaves the {}x{} object frame",
                    i, row, col, window.0, window.1, object_shape.0, object_shape.1
                )));
            }
        }
        Ok(Self { offsets, window })
    }

    /// Rectangular raster of `rows` × `cols` positions spaced `step` pixels
    /// apart, starting at `origin`.
    pub fn raster(
        rows: usize,
        cols: usize,
        step: usize,
        origin: [usize; 2],
        window: (usize, usize),
        object_shape: (usize, usize),
    ) -> Result<Self, SolverError> {
        let offsets = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| [origin[0] + r * step, origin[1] + c * step]))
            .collect();
        Self::new(offsets, window, object_shape)
    }

    pub fn offsets(&self) -> &[[usize; 2]] {
        &self.offsets
    }

    pub fn window(&self) -> (usize, usize) {
        self.window
    }
}

impl ViewOperator for ScanGrid {
    fn gather(&self, object: &Array2<Complex64>, positions: &[usize]) -> Array3<Complex64> {
        let (ny, nx) = self.window;
        let mut views = Array3::zeros((ny, nx, positions.len()));
        for (mut view, &p) in views.axis_iter_mut(Axis(2)).zip(positions) {
            let [row, col] = self.offsets[p];
            view.assign(&object.slice(s![row..row + ny, col..col + nx]));
        }
        views
    }

    fn scatter_add(
        &self,
        update: &mut Array2<Complex64>,
        illumination: &mut Array2<f64>,
        patches: &Array3<Complex64>,
        weights: &Array3<f64>,
        positions: &[usize],
    ) {
        let (ny, nx) = self.window;
        for (k, &p) in positions.iter().enumerate() {
            let [row, col] = self.offsets[p];
            let mut target = update.slice_mut(s![row..row + ny, col..col + nx]);
            target += &patches.index_axis(Axis(2), k);
            let mut target = illumination.slice_mut(s![row..row + ny, col..col + nx]);
            target += &weights.index_axis(Axis(2), k);
        }
    }

    fn n_positions(&self) -> usize {
        self.offsets.len()
    }
}
