//! Measured diffraction data, Fourier error metrics and the error history.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::solver::SolverError;

/// Access to measured Fourier modulus and detector validity mask.
pub trait DiffractionData: Send + Sync {
    /// Measured modulus (square root of intensity) at `positions`, shaped
    /// (height, width, positions.len()).
    fn modulus(&self, positions: &[usize]) -> Array3<f64>;

    /// Validity mask at `positions` (1 = measured pixel, 0 = invalid), or
    /// `None` when every pixel is valid.
    fn mask(&self, positions: &[usize]) -> Option<Array3<f64>>;

    /// Total number of scan positions.
    fn n_positions(&self) -> usize;
}

/// In-memory diffraction data with one detector mask shared by every frame.
#[derive(Debug, Clone)]
pub struct MeasuredDiffraction {
    modulus: Array3<f64>,
    mask: Option<Array2<f64>>,
}

impl MeasuredDiffraction {
    pub fn new(modulus: Array3<f64>, mask: Option<Array2<f64>>) -> Result<Self, SolverError> {
        if let Some(m) = &mask {
            let (ny, nx, _) = modulus.dim();
            if m.dim() != (ny, nx) {
                return Err(SolverError::ShapeMismatch {
                    expected: vec![ny, nx],
                    found: m.shape().to_vec(),
                });
            }
        }
        Ok(Self { modulus, mask })
    }

    /// Build from measured intensities; negative counts are clamped to zero.
    pub fn from_intensity(
        intensity: &Array3<f64>,
        mask: Option<Array2<f64>>,
    ) -> Result<Self, SolverError> {
        Self::new(intensity.mapv(|i| i.max(0.0).sqrt()), mask)
    }

    pub fn detector_shape(&self) -> (usize, usize) {
        let (ny, nx, _) = self.modulus.dim();
        (ny, nx)
    }
}

impl DiffractionData for MeasuredDiffraction {
    fn modulus(&self, positions: &[usize]) -> Array3<f64> {
        self.modulus.select(Axis(2), positions)
    }

    fn mask(&self, positions: &[usize]) -> Option<Array3<f64>> {
        let mask = self.mask.as_ref()?;
        let (ny, nx) = mask.dim();
        let mut stack = Array3::zeros((ny, nx, positions.len()));
        for mut frame in stack.axis_iter_mut(Axis(2)) {
            frame.assign(mask);
        }
        Some(stack)
    }

    fn n_positions(&self) -> usize {
        self.modulus.dim().2
    }
}

/// Rectangular detector region over which the Fourier error is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorRegion {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

/// Per-position residual between predicted and measured modulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FourierErrorMetric {
    /// Mean absolute amplitude residual.
    #[default]
    L1,
    /// Mean squared amplitude residual.
    L2,
}

impl FourierErrorMetric {
    /// Evaluate the metric for every frame of a block, over valid pixels
    /// inside `region` (the whole detector when `None`).
    pub fn per_position(
        &self,
        modulus: &Array3<f64>,
        predicted: &Array3<f64>,
        mask: Option<&Array3<f64>>,
        region: Option<&DetectorRegion>,
    ) -> Array1<f64> {
        let (ny, nx, n) = modulus.dim();
        let (rows, cols) = match region {
            Some(r) => (r.row_start..r.row_end.min(ny), r.col_start..r.col_end.min(nx)),
            None => (0..ny, 0..nx),
        };
        let modulus = modulus.slice(s![rows.clone(), cols.clone(), ..]);
        let predicted = predicted.slice(s![rows.clone(), cols.clone(), ..]);
        let mask = mask.map(|m| m.slice(s![rows, cols, ..]));

        Array1::from_shape_fn(n, |p| {
            let measured = modulus.index_axis(Axis(2), p);
            let model = predicted.index_axis(Axis(2), p);
            let mut total = 0.0;
            let mut count = 0.0;
            let mut add = |m: f64, a: f64, w: f64| {
                let residual = (a - m).abs();
                total += w * match self {
                    FourierErrorMetric::L1 => residual,
                    FourierErrorMetric::L2 => residual * residual,
                };
                count += w;
            };
            match &mask {
                Some(mask) => Zip::from(measured)
                    .and(model)
                    .and(mask.index_axis(Axis(2), p))
                    .for_each(|&m, &a, &w| add(m, a, w)),
                None => Zip::from(measured)
                    .and(model)
                    .for_each(|&m, &a| add(m, a, 1.0)),
            }
            if count > 0.0 {
                total / count
            } else {
                0.0
            }
        })
    }
}

/// Fourier error history: one row per outer iteration, one column per scan
/// position. Entries that were never evaluated hold NaN.
#[derive(Debug, Clone)]
pub struct FourierErrorLog {
    values: Array2<f64>,
}

impl FourierErrorLog {
    pub fn new(number_iterations: usize, n_positions: usize) -> Self {
        Self {
            values: Array2::from_elem((number_iterations, n_positions), f64::NAN),
        }
    }

    /// Write the errors of `positions` for `iteration`.
    pub fn record(
        &mut self,
        iteration: usize,
        positions: &[usize],
        errors: &Array1<f64>,
    ) -> Result<(), SolverError> {
        let capacity = self.values.nrows();
        if iteration >= capacity {
            return Err(SolverError::IterationOutOfRange { iteration, capacity });
        }
        let mut row = self.values.row_mut(iteration);
        for (&p, &e) in positions.iter().zip(errors.iter()) {
            row[p] = e;
        }
        Ok(())
    }

    /// Errors recorded for `iteration`.
    pub fn iteration(&self, iteration: usize) -> ArrayView1<'_, f64> {
        self.values.row(iteration)
    }

    /// Mean error over the positions evaluated at `iteration`.
    pub fn mean(&self, iteration: usize) -> Option<f64> {
        if iteration >= self.values.nrows() {
            return None;
        }
        let (sum, count) = self
            .values
            .row(iteration)
            .iter()
            .filter(|e| e.is_finite())
            .fold((0.0, 0usize), |(s, c), &e| (s + e, c + 1));
        (count > 0).then(|| sum / count as f64)
    }

    pub fn number_iterations(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_l1_error_ignores_invalid_pixels() {
        let modulus = Array3::from_elem((2, 2, 1), 1.0);
        let mut predicted = Array3::from_elem((2, 2, 1), 2.0);
        predicted[[0, 0, 0]] = 100.0;
        let mut mask = Array3::from_elem((2, 2, 1), 1.0);
        mask[[0, 0, 0]] = 0.0;
        let errors = FourierErrorMetric::L1.per_position(&modulus, &predicted, Some(&mask), None);
        assert_abs_diff_eq!(errors[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_l2_error_in_region() {
        let modulus = Array3::zeros((4, 4, 2));
        let predicted = Array3::from_shape_fn((4, 4, 2), |(y, _, p)| (y + p) as f64);
        let region = DetectorRegion { row_start: 1, row_end: 2, col_start: 0, col_end: 4 };
        let errors = FourierErrorMetric::L2.per_position(&modulus, &predicted, None, Some(&region));
        assert_abs_diff_eq!(errors[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(errors[1], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_error_log_records_and_averages() {
        let mut log = FourierErrorLog::new(3, 4);
        log.record(1, &[0, 2], &Array1::from(vec![1.0, 3.0])).unwrap();
        assert_abs_diff_eq!(log.mean(1).unwrap(), 2.0);
        assert!(log.iteration(1)[1].is_nan());
        assert!(log.mean(0).is_none());
        assert!(matches!(
            log.record(3, &[0], &Array1::from(vec![0.0])),
            Err(SolverError::IterationOutOfRange { iteration: 3, capacity: 3 })
        ));
    }

    #[test]
    fn test_intensity_is_converted_to_modulus() {
        let intensity = Array3::from_shape_vec((1, 2, 1), vec![4.0, -1.0]).unwrap();
        let data = MeasuredDiffraction::from_intensity(&intensity, None).unwrap();
        let modulus = data.modulus(&[0]);
        assert_eq!(modulus[[0, 0, 0]], 2.0);
        assert_eq!(modulus[[0, 1, 0]], 0.0);
        assert!(data.mask(&[0]).is_none());
    }
}
