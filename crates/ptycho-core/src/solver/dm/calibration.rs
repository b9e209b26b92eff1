//! One-shot probe amplitude calibration.
//!
//! Before any object or probe update, the probe is rescaled so that the
//! intensity it predicts on the detector matches the measured intensity:
//! `scale = sqrt(Σ M² / Σ A²)`.

use ndarray::Array3;
use num_complex::Complex64;
use ptycho_compute::ComputeBackend;

use crate::solver::SolverError;

/// Running sums of measured and predicted detector intensity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AmplitudeCalibration {
    measured: f64,
    predicted: f64,
}

impl AmplitudeCalibration {
    /// Add one block's measured modulus and predicted amplitude.
    pub fn accumulate(&mut self, modulus: &Array3<f64>, predicted: &Array3<f64>) {
        self.measured += modulus.iter().map(|m| m * m).sum::<f64>();
        self.predicted += predicted.iter().map(|a| a * a).sum::<f64>();
    }

    pub fn measured(&self) -> f64 {
        self.measured
    }

    pub fn predicted(&self) -> f64 {
        self.predicted
    }

    /// Probe scale factor; fails on a zero prediction or non-finite result.
    pub fn scale(&self) -> Result<f64, SolverError> {
        let scale = (self.measured / self.predicted).sqrt();
        if self.predicted > 0.0 && scale.is_finite() {
            Ok(scale)
        } else {
            Err(SolverError::DegenerateCalibration {
                measured: self.measured,
                predicted: self.predicted,
            })
        }
    }
}

/// Multiply every probe mode by `scale`.
pub fn rescale_probe(probe: &mut [Array3<Complex64>], scale: f64, backend: &dyn ComputeBackend) {
    for mode in probe.iter_mut() {
        backend.map_inplace(mode.view_mut().into_dyn(), &move |z| z * scale);
    }
}
