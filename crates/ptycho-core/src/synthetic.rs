//! Simulated ptychography experiments.
//!
//! A deterministic phantom is scanned on a centred raster by a Gaussian probe
//! with an optional quadratic (defocus) phase, and the measured modulus is
//! the amplitude of the propagated exit waves. Used by the CLI and tests as a
//! data source with a known ground truth.

use ndarray::{Array2, Array3, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::measurement::MeasuredDiffraction;
use crate::propagation::{FourierPropagator, Propagator};
use crate::solver::{Experiment, SolverError};
use crate::types::{ModeDescriptor, ProbeSupport, PropagationModel, Reconstruction};
use crate::views::{ScanGrid, ViewOperator};

/// Parameters of a simulated experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSpec {
    /// Side length of the square object frame (pixels).
    pub object_size: usize,
    /// Side length of the square probe window and detector (pixels).
    pub probe_size: usize,
    pub scan_rows: usize,
    pub scan_cols: usize,
    /// Raster step between neighbouring positions (pixels).
    pub step: usize,
    /// Number of scan groups the positions are split into.
    pub n_scans: usize,
    /// Gaussian probe width (pixels).
    pub probe_sigma: f64,
    /// Quadratic probe phase at the window edge (radians).
    pub defocus: f64,
    /// Peak phase shift of the phantom (radians).
    pub phase_contrast: f64,
    /// Fractional absorption of the phantom's central disc.
    pub amplitude_contrast: f64,
    pub propagation: PropagationModel,
    /// Radius of an invalid detector region around the zero frequency.
    pub beamstop_radius: Option<f64>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            object_size: 96,
            probe_size: 32,
            scan_rows: 6,
            scan_cols: 6,
            step: 10,
            n_scans: 1,
            probe_sigma: 6.0,
            defocus: 2.0,
            phase_contrast: 0.8,
            amplitude_contrast: 0.3,
            propagation: PropagationModel::FarField,
            beamstop_radius: None,
        }
    }
}

impl SyntheticSpec {
    pub fn n_positions(&self) -> usize {
        self.scan_rows * self.scan_cols
    }

    /// Scan group of each position: contiguous runs of equal length.
    pub fn scan_ids(&self) -> Vec<usize> {
        let n = self.n_positions();
        let groups = self.n_scans.max(1);
        (0..n).map(|p| p * groups / n.max(1)).collect()
    }

    pub fn mode_descriptor(&self) -> ModeDescriptor {
        ModeDescriptor {
            propagation: self.propagation,
            support: Some(ProbeSupport::Circular {
                radius: self.probe_size as f64 / 2.0,
            }),
        }
    }
}

/// A simulated experiment with its ground truth.
#[derive(Debug, Clone)]
pub struct SyntheticExperiment {
    pub spec: SyntheticSpec,
    pub object: Array2<Complex64>,
    pub probe: Array3<Complex64>,
    pub grid: ScanGrid,
    pub data: MeasuredDiffraction,
    pub scan_ids: Vec<usize>,
}

impl SyntheticExperiment {
    /// Experiment view for the engine.
    pub fn experiment(&self) -> Experiment {
        Experiment::new(Box::new(self.grid.clone()), Box::new(self.data.clone()))
    }

    /// Starting point for a reconstruction: a flat object and an unfocused
    /// Gaussian probe, one instance per scan unless the probe is shared.
    pub fn initial_guess(&self, share_probe: bool) -> Result<Reconstruction, SolverError> {
        let n = self.spec.object_size;
        let instances = if share_probe { 1 } else { self.spec.n_scans.max(1) };
        let probe = gaussian_probe(self.spec.probe_size, self.spec.probe_sigma, 0.0);
        let mut stack = Array3::zeros((self.spec.probe_size, self.spec.probe_size, instances));
        for mut frame in stack.axis_iter_mut(Axis(2)) {
            frame.assign(&probe);
        }
        Reconstruction::new(
            vec![Array2::from_elem((n, n), Complex64::new(1.0, 0.0))],
            vec![stack],
            vec![self.spec.mode_descriptor()],
        )
    }
}

/// Simulate the diffraction data of `spec`.
pub fn simulate(spec: &SyntheticSpec) -> Result<SyntheticExperiment, SolverError> {
    if spec.probe_size == 0 || spec.n_positions() == 0 {
        return Err(SolverError::InvalidGeometry(
            "Synthetic scan needs a non-empty probe and at least one position".into(),
        ));
    }
    let window = (spec.probe_size, spec.probe_size);
    let object_shape = (spec.object_size, spec.object_size);
    let extent_rows = (spec.scan_rows - 1) * spec.step + spec.probe_size;
    let extent_cols = (spec.scan_cols - 1) * spec.step + spec.probe_size;
    let origin = [
        spec.object_size.saturating_sub(extent_rows) / 2,
        spec.object_size.saturating_sub(extent_cols) / 2,
    ];
    let grid = ScanGrid::raster(
        spec.scan_rows,
        spec.scan_cols,
        spec.step,
        origin,
        window,
        object_shape,
    )?;

    let object = phantom(spec.object_size, spec.phase_contrast, spec.amplitude_contrast);
    let probe = gaussian_probe(spec.probe_size, spec.probe_sigma, spec.defocus);
    let positions: Vec<usize> = (0..spec.n_positions()).collect();

    let mut exit = grid.gather(&object, &positions);
    for mut frame in exit.axis_iter_mut(Axis(2)) {
        frame *= &probe;
    }
    let far = FourierPropagator::new().forward(&exit, &spec.mode_descriptor());
    let modulus = far.mapv(|z| z.norm());
    let mask = spec
        .beamstop_radius
        .map(|radius| beamstop_mask(spec.probe_size, radius));
    let data = MeasuredDiffraction::new(modulus, mask)?;

    log::debug!(
        "Simulated {} positions on a {}x{} object ({}x{} probe)",
        positions.len(),
        spec.object_size,
        spec.object_size,
        spec.probe_size,
        spec.probe_size
    );

    Ok(SyntheticExperiment {
        spec: spec.clone(),
        object,
        probe: probe.insert_axis(Axis(2)),
        grid,
        data,
        scan_ids: spec.scan_ids(),
    })
}

/// Phase texture over the whole frame plus an absorbing central disc.
pub fn phantom(size: usize, phase_contrast: f64, amplitude_contrast: f64) -> Array2<Complex64> {
    use std::f64::consts::TAU;
    let centre = (size as f64 - 1.0) / 2.0;
    let radius = size as f64 / 6.0;
    Array2::from_shape_fn((size, size), |(r, c)| {
        let (y, x) = (r as f64, c as f64);
        let texture = 0.5 * (1.0 + (TAU * y / 17.0).sin() * (TAU * x / 23.0).cos());
        let dy = y - centre;
        let dx = x - centre;
        let absorption = if dy * dy + dx * dx <= radius * radius {
            amplitude_contrast
        } else {
            0.0
        };
        Complex64::from_polar(1.0 - absorption, phase_contrast * texture)
    })
}

/// Centred Gaussian probe with a quadratic phase reaching `defocus` radians
/// at the window edge.
pub fn gaussian_probe(size: usize, sigma: f64, defocus: f64) -> Array2<Complex64> {
    let centre = (size as f64 - 1.0) / 2.0;
    let half = (size as f64 / 2.0).max(1.0);
    Array2::from_shape_fn((size, size), |(r, c)| {
        let dy = r as f64 - centre;
        let dx = c as f64 - centre;
        let d2 = dy * dy + dx * dx;
        Complex64::from_polar((-d2 / (2.0 * sigma * sigma)).exp(), defocus * d2 / (half * half))
    })
}

/// Detector validity mask with the pixels within `radius` of the (unshifted)
/// zero frequency marked invalid.
pub fn beamstop_mask(size: usize, radius: f64) -> Array2<f64> {
    let wrap = |k: usize| {
        let k = k as f64;
        let n = size as f64;
        if k < n / 2.0 {
            k
        } else {
            k - n
        }
    };
    Array2::from_shape_fn((size, size), |(r, c)| {
        let (qy, qx) = (wrap(r), wrap(c));
        if qy * qy + qx * qx <= radius * radius {
            0.0
        } else {
            1.0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::DiffractionData;
    use approx::assert_relative_eq;

    fn small() -> SyntheticSpec {
        SyntheticSpec {
            object_size: 32,
            probe_size: 16,
            scan_rows: 3,
            scan_cols: 3,
            step: 6,
            ..Default::default()
        }
    }

    #[test]
    fn test_simulated_modulus_conserves_energy() {
        let spec = small();
        let sim = simulate(&spec).unwrap();
        let positions: Vec<usize> = (0..spec.n_positions()).collect();
        let exit = sim.grid.gather(&sim.object, &[4]);
        let energy: f64 = exit
            .iter()
            .zip(sim.probe.iter())
            .map(|(o, p)| (o * p).norm_sqr())
            .sum();
        let measured: f64 = sim.data.modulus(&[4]).iter().map(|m| m * m).sum();
        assert_relative_eq!(energy, measured, max_relative = 1e-10);
        assert_eq!(sim.data.n_positions(), positions.len());
    }

    #[test]
    fn test_scan_ids_split_into_groups() {
        let spec = SyntheticSpec {
            n_scans: 3,
            ..small()
        };
        assert_eq!(spec.scan_ids(), vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
        let sim = simulate(&spec).unwrap();
        assert_eq!(sim.initial_guess(false).unwrap().probe_instances(), 3);
        assert_eq!(sim.initial_guess(true).unwrap().probe_instances(), 1);
    }

    #[test]
    fn test_scan_larger_than_object_is_rejected() {
        let spec = SyntheticSpec {
            step: 20,
            ..small()
        };
        assert!(matches!(simulate(&spec), Err(SolverError::InvalidGeometry(_))));
    }

    #[test]
    fn test_beamstop_masks_zero_frequency() {
        let mask = beamstop_mask(8, 1.0);
        assert_eq!(mask[[0, 0]], 0.0);
        assert_eq!(mask[[7, 0]], 0.0);
        assert_eq!(mask[[4, 4]], 1.0);
    }
}
