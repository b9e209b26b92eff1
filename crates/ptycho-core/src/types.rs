//! Core types shared across the ptycho workspace.
//!
//! This module defines the reconstruction state (object, probe and per-mode
//! propagation descriptors), the Difference-Map parameters, and the constants
//! that fix the algorithm's relaxation and regularisation.

use ndarray::{Array2, Array3};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::measurement::FourierErrorMetric;
use crate::solver::SolverError;

/// Extrapolation weight γ in `Ψ = (1+γ)ψ − γ·ψ_dash`.
pub const DM_GAMMA: f64 = 1.0;

/// Difference weight β in `ψ_dash ← ψ_dash + β(ψ_back − ψ)`.
pub const DM_BETA: f64 = 1.0;

/// Upper bound on overlap-constraint repetitions per outer iteration.
pub const MAX_OVERLAP_REPETITIONS: usize = 10;

/// Relative probe change below which the overlap solve stops early.
pub const OVERLAP_TOLERANCE: f64 = 0.01;

/// Additive floor on the probe illumination.
pub const PROBE_ILLUMINATION_FLOOR: f64 = 1e-6;

/// Object illumination floor as a fraction of the illumination ceiling.
pub const OBJECT_ILLUMINATION_FRACTION: f64 = 1e-4;

/// Interpolation constant between the unconstrained level and
/// `pfft_relaxation` at invalid detector pixels.
pub const MASK_RELAXATION: f64 = 1.0;

/// Return the element for mode `ll`, reusing the last element for modes past
/// the end of `modes`.
///
/// # Panics
/// If `modes` is empty.
pub fn mode_at<T>(modes: &[T], ll: usize) -> &T {
    &modes[mode_index(modes.len(), ll)]
}

/// Clamped mode index into a sequence of `len` modes.
pub fn mode_index(len: usize, ll: usize) -> usize {
    ll.min(len.saturating_sub(1))
}

/// Optical propagation model between the sample and detector planes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationModel {
    /// Fraunhofer diffraction: a unitary 2-D Fourier transform.
    FarField,
    /// Fresnel propagation via the angular-spectrum transfer function.
    /// `fresnel_factor` is λz/Δx² in pixel units.
    NearField { fresnel_factor: f64 },
}

/// Real-space support imposed on the first probe mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeSupport {
    /// Disc of `radius` pixels centred in the probe window.
    Circular { radius: f64 },
}

/// Per-mode propagation descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeDescriptor {
    pub propagation: PropagationModel,
    #[serde(default)]
    pub support: Option<ProbeSupport>,
}

impl Default for ModeDescriptor {
    fn default() -> Self {
        Self {
            propagation: PropagationModel::FarField,
            support: None,
        }
    }
}

/// The object and probe estimates being reconstructed.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// One complex transmission function per object mode.
    pub object: Vec<Array2<Complex64>>,
    /// One (height, width, instance) probe stack per probe mode.
    pub probe: Vec<Array3<Complex64>>,
    /// Propagation descriptor per mode; modes past the end reuse the last.
    pub modes: Vec<ModeDescriptor>,
}

impl Reconstruction {
    /// Validate and assemble a reconstruction state.
    pub fn new(
        object: Vec<Array2<Complex64>>,
        probe: Vec<Array3<Complex64>>,
        modes: Vec<ModeDescriptor>,
    ) -> Result<Self, SolverError> {
        if object.is_empty() || probe.is_empty() || modes.is_empty() {
            return Err(SolverError::InvalidGeometry(
                "At least one object mode, probe mode and mode descriptor are required".into(),
            ));
        }
        let object_shape = object[0].shape().to_vec();
        if let Some(o) = object.iter().find(|o| o.shape() != object_shape.as_slice()) {
            return Err(SolverError::ShapeMismatch {
                expected: object_shape,
                found: o.shape().to_vec(),
            });
        }
        let (ny, nx, _) = probe[0].dim();
        if let Some(p) = probe.iter().find(|p| p.dim().0 != ny || p.dim().1 != nx) {
            return Err(SolverError::ShapeMismatch {
                expected: vec![ny, nx],
                found: p.shape()[..2].to_vec(),
            });
        }
        if ny > object_shape[0] || nx > object_shape[1] {
            return Err(SolverError::InvalidGeometry(format!(
                "Probe window {}x{} exceeds object frame {}x{}",
                ny, nx, object_shape[0], object_shape[1]
            )));
        }
        Ok(Self { object, probe, modes })
    }

    pub fn object_modes(&self) -> usize {
        self.object.len()
    }

    pub fn probe_modes(&self) -> usize {
        self.probe.len()
    }

    /// Number of modes the exit-wave engine loops over.
    pub fn max_modes(&self) -> usize {
        self.object_modes().max(self.probe_modes())
    }

    /// (height, width) of the probe window.
    pub fn probe_shape(&self) -> (usize, usize) {
        let (ny, nx, _) = self.probe[0].dim();
        (ny, nx)
    }

    /// Number of probe instances along the third axis of the first mode.
    pub fn probe_instances(&self) -> usize {
        self.probe[0].dim().2
    }
}

/// Cadence at which the Fourier error is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCadence {
    /// Every iteration for the first 20, then every
    /// `min(20, 2^(2 + iter/50))` iterations, and always on the last one.
    Logarithmic,
    /// Every `n`-th iteration and the last one.
    Every(usize),
}

impl ErrorCadence {
    /// Whether the error should be evaluated at `iteration` of a run of
    /// `number_iterations`.
    pub fn is_due(&self, iteration: usize, number_iterations: usize) -> bool {
        if iteration + 1 == number_iterations {
            return true;
        }
        match *self {
            ErrorCadence::Logarithmic => {
                if iteration < 20 {
                    return true;
                }
                let exponent = 2 + iteration / 50;
                let spacing = if exponent >= 5 { 20 } else { 1usize << exponent };
                iteration % spacing == 0
            }
            ErrorCadence::Every(n) => n > 0 && iteration % n == 0,
        }
    }
}

/// Parameters of the Difference-Map reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmParams {
    /// One probe shared by every scan, rather than one per scan group.
    pub share_probe: bool,
    /// Relaxation weight of the modulus projection at valid pixels.
    pub pfft_relaxation: f64,
    /// Fraction of the previous probe kept at each overlap repetition.
    pub probe_inertia: f64,
    /// Fraction of the previous object kept at each overlap repetition.
    pub object_inertia: f64,
    /// First outer iteration at which the probe is updated.
    pub probe_change_start: usize,
    /// First outer iteration at which the object is updated.
    pub object_change_start: usize,
    /// Arrays stay resident on the device for the whole session.
    pub keep_on_device: bool,
    /// Evaluate the overlap convergence test on the first repetition too.
    pub check_first_repetition: bool,
    pub error_cadence: ErrorCadence,
    pub error_metric: FourierErrorMetric,
    /// Total number of outer iterations the driver will run.
    pub number_iterations: usize,
}

impl Default for DmParams {
    fn default() -> Self {
        Self {
            share_probe: true,
            pfft_relaxation: 0.05,
            probe_inertia: 0.3,
            object_inertia: 0.1,
            probe_change_start: 1,
            object_change_start: 1,
            keep_on_device: false,
            check_first_repetition: false,
            error_cadence: ErrorCadence::Logarithmic,
            error_metric: FourierErrorMetric::L1,
            number_iterations: 300,
        }
    }
}
