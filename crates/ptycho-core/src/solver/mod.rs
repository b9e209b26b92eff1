//! Phase-retrieval engine abstraction and implementations.
//!
//! The [`PhaseRetrievalEngine`] trait defines the interface a reconstruction
//! method exposes to the outer iteration driver. The Difference Map
//! ([`dm::DifferenceMap`]) is the implementation provided here.

pub mod dm;

use ptycho_compute::ComputeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::measurement::{DiffractionData, FourierErrorLog};
use crate::types::Reconstruction;
use crate::views::ViewOperator;
use dm::blocks::BlockCache;
use dm::exit_wave::ExitWaveState;
use dm::overlap::OverlapReport;

/// Errors that can occur during a reconstruction step.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid block partition: {0}")]
    InvalidBlocks(String),

    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },

    #[error("No exit wave stored for mode {mode}, block {block}")]
    MissingExitWave { mode: usize, block: usize },

    #[error("Degenerate probe calibration: measured {measured:.3e}, predicted {predicted:.3e}")]
    DegenerateCalibration { measured: f64, predicted: f64 },

    #[error("Iteration {iteration} outside error log of {capacity} iterations")]
    IterationOutOfRange { iteration: usize, capacity: usize },

    #[error("Compute backend error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Scan geometry and measurements that stay fixed over a reconstruction.
pub struct Experiment {
    /// Maps between the object frame and probe-sized views.
    pub views: Box<dyn ViewOperator>,
    /// Measured Fourier modulus and detector validity mask.
    pub data: Box<dyn DiffractionData>,
}

impl Experiment {
    pub fn new(views: Box<dyn ViewOperator>, data: Box<dyn DiffractionData>) -> Self {
        Self { views, data }
    }
}

/// Which branch of the outer state machine an iteration ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Iteration 0: probe amplitude calibration only.
    Calibrate,
    /// Every later iteration: exit-wave update followed by the overlap solve.
    Update,
}

impl Phase {
    pub fn for_iteration(iteration: usize) -> Self {
        if iteration == 0 {
            Phase::Calibrate
        } else {
            Phase::Update
        }
    }
}

/// Summary of a single outer iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub iteration: usize,
    pub phase: Phase,
    /// Scale factor applied to the probe during calibration.
    pub probe_scale: Option<f64>,
    /// Overlap-constraint solver outcome for update iterations.
    pub overlap: Option<OverlapReport>,
    /// Mean Fourier error over all positions, when evaluated this iteration.
    pub mean_error: Option<f64>,
}

/// The trait every phase-retrieval method implements.
///
/// All persistent state (reconstruction, exit waves, error history) is owned
/// by the caller and threaded through each call, so a driver can checkpoint
/// or inspect it between iterations.
pub trait PhaseRetrievalEngine {
    /// Run one outer iteration.
    fn iterate(
        &self,
        iteration: usize,
        state: &mut Reconstruction,
        experiment: &Experiment,
        cache: &BlockCache,
        psi_dash: &mut ExitWaveState,
        errors: &mut FourierErrorLog,
    ) -> Result<StepReport, SolverError>;

    /// Human-readable name of the reconstruction method.
    fn method_name(&self) -> &str;
}
