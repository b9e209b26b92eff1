//! Difference-Map (DM) reconstruction engine.
//!
//! One call to [`DifferenceMap::iterate`] runs one outer iteration:
//!
//! - **Iteration 0** calibrates the probe amplitude against the measured
//!   intensity and clears the exit-wave state.
//! - **Every later iteration** runs the DM update on every block
//!   (extrapolate, propagate, project onto the measured modulus,
//!   back-propagate, difference step) and then the overlap-constraint solver.
//!
//! # Execution
//!
//! Blocks and modes are processed sequentially; elementwise work inside a
//! block goes through the [`ComputeBackend`], and per-frame FFTs run in
//! parallel inside the [`Propagator`].

pub mod accumulate;
pub mod blocks;
pub mod calibration;
pub mod exit_wave;
pub mod overlap;

use std::sync::Arc;

use ndarray::{Array, Array3, Dimension};
use num_complex::Complex64;
use ptycho_compute::ComputeBackend;

use super::{Experiment, Phase, PhaseRetrievalEngine, SolverError, StepReport};
use crate::constraints::{
    reciprocal_amplitude, AmplitudeProjector, ModulusProjector, ProbeConstraint, RelaxationMask,
    SupportConstraint,
};
use crate::measurement::FourierErrorLog;
use crate::propagation::{FourierPropagator, Propagator};
use crate::types::{mode_at, DmParams, Reconstruction, DM_BETA, DM_GAMMA, MASK_RELAXATION};
use blocks::BlockCache;
use calibration::{rescale_probe, AmplitudeCalibration};
use exit_wave::{difference_update, extrapolate, form_exit_wave, ExitWave, ExitWaveState};
use overlap::OverlapSolver;

/// Moves exit-wave cells in and out of device memory around a block, unless
/// arrays are kept resident for the whole session.
pub(crate) struct Residency<'a> {
    backend: &'a dyn ComputeBackend,
    keep: bool,
}

impl<'a> Residency<'a> {
    pub(crate) fn new(backend: &'a dyn ComputeBackend, keep_on_device: bool) -> Self {
        Self {
            backend,
            keep: keep_on_device,
        }
    }

    pub(crate) fn stage<D: Dimension>(
        &self,
        host: Array<Complex64, D>,
    ) -> Result<Array<Complex64, D>, SolverError> {
        if self.keep {
            return Ok(host);
        }
        Ok(self.backend.to_device(host.into_dyn())?.into_dimensionality::<D>()?)
    }

    pub(crate) fn release<D: Dimension>(
        &self,
        device: Array<Complex64, D>,
    ) -> Result<Array<Complex64, D>, SolverError> {
        if self.keep {
            return Ok(device);
        }
        Ok(self.backend.to_host(device.into_dyn())?.into_dimensionality::<D>()?)
    }

    /// Release every array, even after one of the transfers fails; the first
    /// failure is returned.
    pub(crate) fn release_all<D: Dimension>(
        &self,
        staged: Vec<Array<Complex64, D>>,
    ) -> Result<Vec<Array<Complex64, D>>, SolverError> {
        let mut host = Vec::with_capacity(staged.len());
        let mut first_error = None;
        for array in staged {
            match self.release(array) {
                Ok(array) => host.push(array),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(host),
        }
    }
}

/// Per-block intermediate fields of one DM pass, one entry per mode.
struct BlockFields {
    /// Current exit wave `ψ = O·P`.
    psi: Vec<Array3<Complex64>>,
    /// Persistent estimate, staged for this block.
    psi_dash: Vec<Array3<Complex64>>,
    /// Extrapolated exit wave at the detector.
    far_field: Vec<Array3<Complex64>>,
    /// Incoherent amplitude of `far_field`.
    predicted: Array3<f64>,
    modulus: Array3<f64>,
    mask: Option<Array3<f64>>,
}

/// The Difference-Map engine with its collaborators.
pub struct DifferenceMap {
    pub params: DmParams,
    backend: Arc<dyn ComputeBackend>,
    propagator: Box<dyn Propagator>,
    projector: Box<dyn ModulusProjector>,
    probe_constraint: Box<dyn ProbeConstraint>,
}

impl DifferenceMap {
    /// Engine with the FFT propagator, amplitude projector and circular
    /// support constraint.
    pub fn new(params: DmParams, backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            params,
            backend,
            propagator: Box::new(FourierPropagator::new()),
            projector: Box::new(AmplitudeProjector),
            probe_constraint: Box::new(SupportConstraint),
        }
    }

    pub fn with_propagator(mut self, propagator: Box<dyn Propagator>) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn with_projector(mut self, projector: Box<dyn ModulusProjector>) -> Self {
        self.projector = projector;
        self
    }

    pub fn with_probe_constraint(mut self, constraint: Box<dyn ProbeConstraint>) -> Self {
        self.probe_constraint = constraint;
        self
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    fn validate(
        &self,
        state: &Reconstruction,
        experiment: &Experiment,
        cache: &BlockCache,
        errors: &FourierErrorLog,
    ) -> Result<(), SolverError> {
        let n_positions = experiment.data.n_positions();
        if experiment.views.n_positions() != n_positions {
            return Err(SolverError::InvalidGeometry(format!(
                "Scan has {} views but {} diffraction frames",
                experiment.views.n_positions(),
                n_positions
            )));
        }
        if cache.n_positions() != n_positions {
            return Err(SolverError::InvalidBlocks(format!(
                "Blocks cover {} positions, data has {}",
                cache.n_positions(),
                n_positions
            )));
        }
        if errors.values().ncols() != n_positions {
            return Err(SolverError::ShapeMismatch {
                expected: vec![errors.number_iterations(), n_positions],
                found: errors.values().shape().to_vec(),
            });
        }
        cache.check_probe_instances(state, self.params.share_probe)
    }

    /// Form, extrapolate and propagate the exit waves of block `b`.
    ///
    /// Copies of the block's exit-wave cells are staged; empty cells
    /// bootstrap to the current exit wave. `psi_dash` itself is only written
    /// once the whole block has been updated, and on failure every staged
    /// copy is released again.
    fn propagate_block(
        &self,
        b: usize,
        state: &Reconstruction,
        experiment: &Experiment,
        cache: &BlockCache,
        psi_dash: &ExitWaveState,
        residency: &Residency<'_>,
    ) -> Result<BlockFields, SolverError> {
        let mut staged = Vec::with_capacity(state.max_modes());
        match self.propagate_staged(b, state, experiment, cache, psi_dash, residency, &mut staged) {
            Ok(mut fields) => {
                fields.psi_dash = staged;
                Ok(fields)
            }
            Err(e) => {
                if let Err(release) = residency.release_all(staged) {
                    log::warn!("Block {}: releasing staged exit waves failed: {}", b, release);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn propagate_staged(
        &self,
        b: usize,
        state: &Reconstruction,
        experiment: &Experiment,
        cache: &BlockCache,
        psi_dash: &ExitWaveState,
        residency: &Residency<'_>,
        staged: &mut Vec<Array3<Complex64>>,
    ) -> Result<BlockFields, SolverError> {
        let block = &cache.blocks[b];
        let backend = self.backend();
        let n_modes = state.max_modes();
        let mut psi = Vec::with_capacity(n_modes);
        let mut far_field = Vec::with_capacity(n_modes);

        for (ll, selection) in cache
            .selections(b, n_modes, self.params.share_probe)
            .into_iter()
            .enumerate()
        {
            let probe = selection.select(mode_at(&state.probe, ll), block.len());
            let object_views = experiment
                .views
                .gather(mode_at(&state.object, ll), &block.indices);
            if object_views.dim() != probe.dim() {
                return Err(SolverError::ShapeMismatch {
                    expected: probe.shape().to_vec(),
                    found: object_views.shape().to_vec(),
                });
            }
            let current = form_exit_wave(&object_views, &probe);
            let stored = match psi_dash.cell(ll, b) {
                ExitWave::Field(field) => field.clone(),
                ExitWave::Uninitialized => current.clone(),
            };
            staged.push(residency.stage(stored)?);
            let extrapolated = extrapolate(&current, &staged[ll], DM_GAMMA, backend)?;
            far_field.push(
                self.propagator
                    .forward(&extrapolated, mode_at(&state.modes, ll)),
            );
            psi.push(current);
        }

        let predicted = reciprocal_amplitude(&far_field);
        let modulus = experiment.data.modulus(&block.indices);
        if modulus.dim() != predicted.dim() {
            return Err(SolverError::ShapeMismatch {
                expected: predicted.shape().to_vec(),
                found: modulus.shape().to_vec(),
            });
        }
        let mask = experiment.data.mask(&block.indices);
        Ok(BlockFields {
            psi,
            psi_dash: Vec::new(),
            far_field,
            predicted,
            modulus,
            mask,
        })
    }

    fn record_error(
        &self,
        iteration: usize,
        b: usize,
        cache: &BlockCache,
        fields: &BlockFields,
        errors: &mut FourierErrorLog,
    ) -> Result<(), SolverError> {
        if !self
            .params
            .error_cadence
            .is_due(iteration, self.params.number_iterations)
        {
            return Ok(());
        }
        let per_position = self.params.error_metric.per_position(
            &fields.modulus,
            &fields.predicted,
            fields.mask.as_ref(),
            cache.error_region.as_ref(),
        );
        errors.record(iteration, &cache.blocks[b].indices, &per_position)
    }

    /// Iteration 0: rescale the probe to the measured intensity and clear
    /// the exit-wave state. Returns the applied scale.
    fn calibrate(
        &self,
        state: &mut Reconstruction,
        experiment: &Experiment,
        cache: &BlockCache,
        psi_dash: &mut ExitWaveState,
        errors: &mut FourierErrorLog,
    ) -> Result<f64, SolverError> {
        let residency = Residency::new(self.backend(), self.params.keep_on_device);
        let mut calibration = AmplitudeCalibration::default();
        for b in 0..cache.len() {
            let fields = self.propagate_block(b, state, experiment, cache, psi_dash, &residency)?;
            calibration.accumulate(&fields.modulus, &fields.predicted);
            let recorded = self.record_error(0, b, cache, &fields, errors);
            residency.release_all(fields.psi_dash)?;
            recorded?;
        }
        psi_dash.clear();

        let scale = calibration.scale()?;
        log::debug!(
            "Probe calibration: measured {:.4e}, predicted {:.4e}, scale {:.6}",
            calibration.measured(),
            calibration.predicted(),
            scale
        );
        rescale_probe(&mut state.probe, scale, self.backend());
        Ok(scale)
    }

    /// DM update of every block: modulus projection, back-propagation and
    /// the difference step into `psi_dash`.
    fn update_exit_waves(
        &self,
        iteration: usize,
        state: &Reconstruction,
        experiment: &Experiment,
        cache: &BlockCache,
        psi_dash: &mut ExitWaveState,
        errors: &mut FourierErrorLog,
    ) -> Result<(), SolverError> {
        let backend = self.backend();
        let residency = Residency::new(backend, self.params.keep_on_device);
        for b in 0..cache.len() {
            let fields = self.propagate_block(b, state, experiment, cache, psi_dash, &residency)?;
            let recorded = self.record_error(iteration, b, cache, &fields, errors);

            let relaxation = RelaxationMask::build(
                fields.mask.as_ref(),
                self.params.pfft_relaxation,
                MASK_RELAXATION,
            );
            let constrained = self.projector.project(
                &fields.modulus,
                &fields.predicted,
                fields.far_field,
                &relaxation,
            );
            let mut dashes = fields.psi_dash;
            let outcome = recorded.and_then(|()| {
                constrained
                    .iter()
                    .zip(&fields.psi)
                    .zip(dashes.iter_mut())
                    .enumerate()
                    .try_for_each(|(ll, ((field, psi), dash))| {
                        let back = self.propagator.backward(field, mode_at(&state.modes, ll));
                        difference_update(dash, &back, psi, DM_BETA, backend)
                    })
            });
            let released = residency.release_all(dashes);
            outcome?;
            for (ll, dash) in released?.into_iter().enumerate() {
                psi_dash.store(ll, b, dash);
            }
            log::debug!(
                "Iteration {}: block {}/{} projected ({} positions)",
                iteration,
                b + 1,
                cache.len(),
                cache.blocks[b].len()
            );
        }
        Ok(())
    }
}

impl PhaseRetrievalEngine for DifferenceMap {
    fn iterate(
        &self,
        iteration: usize,
        state: &mut Reconstruction,
        experiment: &Experiment,
        cache: &BlockCache,
        psi_dash: &mut ExitWaveState,
        errors: &mut FourierErrorLog,
    ) -> Result<StepReport, SolverError> {
        self.validate(state, experiment, cache, errors)?;
        psi_dash.ensure_shape(state.max_modes(), cache.len());

        let mut report = StepReport {
            iteration,
            phase: Phase::for_iteration(iteration),
            probe_scale: None,
            overlap: None,
            mean_error: None,
        };
        match report.phase {
            Phase::Calibrate => {
                report.probe_scale = Some(self.calibrate(state, experiment, cache, psi_dash, errors)?);
            }
            Phase::Update => {
                if iteration >= self.params.object_change_start {
                    cache.check_illumination_ceiling(state.object_modes())?;
                }
                self.update_exit_waves(iteration, state, experiment, cache, psi_dash, errors)?;
                let solver = OverlapSolver::new(
                    &self.params,
                    self.backend(),
                    self.probe_constraint.as_ref(),
                );
                report.overlap = Some(solver.solve(
                    iteration,
                    state,
                    experiment.views.as_ref(),
                    cache,
                    psi_dash,
                )?);
            }
        }
        if self
            .params
            .error_cadence
            .is_due(iteration, self.params.number_iterations)
        {
            report.mean_error = errors.mean(iteration);
        }
        Ok(report)
    }

    fn method_name(&self) -> &str {
        "Difference Map (DM)"
    }
}
