//! Real-space overlap-constraint solver.
//!
//! Given the exit waves left by the Difference-Map step, object and probe are
//! re-estimated by alternating illumination-weighted averages:
//!
//! $$P \leftarrow \frac{\sum \psi\,\overline{O}}{\sum |O|^2 + \varepsilon}, \qquad
//!   O \leftarrow \frac{\sum \psi\,\overline{P}}{\sum |P|^2 + \delta}$$
//!
//! each blended with the previous estimate through an inertia factor. The
//! loop stops after a fixed number of repetitions or once the first probe
//! mode stops moving.

use ndarray::{Array2, Array3, ArrayViewD, ArrayViewMutD, Axis, Zip};
use num_complex::Complex64;
use ptycho_compute::ComputeBackend;
use serde::{Deserialize, Serialize};

use super::accumulate::{Accumulators, PassContext};
use super::blocks::BlockCache;
use super::exit_wave::ExitWaveState;
use crate::constraints::ProbeConstraint;
use crate::solver::SolverError;
use crate::types::{
    mode_at, DmParams, ModeDescriptor, Reconstruction, MAX_OVERLAP_REPETITIONS,
    OVERLAP_TOLERANCE, PROBE_ILLUMINATION_FLOOR,
};
use crate::views::ViewOperator;

/// Outcome of one overlap solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapReport {
    /// Repetitions actually run.
    pub repetitions: usize,
    /// Relative change of the first probe mode at the last tested repetition.
    pub relative_change: Option<f64>,
    /// Whether the loop stopped on the tolerance rather than the bound.
    pub converged: bool,
}

/// Inner fixed-point loop over object and probe.
pub struct OverlapSolver<'a> {
    pub params: &'a DmParams,
    pub backend: &'a dyn ComputeBackend,
    pub constraint: &'a dyn ProbeConstraint,
}

impl<'a> OverlapSolver<'a> {
    pub fn new(
        params: &'a DmParams,
        backend: &'a dyn ComputeBackend,
        constraint: &'a dyn ProbeConstraint,
    ) -> Self {
        Self {
            params,
            backend,
            constraint,
        }
    }

    /// Run up to [`MAX_OVERLAP_REPETITIONS`] accumulate-then-apply passes.
    pub fn solve(
        &self,
        iteration: usize,
        state: &mut Reconstruction,
        views: &dyn ViewOperator,
        cache: &BlockCache,
        psi_dash: &ExitWaveState,
    ) -> Result<OverlapReport, SolverError> {
        let params = self.params;
        let update_probe = iteration >= params.probe_change_start;
        let update_object = iteration >= params.object_change_start;
        let test_convergence = iteration > params.probe_change_start;
        let min_repetitions = 1 + usize::from(params.keep_on_device);
        let deltas = if update_object {
            (0..state.object_modes())
                .map(|k| cache.object_regularisation(k))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        let mut report = OverlapReport {
            repetitions: 0,
            relative_change: None,
            converged: false,
        };

        for repetition in 1..=MAX_OVERLAP_REPETITIONS {
            let probe_0 = state.probe[0].clone();
            let acc = {
                let ctx = PassContext {
                    state: &*state,
                    cache,
                    psi_dash,
                    views,
                    backend: self.backend,
                    share_probe: params.share_probe,
                    keep_on_device: params.keep_on_device,
                    update_probe,
                    update_object,
                };
                Accumulators::collect(&ctx, 0..cache.len())?
            };
            self.apply(state, acc, &deltas)?;
            report.repetitions = repetition;

            if !test_convergence || (repetition == 1 && !params.check_first_repetition) {
                continue;
            }
            let change = relative_change(&state.probe[0], &probe_0);
            report.relative_change = Some(change);
            log::debug!(
                "Iteration {} overlap repetition {}: relative probe change {:.3e}",
                iteration,
                repetition,
                change
            );
            if change < OVERLAP_TOLERANCE && repetition >= min_repetitions {
                report.converged = true;
                break;
            }
        }

        if report.converged {
            log::info!(
                "Iteration {}: overlap constraint converged after {} repetitions",
                iteration,
                report.repetitions
            );
        } else if test_convergence {
            log::warn!(
                "Iteration {}: overlap constraint not converged after {} repetitions (change {:?})",
                iteration,
                report.repetitions,
                report.relative_change
            );
        }
        Ok(report)
    }

    /// Commit one pass of accumulated statistics to the reconstruction.
    fn apply(
        &self,
        state: &mut Reconstruction,
        acc: Accumulators,
        deltas: &[f64],
    ) -> Result<(), SolverError> {
        let params = self.params;
        let Accumulators {
            probe_update,
            probe_illum,
            object_update,
            object_illum,
        } = acc;

        for (k, (update, illum)) in probe_update.iter().zip(&probe_illum).enumerate() {
            let mode = *mode_at(&state.modes, k);
            apply_probe_update(
                &mut state.probe[k],
                update,
                illum,
                params.probe_inertia,
                (k == 0).then_some((self.constraint, &mode)),
                self.backend,
            )?;
        }
        for (k, ((update, illum), &delta)) in object_update
            .iter()
            .zip(&object_illum)
            .zip(deltas)
            .enumerate()
        {
            apply_object_update(
                &mut state.object[k],
                update,
                illum,
                delta,
                params.object_inertia,
                self.backend,
            )?;
        }
        Ok(())
    }
}

/// `P ← inertia·P + (1 − inertia)·C(update / (illum + ε))`, where `C` is the
/// optional support constraint.
pub fn apply_probe_update(
    probe: &mut Array3<Complex64>,
    update: &Array3<Complex64>,
    illum: &Array3<f64>,
    inertia: f64,
    constraint: Option<(&dyn ProbeConstraint, &ModeDescriptor)>,
    backend: &dyn ComputeBackend,
) -> Result<(), SolverError> {
    let mut fresh = Zip::from(update)
        .and(illum)
        .map_collect(|&u, &i| u / (i + PROBE_ILLUMINATION_FLOOR));
    if let Some((constraint, mode)) = constraint {
        fresh = constraint.apply(fresh, mode);
    }
    blend(probe.view_mut().into_dyn(), fresh.view().into_dyn(), inertia, backend)
}

/// `O ← inertia·O + (1 − inertia)·update / (illum + δ)`.
pub fn apply_object_update(
    object: &mut Array2<Complex64>,
    update: &Array2<Complex64>,
    illum: &Array2<f64>,
    delta: f64,
    inertia: f64,
    backend: &dyn ComputeBackend,
) -> Result<(), SolverError> {
    let fresh = Zip::from(update)
        .and(illum)
        .map_collect(|&u, &i| u / (i + delta));
    blend(object.view_mut().into_dyn(), fresh.view().into_dyn(), inertia, backend)
}

fn blend(
    old: ArrayViewMutD<'_, Complex64>,
    fresh: ArrayViewD<'_, Complex64>,
    inertia: f64,
    backend: &dyn ComputeBackend,
) -> Result<(), SolverError> {
    backend.zip_map_inplace(old, fresh, &move |o, n| o * inertia + n * (1.0 - inertia))?;
    Ok(())
}

/// Largest relative change `‖P − P₀‖ / ‖P₀‖` over the probe instances.
///
/// An instance that was zero and stayed zero counts as unchanged; one that
/// was zero and moved counts as an infinite change.
pub fn relative_change(probe: &Array3<Complex64>, probe_0: &Array3<Complex64>) -> f64 {
    probe
        .axis_iter(Axis(2))
        .zip(probe_0.axis_iter(Axis(2)))
        .map(|(new, old)| {
            let diff: f64 = Zip::from(&new)
                .and(&old)
                .fold(0.0, |acc, &n, &o| acc + (n - o).norm_sqr());
            let base: f64 = old.iter().map(|z| z.norm_sqr()).sum();
            match (diff, base) {
                (d, _) if d == 0.0 => 0.0,
                (_, b) if b == 0.0 => f64::INFINITY,
                (d, b) => (d / b).sqrt(),
            }
        })
        .fold(0.0, f64::max)
}
