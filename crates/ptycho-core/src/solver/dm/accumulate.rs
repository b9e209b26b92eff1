//! Accumulation of probe and object update statistics across blocks.
//!
//! Each block's contribution is computed independently into an owned
//! [`BlockContribution`] and then folded into the pass-wide
//! [`Accumulators`]. Accumulation is a plain sum, so the block order only
//! affects floating-point rounding; the object and probe are not touched
//! until every block has been folded in.

use ndarray::{Array2, Array3, Axis, Zip};
use num_complex::Complex64;
use ptycho_compute::ComputeBackend;

use super::blocks::{BlockCache, ProbeSelection};
use super::exit_wave::ExitWaveState;
use super::Residency;
use crate::solver::SolverError;
use crate::types::{mode_at, mode_index, Reconstruction};
use crate::views::ViewOperator;

/// Everything a block needs to compute its contribution to one pass.
pub struct PassContext<'a> {
    pub state: &'a Reconstruction,
    pub cache: &'a BlockCache,
    pub psi_dash: &'a ExitWaveState,
    pub views: &'a dyn ViewOperator,
    pub backend: &'a dyn ComputeBackend,
    pub share_probe: bool,
    pub keep_on_device: bool,
    pub update_probe: bool,
    pub update_object: bool,
}

/// Pass-wide update and illumination sums.
///
/// Only the mode classes updated in this pass are allocated; the others are
/// empty vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulators {
    pub probe_update: Vec<Array3<Complex64>>,
    pub probe_illum: Vec<Array3<f64>>,
    pub object_update: Vec<Array2<Complex64>>,
    pub object_illum: Vec<Array2<f64>>,
}

impl Accumulators {
    /// Zeroed accumulators shaped like the reconstruction.
    pub fn zeroed(state: &Reconstruction, update_probe: bool, update_object: bool) -> Self {
        let (probe_update, probe_illum) = if update_probe {
            state
                .probe
                .iter()
                .map(|p| (Array3::<Complex64>::zeros(p.dim()), Array3::<f64>::zeros(p.dim())))
                .unzip()
        } else {
            (Vec::new(), Vec::new())
        };
        let (object_update, object_illum) = if update_object {
            state
                .object
                .iter()
                .map(|o| (Array2::<Complex64>::zeros(o.dim()), Array2::<f64>::zeros(o.dim())))
                .unzip()
        } else {
            (Vec::new(), Vec::new())
        };
        Self {
            probe_update,
            probe_illum,
            object_update,
            object_illum,
        }
    }

    /// Fold the contributions of the blocks in `order` into fresh
    /// accumulators.
    pub fn collect<I>(ctx: &PassContext<'_>, order: I) -> Result<Self, SolverError>
    where
        I: IntoIterator<Item = usize>,
    {
        let initial = Self::zeroed(ctx.state, ctx.update_probe, ctx.update_object);
        order.into_iter().try_fold(initial, |mut acc, b| {
            let contribution = BlockContribution::compute(ctx, b)?;
            acc.absorb(contribution, ctx.views);
            Ok(acc)
        })
    }

    /// Add one block's contribution.
    pub fn absorb(&mut self, contribution: BlockContribution, views: &dyn ViewOperator) {
        for term in contribution.probe {
            let update = &mut self.probe_update[term.mode];
            let illum = &mut self.probe_illum[term.mode];
            for (k, &instance) in term.instances.iter().enumerate() {
                let mut slot = update.index_axis_mut(Axis(2), instance);
                slot += &term.update.index_axis(Axis(2), k);
                let mut slot = illum.index_axis_mut(Axis(2), instance);
                slot += &term.illum.index_axis(Axis(2), k);
            }
        }
        for term in contribution.object {
            views.scatter_add(
                &mut self.object_update[term.mode],
                &mut self.object_illum[term.mode],
                &term.patches,
                &term.weights,
                &term.positions,
            );
        }
    }
}

/// Probe statistics of one mode of one block.
#[derive(Debug, Clone)]
pub struct ProbeTerm {
    /// Target probe mode.
    pub mode: usize,
    /// Probe instance receiving each frame of `update` / `illum`.
    pub instances: Vec<usize>,
    /// `Σ ψ·conj(O)`, one frame per entry of `instances`.
    pub update: Array3<Complex64>,
    /// `Σ |O|²`, one frame per entry of `instances`.
    pub illum: Array3<f64>,
}

/// Object statistics of one mode of one block, still in view coordinates.
#[derive(Debug, Clone)]
pub struct ObjectTerm {
    /// Target object mode.
    pub mode: usize,
    pub positions: Vec<usize>,
    /// `ψ·conj(P)` per position.
    pub patches: Array3<Complex64>,
    /// `|P|²` per position.
    pub weights: Array3<f64>,
}

/// Everything one block adds to a pass.
#[derive(Debug, Clone, Default)]
pub struct BlockContribution {
    pub probe: Vec<ProbeTerm>,
    pub object: Vec<ObjectTerm>,
}

impl BlockContribution {
    /// Compute the contribution of block `b` from the stored exit waves.
    pub fn compute(ctx: &PassContext<'_>, b: usize) -> Result<Self, SolverError> {
        let state = ctx.state;
        let block = &ctx.cache.blocks[b];
        let residency = Residency::new(ctx.backend, ctx.keep_on_device);
        let mut contribution = BlockContribution::default();

        for (ll, selection) in ctx
            .cache
            .selections(b, state.max_modes(), ctx.share_probe)
            .into_iter()
            .enumerate()
        {
            let probe = selection.select(mode_at(&state.probe, ll), block.len());
            let field = ctx
                .psi_dash
                .field(ll, b)
                .ok_or(SolverError::MissingExitWave { mode: ll, block: b })?;
            let psi = residency.stage(field.clone())?;
            let object_views = ctx.views.gather(mode_at(&state.object, ll), &block.indices);

            if ctx.update_probe {
                contribution.probe.push(probe_term(
                    mode_index(state.probe_modes(), ll),
                    &selection,
                    &psi,
                    &object_views,
                ));
            }
            if ctx.update_object {
                contribution.object.push(ObjectTerm {
                    mode: mode_index(state.object_modes(), ll),
                    positions: block.indices.clone(),
                    patches: Zip::from(&psi).and(&probe).map_collect(|&w, &p| w * p.conj()),
                    weights: probe.mapv(|p| p.norm_sqr()),
                });
            }
            residency.release(psi)?;
        }
        Ok(contribution)
    }
}

/// `ψ·conj(O)` and `|O|²`, summed over positions for a shared instance.
fn probe_term(
    mode: usize,
    selection: &ProbeSelection,
    psi: &Array3<Complex64>,
    object_views: &Array3<Complex64>,
) -> ProbeTerm {
    let update = Zip::from(psi)
        .and(object_views)
        .map_collect(|&w, &o| w * o.conj());
    let illum = object_views.mapv(|o| o.norm_sqr());
    match selection {
        ProbeSelection::SharedInstance(instance) => ProbeTerm {
            mode,
            instances: vec![*instance],
            update: update.sum_axis(Axis(2)).insert_axis(Axis(2)),
            illum: illum.sum_axis(Axis(2)).insert_axis(Axis(2)),
        },
        ProbeSelection::PerGroupInstance(ids) => ProbeTerm {
            mode,
            instances: ids.clone(),
            update,
            illum,
        },
    }
}
