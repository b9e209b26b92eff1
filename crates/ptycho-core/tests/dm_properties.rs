//! Algebraic properties of the Difference-Map step on simulated data.

use std::sync::Arc;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::Array3;
use num_complex::Complex64;
use ptycho_compute::{ComputeBackend, ComputeError, CpuBackend};
use ptycho_core::constraints::{ModulusProjector, RelaxationMask};
use ptycho_core::measurement::FourierErrorLog;
use ptycho_core::solver::dm::accumulate::{Accumulators, PassContext};
use ptycho_core::solver::dm::blocks::{BlockCache, ProbeSelection};
use ptycho_core::solver::dm::exit_wave::{form_exit_wave, ExitWaveState};
use ptycho_core::solver::dm::DifferenceMap;
use ptycho_core::solver::{Phase, PhaseRetrievalEngine, SolverError};
use ptycho_core::synthetic::{simulate, SyntheticExperiment, SyntheticSpec};
use ptycho_core::types::DmParams;

fn small_spec() -> SyntheticSpec {
    SyntheticSpec {
        object_size: 32,
        probe_size: 16,
        scan_rows: 3,
        scan_cols: 3,
        step: 6,
        ..Default::default()
    }
}

fn setup(block_size: usize) -> (SyntheticExperiment, BlockCache) {
    let sim = simulate(&small_spec()).unwrap();
    let cache = BlockCache::from_scan_ids(&sim.scan_ids, block_size).unwrap();
    (sim, cache)
}

fn params() -> DmParams {
    DmParams {
        number_iterations: 5,
        ..Default::default()
    }
}

/// Leaves detector fields untouched, so a DM pass is a pure round trip.
struct Passthrough;

impl ModulusProjector for Passthrough {
    fn project(
        &self,
        _modulus: &Array3<f64>,
        _predicted: &Array3<f64>,
        fields: Vec<Array3<Complex64>>,
        _relaxation: &RelaxationMask,
    ) -> Vec<Array3<Complex64>> {
        fields
    }
}

#[test]
fn test_calibration_is_idempotent() {
    let (sim, cache) = setup(4);
    let experiment = sim.experiment();
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::new()));

    let mut scales = Vec::new();
    for _ in 0..2 {
        let mut state = sim.initial_guess(true).unwrap();
        let mut psi_dash = ExitWaveState::default();
        let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());
        let report = engine
            .iterate(0, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
            .unwrap();
        assert_eq!(report.phase, Phase::Calibrate);
        assert!(report.overlap.is_none());
        assert!(psi_dash.is_empty());
        scales.push(report.probe_scale.unwrap());
    }
    assert_relative_eq!(scales[0], scales[1], max_relative = 1e-12);
}

#[test]
fn test_calibrated_probe_needs_no_further_scaling() {
    let (sim, cache) = setup(4);
    let experiment = sim.experiment();
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::new()));
    let mut state = sim.initial_guess(true).unwrap();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());

    let first = engine
        .iterate(0, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
        .unwrap();
    assert!(first.probe_scale.unwrap() > 0.0);
    let second = engine
        .iterate(0, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
        .unwrap();
    assert_abs_diff_eq!(second.probe_scale.unwrap(), 1.0, epsilon = 1e-9);
}

#[test]
fn test_zero_probe_calibration_fails_fast() {
    let (sim, cache) = setup(4);
    let experiment = sim.experiment();
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::new()));
    let mut state = sim.initial_guess(true).unwrap();
    state.probe[0].fill(Complex64::new(0.0, 0.0));
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());

    let result = engine.iterate(0, &mut state, &experiment, &cache, &mut psi_dash, &mut errors);
    assert!(matches!(result, Err(SolverError::DegenerateCalibration { .. })));
    assert!(state.probe[0].iter().all(|z| z.norm() == 0.0));
}

#[test]
fn test_first_pass_reproduces_raw_projection() {
    let (sim, cache) = setup(4);
    let experiment = sim.experiment();
    let frozen = DmParams {
        probe_change_start: 100,
        object_change_start: 100,
        ..params()
    };
    let engine = DifferenceMap::new(frozen, Arc::new(CpuBackend::new()))
        .with_projector(Box::new(Passthrough));
    let mut state = sim.initial_guess(true).unwrap();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());

    engine
        .iterate(0, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
        .unwrap();
    let report = engine
        .iterate(1, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
        .unwrap();
    assert_eq!(report.phase, Phase::Update);

    for (b, block) in cache.blocks.iter().enumerate() {
        let views = experiment.views.gather(&state.object[0], &block.indices);
        let probe = ProbeSelection::SharedInstance(0).select(&state.probe[0], block.len());
        let expected = form_exit_wave(&views, &probe);
        let stored = psi_dash.field(0, b).unwrap();
        for (s, e) in stored.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(s.re, e.re, epsilon = 1e-9);
            assert_abs_diff_eq!(s.im, e.im, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_block_order_does_not_change_accumulators() {
    let (sim, mut cache) = setup(2);
    let experiment = sim.experiment();
    let backend = CpuBackend::new();
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::new()));
    let mut state = sim.initial_guess(true).unwrap();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());
    for iteration in 0..2 {
        engine
            .iterate(iteration, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
            .unwrap();
        cache.refresh_illumination_ceiling(&state, experiment.views.as_ref(), true);
    }

    let ctx = PassContext {
        state: &state,
        cache: &cache,
        psi_dash: &psi_dash,
        views: experiment.views.as_ref(),
        backend: &backend,
        share_probe: true,
        keep_on_device: false,
        update_probe: true,
        update_object: true,
    };
    let forward = Accumulators::collect(&ctx, 0..cache.len()).unwrap();
    let reversed = Accumulators::collect(&ctx, (0..cache.len()).rev()).unwrap();

    for (a, b) in forward.object_update[0].iter().zip(reversed.object_update[0].iter()) {
        assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-10);
        assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-10);
    }
    for (a, b) in forward.probe_update[0].iter().zip(reversed.probe_update[0].iter()) {
        assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-10);
        assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-10);
    }
    for (&a, &b) in forward.object_illum[0].iter().zip(reversed.object_illum[0].iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
    for (&a, &b) in forward.probe_illum[0].iter().zip(reversed.probe_illum[0].iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
    assert_eq!(backend.resident_bytes(), 0);
}

#[test]
fn test_residency_out_of_memory_propagates() {
    let (sim, cache) = setup(4);
    let experiment = sim.experiment();
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::with_memory_budget(64)));
    let mut state = sim.initial_guess(true).unwrap();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());

    let result = engine.iterate(0, &mut state, &experiment, &cache, &mut psi_dash, &mut errors);
    assert!(matches!(
        result,
        Err(SolverError::Compute(ComputeError::OutOfMemory { .. }))
    ));
}

#[test]
fn test_failed_block_keeps_previous_exit_waves() {
    let (sim, mut cache) = setup(4);
    let experiment = sim.experiment();
    let mut state = sim.initial_guess(true).unwrap();
    let second_mode = state.probe[0].mapv(|z| z * 0.1);
    state.probe.push(second_mode);
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::new()));
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());
    for iteration in 0..2 {
        engine
            .iterate(iteration, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
            .unwrap();
        cache.refresh_illumination_ceiling(&state, experiment.views.as_ref(), true);
    }
    let before = psi_dash.clone();
    let probe_before = state.probe.clone();

    // Room for one 16x16x4 cell: the first block stages mode 0, then runs out
    // of memory on mode 1.
    let bounded = DifferenceMap::new(params(), Arc::new(CpuBackend::with_memory_budget(16 * 16 * 4 * 16)));
    let result = bounded.iterate(2, &mut state, &experiment, &cache, &mut psi_dash, &mut errors);
    assert!(matches!(
        result,
        Err(SolverError::Compute(ComputeError::OutOfMemory { .. }))
    ));
    assert_eq!(bounded.backend().resident_bytes(), 0);
    assert_eq!(state.probe, probe_before);
    for ll in 0..2 {
        for b in 0..cache.len() {
            assert_eq!(psi_dash.field(ll, b), before.field(ll, b), "cell ({}, {}) changed", ll, b);
        }
    }

    let report = engine
        .iterate(2, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
        .unwrap();
    assert!(report.overlap.is_some());
    assert!(report.mean_error.unwrap().is_finite());
}

#[test]
fn test_object_update_requires_illumination_ceiling() {
    let (sim, cache) = setup(4);
    let experiment = sim.experiment();
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::new()));
    let mut state = sim.initial_guess(true).unwrap();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());
    engine
        .iterate(0, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
        .unwrap();
    let object_before = state.object.clone();

    let result = engine.iterate(1, &mut state, &experiment, &cache, &mut psi_dash, &mut errors);
    assert!(matches!(result, Err(SolverError::InvalidBlocks(_))));
    assert!(psi_dash.is_empty());
    assert_eq!(state.object, object_before);
}

#[test]
fn test_kept_residency_skips_transfers() {
    let (sim, mut cache) = setup(4);
    let experiment = sim.experiment();
    let kept = DmParams {
        keep_on_device: true,
        ..params()
    };
    let engine = DifferenceMap::new(kept, Arc::new(CpuBackend::with_memory_budget(64)));
    let mut state = sim.initial_guess(true).unwrap();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());

    for iteration in 0..2 {
        engine
            .iterate(iteration, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
            .unwrap();
        cache.refresh_illumination_ceiling(&state, experiment.views.as_ref(), true);
    }
    assert_eq!(engine.backend().resident_bytes(), 0);
}

#[test]
fn test_errors_recorded_for_every_position() {
    let (sim, mut cache) = setup(4);
    let experiment = sim.experiment();
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::new()));
    let mut state = sim.initial_guess(true).unwrap();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());

    for iteration in 0..2 {
        let report = engine
            .iterate(iteration, &mut state, &experiment, &cache, &mut psi_dash, &mut errors)
            .unwrap();
        assert!(report.mean_error.unwrap().is_finite());
        assert!(errors.iteration(iteration).iter().all(|e| e.is_finite() && *e >= 0.0));
        cache.refresh_illumination_ceiling(&state, experiment.views.as_ref(), true);
    }
    assert!(errors.iteration(2).iter().all(|e| e.is_nan()));
}

#[test]
fn test_mismatched_block_cache_is_rejected() {
    let (sim, _) = setup(4);
    let experiment = sim.experiment();
    let cache = BlockCache::from_scan_ids(&[0, 0, 0], 4).unwrap();
    let engine = DifferenceMap::new(params(), Arc::new(CpuBackend::new()));
    let mut state = sim.initial_guess(true).unwrap();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(5, sim.spec.n_positions());

    let result = engine.iterate(0, &mut state, &experiment, &cache, &mut psi_dash, &mut errors);
    assert!(matches!(result, Err(SolverError::InvalidBlocks(_))));
}
