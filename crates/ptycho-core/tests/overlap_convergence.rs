//! Early exit of the overlap-constraint loop.
//!
//! Two fully overlapping positions over a unit object, with the exit waves
//! fixed at a target probe `T`. With the object frozen every repetition maps
//! the probe `a·T` to `(0.1·a + 0.9)·T`, so starting from `2T` the relative
//! change per repetition is 0.45, 0.082, 0.0089, ...

use approx::assert_abs_diff_eq;
use ndarray::{s, Array2, Array3};
use num_complex::Complex64;
use ptycho_compute::{ComputeBackend, CpuBackend};
use ptycho_core::constraints::SupportConstraint;
use ptycho_core::solver::dm::blocks::{Block, BlockCache};
use ptycho_core::solver::dm::exit_wave::ExitWaveState;
use ptycho_core::solver::dm::overlap::{OverlapReport, OverlapSolver};
use ptycho_core::solver::SolverError;
use ptycho_core::types::{DmParams, ModeDescriptor, Reconstruction, MAX_OVERLAP_REPETITIONS};
use ptycho_core::views::ScanGrid;

const SIZE: usize = 4;

fn target() -> Array3<Complex64> {
    Array3::from_shape_fn((SIZE, SIZE, 1), |(y, x, _)| {
        Complex64::new(1.0 + 0.1 * y as f64, 0.05 * x as f64)
    })
}

fn solve(params: &DmParams, iteration: usize, initial_scale: f64) -> (OverlapReport, Reconstruction) {
    let (report, state) = solve_with_ceiling(params, iteration, initial_scale, &[]);
    (report.unwrap(), state)
}

fn solve_with_ceiling(
    params: &DmParams,
    iteration: usize,
    initial_scale: f64,
    ceiling: &[f64],
) -> (Result<OverlapReport, SolverError>, Reconstruction) {
    let mut state = Reconstruction::new(
        vec![Array2::from_elem((SIZE, SIZE), Complex64::new(1.0, 0.0))],
        vec![target().mapv(|z| z * initial_scale)],
        vec![ModeDescriptor::default()],
    )
    .unwrap();
    let grid = ScanGrid::new(vec![[0, 0], [0, 0]], (SIZE, SIZE), (SIZE, SIZE)).unwrap();
    let mut cache = BlockCache::new(
        vec![Block {
            indices: vec![0, 1],
            scan_ids: vec![0, 0],
        }],
        2,
    )
    .unwrap();
    cache.illumination_ceiling = ceiling.to_vec();

    let t = target();
    let mut exit = Array3::<Complex64>::zeros((SIZE, SIZE, 2));
    exit.slice_mut(s![.., .., 0..1]).assign(&t);
    exit.slice_mut(s![.., .., 1..2]).assign(&t);
    let mut psi_dash = ExitWaveState::new(1, 1);
    psi_dash.store(0, 0, exit);

    let backend = CpuBackend::new();
    let solver = OverlapSolver::new(params, &backend, &SupportConstraint);
    let report = solver.solve(iteration, &mut state, &grid, &cache, &psi_dash);
    assert_eq!(backend.resident_bytes(), 0);
    (report, state)
}

fn probe_only() -> DmParams {
    DmParams {
        probe_change_start: 0,
        object_change_start: 100,
        probe_inertia: 0.1,
        ..Default::default()
    }
}

#[test]
fn test_loop_breaks_at_third_repetition() {
    let (report, state) = solve(&probe_only(), 1, 2.0);
    assert_eq!(report.repetitions, 3);
    assert!(report.converged);
    assert_abs_diff_eq!(report.relative_change.unwrap(), 0.009 / 1.01, epsilon = 1e-5);
    // The probe approaches T: a₃ = 1.001.
    let t = target();
    assert_abs_diff_eq!(state.probe[0][[2, 1, 0]].re, 1.001 * t[[2, 1, 0]].re, epsilon = 1e-5);
}

#[test]
fn test_first_repetition_check_does_not_change_outcome() {
    let params = DmParams {
        check_first_repetition: true,
        ..probe_only()
    };
    let (report, _) = solve(&params, 1, 2.0);
    assert_eq!(report.repetitions, 3);
    assert!(report.converged);
}

#[test]
fn test_no_convergence_test_until_past_probe_start() {
    let params = DmParams {
        probe_change_start: 1,
        ..probe_only()
    };
    let (report, _) = solve(&params, 1, 2.0);
    assert_eq!(report.repetitions, MAX_OVERLAP_REPETITIONS);
    assert!(!report.converged);
    assert!(report.relative_change.is_none());
}

#[test]
fn test_converged_start_stops_after_first_checked_repetition() {
    let params = DmParams {
        check_first_repetition: true,
        ..probe_only()
    };
    let (report, _) = solve(&params, 1, 1.0);
    assert_eq!(report.repetitions, 1);
    assert!(report.converged);
}

#[test]
fn test_kept_residency_requires_two_repetitions() {
    let params = DmParams {
        check_first_repetition: true,
        keep_on_device: true,
        ..probe_only()
    };
    let (report, _) = solve(&params, 1, 1.0);
    assert_eq!(report.repetitions, 2);
    assert!(report.converged);
}

#[test]
fn test_frozen_object_is_untouched() {
    let (_, state) = solve(&probe_only(), 1, 2.0);
    assert!(state.object[0].iter().all(|&z| z == Complex64::new(1.0, 0.0)));
}

fn probe_and_object() -> DmParams {
    DmParams {
        object_change_start: 0,
        check_first_repetition: true,
        ..probe_only()
    }
}

#[test]
fn test_object_floor_scales_with_illumination_ceiling() {
    // Ceiling 1e4 gives δ = 1. The probe starts at T and barely moves, so a
    // single repetition runs and O = 0.1 + 0.9·2|T|²/(2|T|² + 1).
    let params = probe_and_object();
    let (report, state) = solve_with_ceiling(&params, 1, 1.0, &[1e4]);
    let report = report.unwrap();
    assert_eq!(report.repetitions, 1);
    assert!(report.converged);

    let t = target();
    for ((y, x), o) in state.object[0].indexed_iter() {
        let illum = 2.0 * t[[y, x, 0]].norm_sqr();
        let expected = params.object_inertia + (1.0 - params.object_inertia) * illum / (illum + 1.0);
        assert_abs_diff_eq!(o.re, expected, epsilon = 1e-12);
        assert_abs_diff_eq!(o.im, 0.0, epsilon = 1e-12);
    }
}

#[test]
fn test_object_update_without_ceiling_is_rejected() {
    let (report, state) = solve_with_ceiling(&probe_and_object(), 1, 2.0, &[]);
    assert!(matches!(report, Err(SolverError::InvalidBlocks(_))));
    assert!(state.object[0].iter().all(|&z| z == Complex64::new(1.0, 0.0)));
    let t = target();
    assert_abs_diff_eq!(state.probe[0][[2, 1, 0]].re, 2.0 * t[[2, 1, 0]].re, epsilon = 1e-12);
}
