//! Reconstruction runner: ties together the simulated experiment, the block
//! cache and the Difference-Map engine.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use ptycho_compute::{ComputeBackend, ComputeError, CpuBackend};
use ptycho_core::measurement::FourierErrorLog;
use ptycho_core::solver::dm::blocks::BlockCache;
use ptycho_core::solver::dm::exit_wave::ExitWaveState;
use ptycho_core::solver::dm::DifferenceMap;
use ptycho_core::solver::{PhaseRetrievalEngine, StepReport};
use ptycho_core::synthetic::simulate;
use ptycho_core::types::Reconstruction;

use crate::config::{JobConfig, ReconstructionConfig};

/// Results from a reconstruction run.
pub struct ReconstructionOutput {
    pub method: String,
    pub reports: Vec<StepReport>,
    pub errors: FourierErrorLog,
    pub state: Reconstruction,
}

/// Run a full reconstruction from a parsed job configuration.
pub fn run_reconstruction(job: &JobConfig) -> Result<ReconstructionOutput> {
    let sim = simulate(&job.experiment).context("Failed to simulate the experiment")?;
    let n_positions = job.experiment.n_positions();
    println!(
        "  Scan: {} positions ({}x{}, step {} px), {} scan group(s)",
        n_positions,
        job.experiment.scan_rows,
        job.experiment.scan_cols,
        job.experiment.step,
        job.experiment.n_scans.max(1)
    );
    println!(
        "  Object {}x{} px, probe {}x{} px, {:?}",
        job.experiment.object_size,
        job.experiment.object_size,
        job.experiment.probe_size,
        job.experiment.probe_size,
        job.experiment.propagation
    );

    let params = job.reconstruction.to_params();
    log::info!("Reconstruction parameters: {:?}", params);
    let backend = create_backend(&job.reconstruction)?;
    let engine = DifferenceMap::new(params.clone(), backend);

    let mut state = sim.initial_guess(params.share_probe)?;
    let mut cache = BlockCache::from_scan_ids(&sim.scan_ids, job.reconstruction.block_size)?;
    if let Some(region) = job.reconstruction.error_region {
        cache = cache.with_error_region(region);
    }
    println!(
        "  Blocks: {} (at most {} positions each)",
        cache.len(),
        job.reconstruction.block_size
    );

    let experiment = sim.experiment();
    let mut psi_dash = ExitWaveState::default();
    let mut errors = FourierErrorLog::new(params.number_iterations, n_positions);
    let mut reports = Vec::with_capacity(params.number_iterations);

    for iteration in 0..params.number_iterations {
        let report = engine
            .iterate(
                iteration,
                &mut state,
                &experiment,
                &cache,
                &mut psi_dash,
                &mut errors,
            )
            .with_context(|| format!("{} failed at iteration {}", engine.method_name(), iteration))?;
        cache.refresh_illumination_ceiling(&state, experiment.views.as_ref(), params.share_probe);

        if let Some(scale) = report.probe_scale {
            println!("  [calibration] probe scale = {:.4e}", scale);
        }
        if let Some(error) = report.mean_error {
            let repetitions = report
                .overlap
                .as_ref()
                .map_or(0, |overlap| overlap.repetitions);
            println!(
                "  [{}/{}] Fourier error = {:.4e} (overlap repetitions: {})",
                iteration + 1,
                params.number_iterations,
                error,
                repetitions
            );
        }
        reports.push(report);
    }
    log::info!(
        "{} finished {} iterations",
        engine.method_name(),
        params.number_iterations
    );

    Ok(ReconstructionOutput {
        method: engine.method_name().to_string(),
        reports,
        errors,
        state,
    })
}

/// Write the evaluated rows of the Fourier error history.
pub fn write_errors_csv(errors: &FourierErrorLog, path: &Path, job: &JobConfig) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::File::create(path)?;

    writeln!(file, "# ptycho Difference-Map reconstruction: Fourier error history")?;
    writeln!(file, "# Version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(file, "# metric: {:?}", job.reconstruction.error_metric)?;
    writeln!(file, "#")?;

    let n_positions = errors.values().ncols();
    let header: Vec<String> = (0..n_positions).map(|p| format!("pos_{}", p)).collect();
    writeln!(file, "iteration,mean,{}", header.join(","))?;

    for iteration in 0..errors.number_iterations() {
        let Some(mean) = errors.mean(iteration) else {
            continue;
        };
        let row: Vec<String> = errors
            .iteration(iteration)
            .iter()
            .map(|e| format!("{:.6e}", e))
            .collect();
        writeln!(file, "{},{:.6e},{}", iteration, mean, row.join(","))?;
    }

    println!("Errors written to: {}", path.display());
    Ok(())
}

#[derive(Serialize)]
struct Summary<'a> {
    method: &'a str,
    iterations: usize,
    final_error: Option<f64>,
    reports: &'a [StepReport],
}

/// Write the per-iteration reports as JSON.
pub fn write_summary_json(output: &ReconstructionOutput, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let summary = Summary {
        method: &output.method,
        iterations: output.reports.len(),
        final_error: output.reports.iter().rev().find_map(|r| r.mean_error),
        reports: &output.reports,
    };
    let json = serde_json::to_string_pretty(&summary).context("Failed to serialise reports")?;
    std::fs::write(path, json)?;

    println!("Summary written to: {}", path.display());
    Ok(())
}

/// Write amplitude and phase of the first object mode.
pub fn write_object_csv(state: &Reconstruction, path: &Path) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let object = &state.object[0];
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "# ptycho reconstructed object, mode 0")?;
    writeln!(file, "# Grid: {}x{}", object.nrows(), object.ncols())?;
    writeln!(file, "#")?;
    writeln!(file, "row,col,amplitude,phase")?;
    for ((row, col), z) in object.indexed_iter() {
        writeln!(file, "{},{},{:.6e},{:.6e}", row, col, z.norm(), z.arg())?;
    }

    println!("Object written to: {}", path.display());
    Ok(())
}

/// Select the compute backend named in the configuration.
pub fn create_backend(config: &ReconstructionConfig) -> Result<Arc<dyn ComputeBackend>> {
    let cpu = || match config.memory_budget_mib {
        Some(mib) => CpuBackend::with_memory_budget(mib * 1024 * 1024),
        None => CpuBackend::new(),
    };
    match config.backend.as_str() {
        "cpu" => {
            let backend = cpu();
            println!("Backend: {}", backend.device_info().name);
            Ok(Arc::new(backend))
        }
        "gpu" => Err(ComputeError::Unavailable(
            "GPU backend requested but this build provides only the CPU backend".into(),
        )
        .into()),
        "auto" => {
            let backend = cpu();
            println!("Backend: {} (auto-detected)", backend.device_info().name);
            Ok(Arc::new(backend))
        }
        other => bail!("Unknown backend '{}': expected \"auto\", \"cpu\" or \"gpu\"", other),
    }
}
