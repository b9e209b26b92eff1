//! Persistent exit-wave state and the Difference-Map real-space formulas.
//!
//! The Difference Map iterates on `ψ_dash`, one field per (mode, block).
//! Each outer pass forms the current exit wave `ψ = O·P`, extrapolates
//!
//! $$\Psi = (1 + \gamma)\psi - \gamma\psi'$$
//!
//! propagates and constrains `Ψ`, and then applies the difference step
//!
//! $$\psi' \leftarrow \psi' + \beta(\Psi_{\text{back}} - \psi).$$

use ndarray::{Array3, Zip};
use num_complex::Complex64;
use ptycho_compute::ComputeBackend;

use crate::solver::SolverError;

/// One (mode, block) cell of the exit-wave state.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ExitWave {
    /// No estimate yet; the next projection bootstraps it.
    #[default]
    Uninitialized,
    /// Current estimate, shaped (height, width, positions in block).
    Field(Array3<Complex64>),
}

/// The `ψ_dash` matrix, indexed by (mode, block).
#[derive(Debug, Clone, Default)]
pub struct ExitWaveState {
    cells: Vec<Vec<ExitWave>>,
}

impl ExitWaveState {
    /// An all-uninitialized state for `n_modes` × `n_blocks` cells.
    pub fn new(n_modes: usize, n_blocks: usize) -> Self {
        Self {
            cells: vec![vec![ExitWave::Uninitialized; n_blocks]; n_modes],
        }
    }

    pub fn n_modes(&self) -> usize {
        self.cells.len()
    }

    pub fn n_blocks(&self) -> usize {
        self.cells.first().map_or(0, Vec::len)
    }

    /// Reset every cell to `Uninitialized`.
    pub fn clear(&mut self) {
        self.cells
            .iter_mut()
            .flatten()
            .for_each(|cell| *cell = ExitWave::Uninitialized);
    }

    /// True when no cell holds a field.
    pub fn is_empty(&self) -> bool {
        self.cells
            .iter()
            .flatten()
            .all(|cell| matches!(cell, ExitWave::Uninitialized))
    }

    pub fn cell(&self, mode: usize, block: usize) -> &ExitWave {
        &self.cells[mode][block]
    }

    /// The stored field of a cell, if any.
    pub fn field(&self, mode: usize, block: usize) -> Option<&Array3<Complex64>> {
        match &self.cells[mode][block] {
            ExitWave::Field(field) => Some(field),
            ExitWave::Uninitialized => None,
        }
    }

    pub fn store(&mut self, mode: usize, block: usize, field: Array3<Complex64>) {
        self.cells[mode][block] = ExitWave::Field(field);
    }

    /// Grow the matrix to at least `n_modes` × `n_blocks` cells.
    pub fn ensure_shape(&mut self, n_modes: usize, n_blocks: usize) {
        if self.cells.len() < n_modes {
            self.cells.resize(n_modes, Vec::new());
        }
        for row in &mut self.cells {
            if row.len() < n_blocks {
                row.resize(n_blocks, ExitWave::Uninitialized);
            }
        }
    }
}

/// Current exit wave `ψ = O_view · P`.
pub fn form_exit_wave(
    object_views: &Array3<Complex64>,
    probe: &Array3<Complex64>,
) -> Array3<Complex64> {
    Zip::from(object_views)
        .and(probe)
        .map_collect(|&o, &p| o * p)
}

/// Extrapolated point `Ψ = (1+γ)ψ − γ·ψ_dash`.
pub fn extrapolate(
    psi: &Array3<Complex64>,
    psi_dash: &Array3<Complex64>,
    gamma: f64,
    backend: &dyn ComputeBackend,
) -> Result<Array3<Complex64>, SolverError> {
    let mut out = psi.clone();
    backend.zip_map_inplace(
        out.view_mut().into_dyn(),
        psi_dash.view().into_dyn(),
        &move |p, d| p * (1.0 + gamma) - d * gamma,
    )?;
    Ok(out)
}

/// Difference step `ψ_dash ← ψ_dash + β(ψ_back − ψ)`.
pub fn difference_update(
    psi_dash: &mut Array3<Complex64>,
    psi_back: &Array3<Complex64>,
    psi: &Array3<Complex64>,
    beta: f64,
    backend: &dyn ComputeBackend,
) -> Result<(), SolverError> {
    let mut step = psi_back.clone();
    backend.zip_map_inplace(step.view_mut().into_dyn(), psi.view().into_dyn(), &|b, p| b - p)?;
    backend.zip_map_inplace(
        psi_dash.view_mut().into_dyn(),
        step.view().into_dyn(),
        &move |d, s| d + s * beta,
    )?;
    Ok(())
}
