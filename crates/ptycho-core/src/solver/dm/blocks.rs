//! Block partitioning of the scan and per-block probe selection.
//!
//! Positions are processed in blocks so that peak memory (and device
//! residency) is bounded by the block size rather than the scan size. Each
//! block resolves once, per mode, which probe instances its positions use.

use ndarray::{s, Array2, Array3, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::measurement::DetectorRegion;
use crate::solver::SolverError;
use crate::types::{mode_at, mode_index, Reconstruction, OBJECT_ILLUMINATION_FRACTION};
use crate::views::ViewOperator;

/// A group of scan positions processed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Global scan-position indices.
    pub indices: Vec<usize>,
    /// Scan (probe group) identifier of each position.
    pub scan_ids: Vec<usize>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Probe instances used by the positions of one block for one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSelection {
    /// Every position in the block uses the same instance.
    SharedInstance(usize),
    /// Position `k` of the block uses instance `ids[k]`.
    PerGroupInstance(Vec<usize>),
}

impl ProbeSelection {
    /// Resolve the selection for `mode` of `block`.
    ///
    /// A shared probe, and every mode past the first, use instance 0. The
    /// first mode of a per-scan probe uses the block's scan id when the whole
    /// block belongs to one scan, otherwise one id per position.
    pub fn resolve(block: &Block, mode: usize, share_probe: bool) -> Self {
        if share_probe || mode > 0 {
            return ProbeSelection::SharedInstance(0);
        }
        match block.scan_ids.split_first() {
            Some((first, rest)) if rest.iter().all(|id| id == first) => {
                ProbeSelection::SharedInstance(*first)
            }
            _ => ProbeSelection::PerGroupInstance(block.scan_ids.clone()),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, ProbeSelection::SharedInstance(_))
    }

    /// Materialise the probe seen by each of the `n` positions, shaped
    /// (height, width, n).
    pub fn select(&self, probe: &Array3<Complex64>, n: usize) -> Array3<Complex64> {
        let (ny, nx, _) = probe.dim();
        match self {
            ProbeSelection::SharedInstance(i) => {
                let instance = probe.slice(s![.., .., *i..*i + 1]);
                let mut out = Array3::zeros((ny, nx, n));
                out.assign(&instance);
                out
            }
            ProbeSelection::PerGroupInstance(ids) => probe.select(Axis(2), ids),
        }
    }

    /// Highest probe instance this selection touches.
    fn max_instance(&self) -> usize {
        match self {
            ProbeSelection::SharedInstance(i) => *i,
            ProbeSelection::PerGroupInstance(ids) => ids.iter().copied().max().unwrap_or(0),
        }
    }
}

/// Precomputed block partition plus statistics derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCache {
    pub blocks: Vec<Block>,
    /// Per object mode, the largest summed probe intensity over the object
    /// frame; scales the object illumination floor.
    pub illumination_ceiling: Vec<f64>,
    /// Detector region for the Fourier error, whole detector when `None`.
    pub error_region: Option<DetectorRegion>,
}

impl BlockCache {
    /// Validate that `blocks` partition `0..n_positions`.
    pub fn new(blocks: Vec<Block>, n_positions: usize) -> Result<Self, SolverError> {
        let mut seen = vec![false; n_positions];
        for (b, block) in blocks.iter().enumerate() {
            if block.is_empty() {
                return Err(SolverError::InvalidBlocks(format!("Block {} is empty", b)));
            }
            if block.indices.len() != block.scan_ids.len() {
                return Err(SolverError::InvalidBlocks(format!(
                    "Block {} has {} positions but {} scan ids",
                    b,
                    block.indices.len(),
                    block.scan_ids.len()
                )));
            }
            for &p in &block.indices {
                match seen.get_mut(p) {
                    None => {
                        return Err(SolverError::InvalidBlocks(format!(
                            "Block {} references position {} of {}",
                            b, p, n_positions
                        )))
                    }
                    Some(true) => {
                        return Err(SolverError::InvalidBlocks(format!(
                            "Position {} appears in more than one block",
                            p
                        )))
                    }
                    Some(flag) => *flag = true,
                }
            }
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(SolverError::InvalidBlocks(format!(
                "Position {} is not assigned to any block",
                missing
            )));
        }
        Ok(Self {
            blocks,
            illumination_ceiling: Vec::new(),
            error_region: None,
        })
    }

    /// Split consecutive positions into blocks of at most `block_size`,
    /// never mixing scans within a block.
    pub fn from_scan_ids(scan_ids: &[usize], block_size: usize) -> Result<Self, SolverError> {
        if block_size == 0 {
            return Err(SolverError::InvalidBlocks("Block size must be positive".into()));
        }
        let mut blocks: Vec<Block> = Vec::new();
        for (p, &id) in scan_ids.iter().enumerate() {
            match blocks.last_mut() {
                Some(block) if block.len() < block_size && block.scan_ids[0] == id => {
                    block.indices.push(p);
                    block.scan_ids.push(id);
                }
                _ => blocks.push(Block {
                    indices: vec![p],
                    scan_ids: vec![id],
                }),
            }
        }
        Self::new(blocks, scan_ids.len())
    }

    pub fn with_error_region(mut self, region: DetectorRegion) -> Self {
        self.error_region = Some(region);
        self
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn n_positions(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    /// Probe selection of block `b` for each of `n_modes` modes.
    pub fn selections(&self, b: usize, n_modes: usize, share_probe: bool) -> Vec<ProbeSelection> {
        (0..n_modes)
            .map(|ll| ProbeSelection::resolve(&self.blocks[b], ll, share_probe))
            .collect()
    }

    /// Check that every selection stays inside the probe instance axis.
    pub fn check_probe_instances(
        &self,
        state: &Reconstruction,
        share_probe: bool,
    ) -> Result<(), SolverError> {
        for b in 0..self.len() {
            for (ll, selection) in self.selections(b, state.max_modes(), share_probe).iter().enumerate() {
                let available = mode_at(&state.probe, ll).dim().2;
                if selection.max_instance() >= available {
                    return Err(SolverError::InvalidBlocks(format!(
                        "Block {} selects probe instance {} of mode {}, which has {}",
                        b,
                        selection.max_instance(),
                        ll,
                        available
                    )));
                }
            }
        }
        Ok(())
    }

    /// Recompute the per-object-mode illumination ceiling from the current
    /// probe.
    pub fn refresh_illumination_ceiling(
        &mut self,
        state: &Reconstruction,
        views: &dyn ViewOperator,
        share_probe: bool,
    ) {
        let frame = state.object[0].dim();
        let mut illumination = vec![Array2::<f64>::zeros(frame); state.object_modes()];
        let mut scratch = Array2::<Complex64>::zeros(frame);
        for b in 0..self.len() {
            let block = &self.blocks[b];
            for (ll, selection) in self.selections(b, state.max_modes(), share_probe).iter().enumerate() {
                let probe = selection.select(mode_at(&state.probe, ll), block.len());
                let weights = probe.mapv(|z| z.norm_sqr());
                let target = mode_index(state.object_modes(), ll);
                views.scatter_add(
                    &mut scratch,
                    &mut illumination[target],
                    &Array3::zeros(probe.dim()),
                    &weights,
                    &block.indices,
                );
            }
        }
        self.illumination_ceiling = illumination
            .iter()
            .map(|i| i.iter().copied().fold(0.0, f64::max))
            .collect();
        log::debug!("Illumination ceiling per object mode: {:?}", self.illumination_ceiling);
    }

    /// Fail unless every object mode has a usable illumination ceiling.
    pub fn check_illumination_ceiling(&self, n_object_modes: usize) -> Result<(), SolverError> {
        if self.illumination_ceiling.len() < n_object_modes {
            return Err(SolverError::InvalidBlocks(format!(
                "Illumination ceiling covers {} of {} object modes; refresh it before updating the object",
                self.illumination_ceiling.len(),
                n_object_modes
            )));
        }
        match self.illumination_ceiling[..n_object_modes]
            .iter()
            .position(|&c| !(c.is_finite() && c > 0.0))
        {
            Some(k) => Err(SolverError::InvalidBlocks(format!(
                "Illumination ceiling of object mode {} is {}",
                k, self.illumination_ceiling[k]
            ))),
            None => Ok(()),
        }
    }

    /// Additive floor on the object illumination of `object_mode`.
    pub fn object_regularisation(&self, object_mode: usize) -> Result<f64, SolverError> {
        self.check_illumination_ceiling(object_mode + 1)?;
        Ok(self.illumination_ceiling[object_mode] * OBJECT_ILLUMINATION_FRACTION)
    }
}
