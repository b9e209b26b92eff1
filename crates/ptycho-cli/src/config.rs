//! TOML configuration deserialisation for reconstruction jobs.

use anyhow::{ensure, Context};
use serde::Deserialize;

use ptycho_core::measurement::{DetectorRegion, FourierErrorMetric};
use ptycho_core::synthetic::SyntheticSpec;
use ptycho_core::types::{DmParams, ErrorCadence};

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,
    /// Simulated experiment providing the diffraction data.
    #[serde(default)]
    pub experiment: SyntheticSpec,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Reconstruction parameters from TOML.
#[derive(Debug, Deserialize)]
pub struct ReconstructionConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Maximum number of scan positions per block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Compute backend: "auto", "cpu", or "gpu". Default: "auto".
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Cap on device-resident exit-wave memory, in MiB.
    #[serde(default)]
    pub memory_budget_mib: Option<usize>,
    #[serde(default = "default_true")]
    pub share_probe: bool,
    #[serde(default = "default_pfft_relaxation")]
    pub pfft_relaxation: f64,
    #[serde(default = "default_probe_inertia")]
    pub probe_inertia: f64,
    #[serde(default = "default_object_inertia")]
    pub object_inertia: f64,
    #[serde(default = "default_change_start")]
    pub probe_change_start: usize,
    #[serde(default = "default_change_start")]
    pub object_change_start: usize,
    #[serde(default)]
    pub keep_on_device: bool,
    #[serde(default)]
    pub check_first_repetition: bool,
    /// Evaluate the Fourier error every n iterations instead of on the
    /// logarithmic schedule.
    #[serde(default)]
    pub error_every: Option<usize>,
    #[serde(default)]
    pub error_metric: FourierErrorMetric,
    /// Restrict the Fourier error to a detector region.
    #[serde(default)]
    pub error_region: Option<DetectorRegion>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            block_size: default_block_size(),
            backend: default_backend(),
            memory_budget_mib: None,
            share_probe: true,
            pfft_relaxation: default_pfft_relaxation(),
            probe_inertia: default_probe_inertia(),
            object_inertia: default_object_inertia(),
            probe_change_start: default_change_start(),
            object_change_start: default_change_start(),
            keep_on_device: false,
            check_first_repetition: false,
            error_every: None,
            error_metric: FourierErrorMetric::default(),
            error_region: None,
        }
    }
}

impl ReconstructionConfig {
    /// Engine parameters for this job.
    pub fn to_params(&self) -> DmParams {
        DmParams {
            share_probe: self.share_probe,
            pfft_relaxation: self.pfft_relaxation,
            probe_inertia: self.probe_inertia,
            object_inertia: self.object_inertia,
            probe_change_start: self.probe_change_start,
            object_change_start: self.object_change_start,
            keep_on_device: self.keep_on_device,
            check_first_repetition: self.check_first_repetition,
            error_cadence: match self.error_every {
                Some(n) => ErrorCadence::Every(n),
                None => ErrorCadence::Logarithmic,
            },
            error_metric: self.error_metric,
            number_iterations: self.iterations,
        }
    }
}

fn default_iterations() -> usize {
    100
}
fn default_block_size() -> usize {
    16
}
fn default_backend() -> String {
    "auto".into()
}
fn default_pfft_relaxation() -> f64 {
    0.05
}
fn default_probe_inertia() -> f64 {
    0.3
}
fn default_object_inertia() -> f64 {
    0.1
}
fn default_change_start() -> usize {
    1
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Whether to save the Fourier error history as CSV (default: true).
    #[serde(default = "default_true")]
    pub save_errors: bool,
    /// Whether to save per-iteration reports as JSON (default: false).
    #[serde(default)]
    pub save_json: bool,
    /// Whether to save the reconstructed object as CSV (default: false).
    #[serde(default)]
    pub save_object: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            save_errors: true,
            save_json: false,
            save_object: false,
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}
fn default_true() -> bool {
    true
}

impl JobConfig {
    /// Reject parameter combinations the engine cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        let r = &self.reconstruction;
        ensure!(r.iterations > 0, "reconstruction.iterations must be positive");
        ensure!(r.block_size > 0, "reconstruction.block_size must be positive");
        for (name, value) in [
            ("pfft_relaxation", r.pfft_relaxation),
            ("probe_inertia", r.probe_inertia),
            ("object_inertia", r.object_inertia),
        ] {
            ensure!(
                (0.0..=1.0).contains(&value),
                "reconstruction.{} must lie in [0, 1], got {}",
                name,
                value
            );
        }
        ensure!(
            r.error_every != Some(0),
            "reconstruction.error_every must be positive"
        );
        let e = &self.experiment;
        ensure!(
            e.probe_size > 0 && e.probe_size <= e.object_size,
            "experiment.probe_size must be positive and fit inside object_size"
        );
        ensure!(
            e.scan_rows > 0 && e.scan_cols > 0,
            "experiment needs at least one scan row and column"
        );
        Ok(())
    }
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<JobConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: JobConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptycho_core::types::PropagationModel;

    #[test]
    fn test_empty_file_uses_defaults() {
        let job: JobConfig = toml::from_str("").unwrap();
        assert_eq!(job.reconstruction.iterations, 100);
        assert_eq!(job.output.directory, "./output");
        assert!(job.output.save_errors);
        assert_eq!(job.experiment, SyntheticSpec::default());
        let params = job.reconstruction.to_params();
        assert_eq!(params.error_cadence, ErrorCadence::Logarithmic);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_full_job_parses() {
        let job: JobConfig = toml::from_str(
            r#"
            [reconstruction]
            iterations = 40
            block_size = 8
            backend = "cpu"
            share_probe = false
            probe_inertia = 0.5
            error_every = 5
            error_metric = "L2"
            error_region = { row_start = 0, row_end = 8, col_start = 0, col_end = 8 }

            [experiment]
            object_size = 64
            probe_size = 16
            n_scans = 2
            propagation = { near_field = { fresnel_factor = 4.0 } }

            [output]
            directory = "out"
            save_json = true
            "#,
        )
        .unwrap();
        let params = job.reconstruction.to_params();
        assert_eq!(params.number_iterations, 40);
        assert!(!params.share_probe);
        assert_eq!(params.error_cadence, ErrorCadence::Every(5));
        assert_eq!(params.error_metric, FourierErrorMetric::L2);
        assert_eq!(
            job.experiment.propagation,
            PropagationModel::NearField { fresnel_factor: 4.0 }
        );
        assert_eq!(job.experiment.n_scans, 2);
        assert!(job.output.save_json);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_inertia_is_rejected() {
        let job: JobConfig = toml::from_str("[reconstruction]\nobject_inertia = 1.5\n").unwrap();
        assert!(job.validate().is_err());
    }
}
