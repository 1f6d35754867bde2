//! Configuration surface of the experiment.
//!
//! Every struct deserialises from JSON with `#[serde(default)]`, so a config
//! file only needs to name the options it changes. Defaults reproduce the
//! reference SST experiment. Option names that select behaviour (sampler,
//! activation, kernel) are parsed into enums and rejected with
//! [`BnnError::Configuration`] when unsupported.

use crate::error::{BnnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Step-size policy of the posterior sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SamplerKind {
    /// Plain SGHMC with a fixed learning rate.
    Sghmc,
    /// SGHMC with burn-in adaptation of the preconditioner and noise.
    AdaptiveSghmc,
}

impl SamplerKind {
    /// Learning rate used when the config leaves `lr` unset. The adaptive
    /// variant squares its rate internally, hence the square root.
    pub fn default_lr(self) -> f64 {
        match self {
            SamplerKind::Sghmc => 1e-4,
            SamplerKind::AdaptiveSghmc => 1e-4_f64.sqrt(),
        }
    }
}

impl FromStr for SamplerKind {
    type Err = BnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sghmc" => Ok(SamplerKind::Sghmc),
            "adaptive_sghmc" => Ok(SamplerKind::AdaptiveSghmc),
            other => Err(BnnError::config(format!(
                "unsupported sampler `{other}`: only `sghmc` and `adaptive_sghmc` are supported"
            ))),
        }
    }
}

impl TryFrom<String> for SamplerKind {
    type Error = BnnError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SamplerKind> for String {
    fn from(value: SamplerKind) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerKind::Sghmc => write!(f, "sghmc"),
            SamplerKind::AdaptiveSghmc => write!(f, "adaptive_sghmc"),
        }
    }
}

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActivationKind {
    Tanh,
    Relu,
    Softplus,
    Sigmoid,
}

impl FromStr for ActivationKind {
    type Err = BnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tanh" => Ok(ActivationKind::Tanh),
            "relu" => Ok(ActivationKind::Relu),
            "softplus" => Ok(ActivationKind::Softplus),
            "sigmoid" => Ok(ActivationKind::Sigmoid),
            other => Err(BnnError::config(format!("unsupported activation `{other}`"))),
        }
    }
}

impl TryFrom<String> for ActivationKind {
    type Error = BnnError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ActivationKind> for String {
    fn from(value: ActivationKind) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivationKind::Tanh => "tanh",
            ActivationKind::Relu => "relu",
            ActivationKind::Softplus => "softplus",
            ActivationKind::Sigmoid => "sigmoid",
        };
        write!(f, "{name}")
    }
}

/// Covariance function of the GP baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KernelKind {
    Matern32,
    Rbf,
}

impl FromStr for KernelKind {
    type Err = BnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "matern32" => Ok(KernelKind::Matern32),
            "rbf" => Ok(KernelKind::Rbf),
            other => Err(BnnError::config(format!("unsupported kernel `{other}`"))),
        }
    }
}

impl TryFrom<String> for KernelKind {
    type Error = BnnError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KernelKind> for String {
    fn from(value: KernelKind) -> Self {
        match value {
            KernelKind::Matern32 => "matern32".into(),
            KernelKind::Rbf => "rbf".into(),
        }
    }
}

/// Shape of the networks. `hidden_dims[0]` is the width of the fixed RBF
/// embedding; the parametric stack has one dense layer per entry, the last
/// one mapping to the scalar output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectureConfig {
    pub input_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub activation: ActivationKind,
    pub embedding_lengthscale: f64,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        let mut hidden_dims = vec![81];
        hidden_dims.extend(std::iter::repeat(40).take(10));
        Self {
            input_dim: 2,
            hidden_dims,
            activation: ActivationKind::Tanh,
            embedding_lengthscale: 0.14,
        }
    }
}

impl ArchitectureConfig {
    pub fn embed_width(&self) -> usize {
        self.hidden_dims.first().copied().unwrap_or(0)
    }

    /// `(fan_in, fan_out)` of every dense layer after the embedding.
    pub fn layer_shapes(&self) -> Vec<(usize, usize)> {
        let mut dims = self.hidden_dims.clone();
        dims.push(1);
        dims.windows(2).map(|w| (w[0], w[1])).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub num_iters: usize,
    /// Function draws per outer iteration from both the target and the net.
    pub n_samples: usize,
    /// Measurement-set size; must be a perfect `input_dim`-th power.
    pub n_measure: usize,
    pub outer_lr: f64,
    pub inner_lr: f64,
    pub inner_steps: usize,
    pub starting_steps: usize,
    pub starting_lr: f64,
    pub penalty_coeff: f64,
    pub critic_hidden: Vec<usize>,
    pub checkpoint_every: usize,
    pub print_every: usize,
    pub nonstationary: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            num_iters: 1000,
            n_samples: 64,
            n_measure: 64 * 64,
            outer_lr: 0.002,
            inner_lr: 0.01,
            inner_steps: 20,
            starting_steps: 1000,
            starting_lr: 0.0003,
            penalty_coeff: 10.0,
            critic_hidden: vec![200, 200],
            checkpoint_every: 50,
            print_every: 10,
            nonstationary: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub sampler: SamplerKind,
    pub lr: Option<f64>,
    pub batch_size: usize,
    /// Samples per chain used for prediction, counted after the first
    /// `n_discarded` post-burn-in snapshots are dropped; a chain keeps
    /// `num_samples + n_discarded` snapshots past burn-in.
    pub num_samples: usize,
    /// Post-burn-in samples dropped per chain before prediction.
    pub n_discarded: usize,
    pub num_burn_in_steps: usize,
    pub keep_every: usize,
    pub mdecay: f64,
    pub num_chains: usize,
    pub print_every_n_samples: usize,
    pub epsilon: f64,
    pub parallel: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        let num_burn_in_steps = 3000;
        let keep_every = 500;
        Self {
            sampler: SamplerKind::AdaptiveSghmc,
            lr: None,
            batch_size: 32,
            num_samples: 200,
            n_discarded: 100 - num_burn_in_steps / keep_every,
            num_burn_in_steps,
            keep_every,
            mdecay: 0.05,
            num_chains: 4,
            print_every_n_samples: 50,
            epsilon: 1e-16,
            parallel: true,
        }
    }
}

impl SamplingConfig {
    pub fn effective_lr(&self) -> f64 {
        self.lr.unwrap_or_else(|| self.sampler.default_lr())
    }

    pub fn burn_in_snapshots(&self) -> usize {
        self.num_burn_in_steps / self.keep_every
    }

    /// Snapshots kept after burn-in, including the ones later discarded.
    pub fn retained_per_chain(&self) -> usize {
        self.num_samples + self.n_discarded
    }

    pub fn total_steps(&self) -> usize {
        self.num_burn_in_steps + self.retained_per_chain() * self.keep_every
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedPriorConfig {
    pub mean: f64,
    pub std: f64,
}

impl Default for FixedPriorConfig {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub grid_width: usize,
    pub grid_height: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_width: 3,
            grid_height: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpConfig {
    pub kernel: KernelKind,
    pub ampl: f64,
    pub leng: f64,
    pub noise_var: f64,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            kernel: KernelKind::Matern32,
            ampl: 10.0,
            leng: 0.1,
            noise_var: 0.001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub n_train: usize,
    /// CSV bank of flattened fields on the test grid, one field per row.
    pub fields_path: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            n_train: 100 * 12,
            fields_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub coverage_percent: f64,
    pub score_alpha: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            coverage_percent: 90.0,
            score_alpha: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub seed: u64,
    /// Points per axis of the regular test grid on the unit square.
    pub n_test: usize,
    pub architecture: ArchitectureConfig,
    pub mapper: MapperConfig,
    pub sampling: SamplingConfig,
    pub fixed_prior: FixedPriorConfig,
    pub nonstationary_grid: GridConfig,
    pub gp: GpConfig,
    pub data: DataConfig,
    pub metrics: MetricsConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            n_test: 64,
            architecture: ArchitectureConfig::default(),
            mapper: MapperConfig::default(),
            sampling: SamplingConfig::default(),
            fixed_prior: FixedPriorConfig::default(),
            nonstationary_grid: GridConfig::default(),
            gp: GpConfig::default(),
            data: DataConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Reads and validates a JSON config. Malformed values surface as
    /// configuration errors, unreadable files as I/O errors.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| BnnError::io(path, e))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let cfg: ExperimentConfig = serde_json::from_str(text)
            .map_err(|e| BnnError::config(format!("malformed configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let arch = &self.architecture;
        if arch.input_dim == 0 {
            return Err(BnnError::config("input_dim must be positive"));
        }
        if arch.hidden_dims.is_empty() || arch.hidden_dims.contains(&0) {
            return Err(BnnError::config("hidden_dims must be non-empty and positive"));
        }
        if integer_root(arch.embed_width(), arch.input_dim).is_none() {
            return Err(BnnError::config(format!(
                "embedding width {} is not a perfect power of input_dim {}",
                arch.embed_width(),
                arch.input_dim
            )));
        }
        positive("embedding_lengthscale", arch.embedding_lengthscale)?;

        let m = &self.mapper;
        if integer_root(m.n_measure, arch.input_dim).is_none() {
            return Err(BnnError::config(format!(
                "n_measure {} is not a perfect power of input_dim {}",
                m.n_measure, arch.input_dim
            )));
        }
        if m.num_iters == 0 {
            return Err(BnnError::config("mapper num_iters must be positive"));
        }
        if m.n_samples < 2 {
            return Err(BnnError::config("mapper n_samples must be at least 2"));
        }
        if m.checkpoint_every == 0 {
            return Err(BnnError::config("checkpoint_every must be positive"));
        }
        positive("outer_lr", m.outer_lr)?;
        positive("inner_lr", m.inner_lr)?;
        positive("starting_lr", m.starting_lr)?;
        if m.penalty_coeff < 0.0 {
            return Err(BnnError::config("penalty_coeff must be non-negative"));
        }

        let s = &self.sampling;
        if s.keep_every == 0 {
            return Err(BnnError::config("keep_every must be positive"));
        }
        if s.num_burn_in_steps % s.keep_every != 0 {
            return Err(BnnError::config(format!(
                "num_burn_in_steps ({}) must be a multiple of keep_every ({})",
                s.num_burn_in_steps, s.keep_every
            )));
        }
        if s.batch_size == 0 || s.num_chains == 0 || s.num_samples == 0 {
            return Err(BnnError::config(
                "batch_size, num_chains and num_samples must be positive",
            ));
        }
        positive("sampler lr", s.effective_lr())?;
        if !(0.0..1.0).contains(&s.mdecay) {
            return Err(BnnError::config("mdecay must lie in [0, 1)"));
        }

        positive("fixed prior std", self.fixed_prior.std)?;
        positive("gp ampl", self.gp.ampl)?;
        positive("gp leng", self.gp.leng)?;
        positive("gp noise_var", self.gp.noise_var)?;

        if self.nonstationary_grid.grid_width == 0 || self.nonstationary_grid.grid_height == 0 {
            return Err(BnnError::config("nonstationary grid must be non-empty"));
        }
        if !(self.metrics.coverage_percent > 0.0 && self.metrics.coverage_percent < 100.0) {
            return Err(BnnError::config("coverage_percent must lie in (0, 100)"));
        }
        if !(self.metrics.score_alpha > 0.0 && self.metrics.score_alpha < 1.0) {
            return Err(BnnError::config("score_alpha must lie in (0, 1)"));
        }
        if self.n_test < 4 {
            return Err(BnnError::config("n_test must be at least 4"));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(BnnError::config(format!("{name} must be positive, got {value}")))
    }
}

/// Returns `r` with `r^dim == n`, if it exists.
pub(crate) fn integer_root(n: usize, dim: usize) -> Option<usize> {
    if n == 0 || dim == 0 {
        return None;
    }
    let guess = (n as f64).powf(1.0 / dim as f64).round() as usize;
    (guess.saturating_sub(1)..=guess + 1)
        .find(|&r| r > 0 && r.checked_pow(dim as u32) == Some(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ExperimentConfig::default().validate().unwrap();
    }

    #[test]
    fn default_discard_mirrors_reference_run() {
        let s = SamplingConfig::default();
        assert_eq!(s.burn_in_snapshots(), 6);
        assert_eq!(s.n_discarded, 94);
        assert_eq!(s.retained_per_chain(), 294);
    }

    #[test]
    fn unsupported_sampler_is_a_configuration_error() {
        let err = ExperimentConfig::from_json_str(r#"{"sampling": {"sampler": "nuts"}}"#)
            .unwrap_err();
        assert!(matches!(err, BnnError::Configuration(_)));
        assert!(err.to_string().contains("nuts"));
    }

    #[test]
    fn sampler_names_round_trip_through_json() {
        let cfg =
            ExperimentConfig::from_json_str(r#"{"sampling": {"sampler": "sghmc"}}"#).unwrap();
        assert_eq!(cfg.sampling.sampler, SamplerKind::Sghmc);
        assert_eq!(cfg.sampling.effective_lr(), 1e-4);
        let text = serde_json::to_string(&cfg.sampling).unwrap();
        assert!(text.contains("\"sghmc\""));
    }

    #[test]
    fn adaptive_default_lr_is_square_root() {
        assert!((SamplerKind::AdaptiveSghmc.default_lr() - 1e-2).abs() < 1e-12);
    }

    #[test]
    fn burn_in_must_be_multiple_of_keep_every() {
        let mut cfg = ExperimentConfig::default();
        cfg.sampling.num_burn_in_steps = 1001;
        assert!(matches!(cfg.validate(), Err(BnnError::Configuration(_))));
    }

    #[test]
    fn embedding_width_must_form_a_grid() {
        let mut cfg = ExperimentConfig::default();
        cfg.architecture.hidden_dims = vec![80, 40];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn layer_shapes_end_in_scalar_output() {
        let arch = ArchitectureConfig {
            hidden_dims: vec![9, 5, 4],
            ..ArchitectureConfig::default()
        };
        assert_eq!(arch.layer_shapes(), vec![(9, 5), (5, 4), (4, 1)]);
    }

    #[test]
    fn integer_roots() {
        assert_eq!(integer_root(4096, 2), Some(64));
        assert_eq!(integer_root(81, 2), Some(9));
        assert_eq!(integer_root(27, 3), Some(3));
        assert_eq!(integer_root(80, 2), None);
    }
}
