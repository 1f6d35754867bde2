//! Multi-chain SGHMC posterior over network parameters.
//!
//! A [`BayesNet`] combines the network architecture, the fixed embedding,
//! training data, a Gaussian likelihood and a prior. Every chain starts from
//! its own prior draw and runs SGHMC on the potential
//!
//! ```text
//! U(theta) = -(N / |batch|) sum_batch log p(y | f(x; theta)) - log p(theta)
//! ```
//!
//! for `num_burn_in_steps + (num_samples + n_discarded) * keep_every` steps,
//! taking a snapshot every `keep_every` steps. Chains own their seeds and
//! share nothing, so they fan out over a rayon pool and give the same result
//! as a sequential run.

use crate::config::{ActivationKind, ArchitectureConfig, SamplerKind, SamplingConfig};
use crate::context::progress_bar;
use crate::data::{GridAnchor, TrainingData};
use crate::embedding::RbfEmbedding;
use crate::error::{BnnError, Result};
use crate::likelihood::GaussianLikelihood;
use crate::net::{from_tensor2, scalar, to_tensor2, Net, ParamSnapshot};
use crate::prior::{GaussianParams, LocationPrior, Prior, PriorTensors};
use crate::sghmc::{AdaptiveSghmcConfig, SghmcConfig};
use crate::stats::{compute_rhat, RhatSummary};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{MultiProgress, ProgressBar};
use ndarray::{Array1, Array2, Array3, Axis};
use rand::rngs::SmallRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info};

/// Snapshots of one independent sampler run.
#[derive(Debug, Clone)]
pub struct Chain {
    pub id: usize,
    /// Snapshots taken during burn-in; kept for audit only.
    pub burn_in: Vec<ParamSnapshot>,
    /// Post-burn-in snapshots, the first `n_discarded` included.
    pub retained: Vec<ParamSnapshot>,
    /// Potential `U` at every snapshot, burn-in first.
    pub potentials: Vec<f64>,
    n_discarded: usize,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.burn_in.len() + self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained snapshots after dropping the first `n_discarded`.
    pub fn prediction_set(&self) -> &[ParamSnapshot] {
        &self.retained[self.n_discarded.min(self.retained.len())..]
    }

    /// Every snapshot in chain order.
    pub fn snapshots(&self) -> impl Iterator<Item = &ParamSnapshot> {
        self.burn_in.iter().chain(&self.retained)
    }

    /// First weight and first bias of every layer at every snapshot,
    /// `[len, 2 * n_layers]`, columns ordered `w0, b0, w1, b1, ...`.
    pub fn parameter_traces(&self) -> Array2<f64> {
        let n_layers = self.snapshots().next().map_or(0, |s| s.len());
        let mut out = Array2::<f64>::zeros((self.len(), 2 * n_layers));
        for (mut row, snap) in out.outer_iter_mut().zip(self.snapshots()) {
            for (l, layer) in snap.iter().enumerate() {
                row[2 * l] = layer.weight.iter().next().copied().unwrap_or(f64::NAN);
                row[2 * l + 1] = layer.bias.iter().next().copied().unwrap_or(f64::NAN);
            }
        }
        out
    }
}

/// Chains of one sampling run; the predictive ensemble is the concatenation
/// of their prediction sets in chain order.
#[derive(Debug, Clone, Default)]
pub struct Ensemble {
    chains: Vec<Chain>,
}

impl Ensemble {
    pub fn new(chains: Vec<Chain>) -> Self {
        Self { chains }
    }

    /// Concatenates the chains of several runs. Every chain stays a chain of
    /// its own, so R-hat on the pool compares all of them.
    pub fn pool<'a>(parts: impl IntoIterator<Item = &'a Ensemble>) -> Self {
        Self {
            chains: parts
                .into_iter()
                .flat_map(|e| e.chains.iter().cloned())
                .collect(),
        }
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    /// Size of the predictive ensemble.
    pub fn len(&self) -> usize {
        self.chains.iter().map(|c| c.prediction_set().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained snapshots over all chains, discarded ones included.
    pub fn retained_total(&self) -> usize {
        self.chains.iter().map(|c| c.retained.len()).sum()
    }

    pub fn members(&self) -> impl Iterator<Item = &ParamSnapshot> {
        self.chains.iter().flat_map(|c| c.prediction_set())
    }

    /// `[n_chains, len, 2 * n_layers]`; see [`Chain::parameter_traces`].
    pub fn parameter_traces(&self) -> Result<Array3<f64>> {
        let traces: Vec<Array2<f64>> = self.chains.iter().map(Chain::parameter_traces).collect();
        stack_equal(&traces)
    }
}

fn stack_equal(parts: &[Array2<f64>]) -> Result<Array3<f64>> {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| BnnError::Shape(e.to_string()))
}

/// Ensemble of one grid anchor in nonstationary mode.
#[derive(Debug, Clone)]
pub struct LocationEnsemble {
    pub anchor: GridAnchor,
    pub ensemble: Ensemble,
}

struct ChainTask<'a> {
    id: usize,
    prior: &'a GaussianParams,
    seed: u64,
    label: String,
}

pub struct BayesNet<B: AutodiffBackend> {
    activation: ActivationKind,
    layer_shapes: Vec<(usize, usize)>,
    embedding: RbfEmbedding,
    phi_train: Array2<f64>,
    y_train: Array1<f64>,
    likelihood: GaussianLikelihood,
    prior: GaussianParams,
    prior_name: &'static str,
    device: B::Device,
}

impl<B: AutodiffBackend> BayesNet<B> {
    pub fn new(
        arch: &ArchitectureConfig,
        embedding: RbfEmbedding,
        data: &TrainingData,
        likelihood: GaussianLikelihood,
        prior: &Prior,
        device: &B::Device,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(BnnError::config("sampling needs at least one observation"));
        }
        let layer_shapes = arch.layer_shapes();
        if layer_shapes[0].0 != embedding.width() {
            return Err(BnnError::Shape(format!(
                "first layer expects {} features, embedding has {}",
                layer_shapes[0].0,
                embedding.width()
            )));
        }
        Ok(Self {
            activation: arch.activation,
            prior: prior.params(&layer_shapes)?,
            prior_name: prior.name(),
            layer_shapes,
            phi_train: embedding.features(&data.x)?,
            y_train: data.y.clone(),
            embedding,
            likelihood,
            device: device.clone(),
        })
    }

    pub fn prior_name(&self) -> &'static str {
        self.prior_name
    }

    pub fn num_params(&self) -> usize {
        self.prior.num_params()
    }

    pub fn layer_shapes(&self) -> &[(usize, usize)] {
        &self.layer_shapes
    }

    /// Runs `num_chains` chains under the net's own prior. Chain `c` is
    /// seeded with `seed + c`.
    pub fn sample_multi_chains(&self, cfg: &SamplingConfig, seed: u64) -> Result<Ensemble> {
        info!(
            prior = self.prior_name,
            chains = cfg.num_chains,
            sampler = %cfg.sampler,
            "sampling posterior"
        );
        let tasks = (0..cfg.num_chains)
            .map(|c| ChainTask {
                id: c,
                prior: &self.prior,
                seed: seed.wrapping_add(c as u64),
                label: format!("Chain {c}"),
            })
            .collect();
        Ok(Ensemble::new(self.run_tasks(tasks, cfg)?))
    }

    /// One full multi-chain run per anchor, each under its own prior.
    /// Chain `c` of location `l` is seeded with `seed + l * num_chains + c`.
    pub fn sample_locations(
        &self,
        priors: &[LocationPrior],
        cfg: &SamplingConfig,
        seed: u64,
    ) -> Result<Vec<LocationEnsemble>> {
        let params = priors
            .iter()
            .map(|lp| lp.prior.params(&self.layer_shapes))
            .collect::<Result<Vec<_>>>()?;
        info!(
            locations = priors.len(),
            chains = cfg.num_chains,
            "sampling nonstationary posterior"
        );
        let tasks = params
            .iter()
            .enumerate()
            .flat_map(|(l, prior)| {
                (0..cfg.num_chains).map(move |c| ChainTask {
                    id: c,
                    prior,
                    seed: seed.wrapping_add((l * cfg.num_chains + c) as u64),
                    label: format!("L{l} C{c}"),
                })
            })
            .collect();
        let mut chains = self.run_tasks(tasks, cfg)?.into_iter();
        Ok(priors
            .iter()
            .map(|lp| LocationEnsemble {
                anchor: lp.anchor.clone(),
                ensemble: Ensemble::new(chains.by_ref().take(cfg.num_chains).collect()),
            })
            .collect())
    }

    fn run_tasks(&self, tasks: Vec<ChainTask<'_>>, cfg: &SamplingConfig) -> Result<Vec<Chain>> {
        let multi = MultiProgress::new();
        let run = |task: ChainTask<'_>| {
            let pb = multi.add(progress_bar(cfg.total_steps(), task.label));
            let chain = self.run_chain(task.id, task.prior, cfg, task.seed, &pb);
            pb.finish_with_message("Done!");
            chain
        };
        if cfg.parallel {
            tasks.into_par_iter().map(run).collect()
        } else {
            tasks.into_iter().map(run).collect()
        }
    }

    fn run_chain(
        &self,
        id: usize,
        prior: &GaussianParams,
        cfg: &SamplingConfig,
        seed: u64,
        pb: &ProgressBar,
    ) -> Result<Chain> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let init = prior.sample(&mut rng);
        let net = Net::<B>::from_values(&init, self.activation, &self.device)?;
        match cfg.sampler {
            SamplerKind::Sghmc => {
                let optim = SghmcConfig::new(cfg.mdecay)
                    .with_seed(seed)
                    .init::<B, Net<B>>();
                self.simulate(id, net, optim, prior, cfg, &mut rng, pb)
            }
            SamplerKind::AdaptiveSghmc => {
                let optim = AdaptiveSghmcConfig::new(cfg.mdecay, cfg.num_burn_in_steps)
                    .with_epsilon(cfg.epsilon)
                    .with_seed(seed)
                    .init::<B, Net<B>>();
                self.simulate(id, net, optim, prior, cfg, &mut rng, pb)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn simulate<O: Optimizer<Net<B>, B>>(
        &self,
        id: usize,
        mut net: Net<B>,
        mut optim: O,
        prior: &GaussianParams,
        cfg: &SamplingConfig,
        rng: &mut SmallRng,
        pb: &ProgressBar,
    ) -> Result<Chain> {
        let n = self.y_train.len();
        let batch = cfg.batch_size.min(n);
        let scale = n as f64 / batch as f64;
        let lr = cfg.effective_lr();
        let prior_t: PriorTensors<B> = prior.to_device(&self.device);

        let mut chain = Chain {
            id,
            burn_in: Vec::with_capacity(cfg.burn_in_snapshots()),
            retained: Vec::with_capacity(cfg.retained_per_chain()),
            potentials: Vec::new(),
            n_discarded: cfg.n_discarded,
        };

        for step in 1..=cfg.total_steps() {
            let idx = sample(rng, n, batch).into_vec();
            let x = to_tensor2::<B>(&self.phi_train.select(Axis(0), &idx), &self.device);
            let y_host = self.y_train.select(Axis(0), &idx).insert_axis(Axis(1));
            let y = to_tensor2::<B>(&y_host, &self.device);

            let log_lik = self.likelihood.log_lik(net.forward(x), y);
            let potential = log_lik.mul_scalar(-scale) - prior_t.log_prob(&net);
            let u =
                BnnError::ensure_finite(scalar(potential.clone())?, "sghmc", step, "potential")?;

            let grads = GradientsParams::from_grads(potential.backward(), &net);
            net = optim.step(lr, net, grads);
            pb.inc(1);

            if step % cfg.keep_every == 0 {
                let snap = net.snapshot()?;
                chain.potentials.push(u);
                if step <= cfg.num_burn_in_steps {
                    chain.burn_in.push(snap);
                } else {
                    chain.retained.push(snap);
                    let kept = chain.retained.len();
                    if cfg.print_every_n_samples > 0 && kept % cfg.print_every_n_samples == 0 {
                        debug!(chain = id, kept, potential = u, "sghmc");
                    }
                    pb.set_message(format!("U≈{u:.3e}"));
                }
            }
        }
        Ok(chain)
    }

    /// Outputs of every given snapshot at `x`, `[n_snapshots, x.nrows()]`.
    fn evaluate(&self, snapshots: &[&ParamSnapshot], x: &Array2<f64>) -> Result<Array2<f64>> {
        let device = &self.device;
        let phi = self.embedding.tensor::<B::InnerBackend>(x, device)?;
        let rows = snapshots
            .par_iter()
            .map(|snap| {
                let net = Net::<B::InnerBackend>::from_values(snap, self.activation, device)?;
                Ok(from_tensor2(net.forward(phi.clone()))?.column(0).to_owned())
            })
            .collect::<Result<Vec<Array1<f64>>>>()?;
        let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
        if views.is_empty() {
            return Ok(Array2::zeros((0, x.nrows())));
        }
        ndarray::stack(Axis(0), &views).map_err(|e| BnnError::Shape(e.to_string()))
    }

    /// Pooled predictive draws at `x`, `[ensemble.len(), x.nrows()]`, chain
    /// by chain.
    pub fn predict(&self, ensemble: &Ensemble, x: &Array2<f64>) -> Result<Array2<f64>> {
        let members: Vec<&ParamSnapshot> = ensemble.members().collect();
        self.evaluate(&members, x)
    }

    /// Predictions of every snapshot, burn-in and discarded ones included,
    /// `[n_chains, chain length, x.nrows()]`.
    pub fn predict_all(&self, ensemble: &Ensemble, x: &Array2<f64>) -> Result<Array3<f64>> {
        let per_chain = ensemble
            .chains()
            .iter()
            .map(|c| self.evaluate(&c.snapshots().collect::<Vec<_>>(), x))
            .collect::<Result<Vec<_>>>()?;
        stack_equal(&per_chain)
    }

    /// R-hat of the predictive draws at every point of `x`.
    pub fn rhat_values(&self, ensemble: &Ensemble, x: &Array2<f64>) -> Result<Array1<f64>> {
        let preds = self.predict(ensemble, x)?;
        compute_rhat(&preds, ensemble.num_chains())
    }

    pub fn rhat(&self, ensemble: &Ensemble, x: &Array2<f64>) -> Result<RhatSummary> {
        RhatSummary::from_values(&self.rhat_values(ensemble, x)?)
    }
}
