//! Wasserstein prior matching.
//!
//! The mapper adjusts a [`GaussianNet`] so that the functions it draws on a
//! measurement grid become indistinguishable, in 1-Wasserstein distance, from
//! draws of a target [`FunctionPrior`]. The distance is estimated in its dual
//! form by a [`Critic`] trained under a soft unit-gradient penalty; every
//! outer iteration trains the critic for a few steps and then takes one
//! RMSprop step on the generator against it.
//!
//! Progress survives interruption. Generator parameters are checkpointed to
//! `ckpts/it-<iteration>.ckpt` and the distance history to `wsr_values.log`;
//! [`ResumeState::detect`] decides on start-up whether the run is already
//! complete, can resume from a checkpoint, or has to start fresh.

use crate::config::MapperConfig;
use crate::context::progress_bar;
use crate::data::GridGenerator;
use crate::embedding::RbfEmbedding;
use crate::error::{BnnError, Result};
use crate::gaussian_net::GaussianNet;
use crate::gp::FunctionPrior;
use crate::io::csv::write_records;
use crate::io::{read_values_log, write_values_log};
use crate::net::{scalar, standard_uniform, to_tensor2, DenseLayer, LayerValues};
use burn::optim::{AdamConfig, GradientsParams, Optimizer, RmsPropConfig};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softplus};
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array1, Array2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOG_FILE: &str = "wsr_values.log";
pub const CHECKPOINT_DIR: &str = "ckpts";

const NORM_EPS: f64 = 1e-12;

pub fn checkpoint_name(iteration: usize) -> String {
    format!("it-{iteration}.ckpt")
}

fn parse_checkpoint_name(name: &str) -> Option<usize> {
    name.strip_prefix("it-")?.strip_suffix(".ckpt")?.parse().ok()
}

/// Scalar critic `f: R^n -> R`, a softplus MLP.
#[derive(Module, Debug)]
pub struct Critic<B: Backend> {
    layers: Vec<DenseLayer<B>>,
}

impl<B: Backend> Critic<B> {
    /// Critic over `input_dim`-dimensional inputs. Weights start uniform in
    /// `[-1, 1]` (the layers rescale by `1/sqrt(fan_in)`), biases uniform in
    /// `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    pub fn new(input_dim: usize, hidden: &[usize], rng: &mut impl Rng, device: &B::Device) -> Self {
        let mut dims = vec![input_dim];
        dims.extend_from_slice(hidden);
        dims.push(1);
        let layers = dims
            .windows(2)
            .map(|w| {
                let bound = 1.0 / (w[0] as f64).sqrt();
                let values = LayerValues {
                    weight: Array2::from_shape_fn((w[0], w[1]), |_| rng.gen_range(-1.0..1.0)),
                    bias: Array1::from_shape_fn(w[1], |_| rng.gen_range(-bound..bound)),
                };
                DenseLayer::from_values(&values, device)
            })
            .collect();
        Self { layers }
    }

    /// Critic values `[n_draws, 1]` for inputs `[n_draws, n]`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward_with_input_grad(x).0
    }

    /// Critic values together with `df/dx` per row, `[n_draws, n]`.
    ///
    /// The input gradient is assembled from the layer weights and the
    /// softplus derivatives inside the graph, so penalising its norm and
    /// calling `backward` once yields parameter gradients of the penalty.
    pub fn forward_with_input_grad(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let last = self.layers.len() - 1;
        let mut pre = Vec::with_capacity(last);
        let mut h = x;
        for layer in &self.layers[..last] {
            let z = layer.forward(h);
            h = softplus(z.clone(), 1.0);
            pre.push(z);
        }
        let out = self.layers[last].forward(h);

        let [n_draws, _] = out.dims();
        let mut g = Tensor::<B, 2>::ones([n_draws, 1], &out.device());
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let scale = 1.0 / (layer.fan_in() as f64).sqrt();
            g = g.matmul(layer.weight.val().transpose()).mul_scalar(scale);
            if i > 0 {
                g = g * sigmoid(pre[i - 1].clone());
            }
        }
        (out, g)
    }
}

impl<B: AutodiffBackend> Critic<B> {
    /// Pairs the critic with the Adam optimiser that trains it. Optimiser
    /// state persists across calls to [`CriticTrainer::train`].
    pub fn trainer(self, penalty_coeff: f64) -> CriticTrainer<B, impl Optimizer<Critic<B>, B>> {
        CriticTrainer {
            critic: self,
            optim: AdamConfig::new().init::<B, Critic<B>>(),
            penalty_coeff,
        }
    }
}

/// One inner (critic) step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LipschitzRecord {
    pub outer: usize,
    pub inner: usize,
    /// Mean input-gradient norm on the penalty interpolates.
    pub grad_norm: f64,
    pub loss: f64,
}

/// Generator gradient norm of one outer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParamGradRecord {
    pub outer: usize,
    pub norm: f64,
}

pub struct CriticTrainer<B: AutodiffBackend, O> {
    critic: Critic<B>,
    optim: O,
    penalty_coeff: f64,
}

impl<B: AutodiffBackend, O: Optimizer<Critic<B>, B>> CriticTrainer<B, O> {
    pub fn critic(&self) -> &Critic<B> {
        &self.critic
    }

    /// One Adam step on `-(E f(p) - E f(q)) + penalty_coeff * E[(|df(x)| - 1)^2]`,
    /// `x` drawn uniformly on the segments between paired rows of `p` and
    /// `q`. Returns the loss and the mean gradient norm.
    fn step(
        &mut self,
        p: &Tensor<B, 2>,
        q: &Tensor<B, 2>,
        lr: f64,
        rng: &mut SmallRng,
        outer: usize,
    ) -> Result<(f64, f64)> {
        let [n_draws, _] = p.dims();
        let e = standard_uniform::<B, 2>(rng, [n_draws, 1], &p.device());
        let x_hat = p.clone() * e.clone() + q.clone() * e.neg().add_scalar(1.0);
        let (_, input_grad) = self.critic.forward_with_input_grad(x_hat);
        let norms = input_grad
            .powf_scalar(2.0)
            .sum_dim(1)
            .add_scalar(NORM_EPS)
            .sqrt();
        let penalty = norms.clone().sub_scalar(1.0).powf_scalar(2.0).mean();
        let objective =
            self.critic.forward(p.clone()).mean() - self.critic.forward(q.clone()).mean();
        let loss = objective.neg() + penalty.mul_scalar(self.penalty_coeff);

        let loss_value = BnnError::ensure_finite(scalar(loss.clone())?, "critic", outer, "loss")?;
        let grad_norm = scalar(norms.mean())?;

        let grads = GradientsParams::from_grads(loss.backward(), &self.critic);
        let critic = self.critic.clone();
        self.critic = self.optim.step(lr, critic, grads);
        Ok((loss_value, grad_norm))
    }

    /// Trains the critic for `steps` steps on the samples `p` (target) and
    /// `q` (generator), which are treated as constants.
    pub fn train(
        &mut self,
        p: &Tensor<B, 2>,
        q: &Tensor<B, 2>,
        steps: usize,
        lr: f64,
        rng: &mut SmallRng,
        outer: usize,
    ) -> Result<Vec<LipschitzRecord>> {
        (1..=steps)
            .map(|inner| {
                let (loss, grad_norm) = self.step(p, q, lr, rng, outer)?;
                Ok(LipschitzRecord {
                    outer,
                    inner,
                    grad_norm,
                    loss,
                })
            })
            .collect()
    }

    /// Dual estimate `E f(p) - E f(q)` with the current critic.
    pub fn distance(&self, p: Tensor<B, 2>, q: Tensor<B, 2>) -> Result<f64> {
        let critic = self.critic.clone().no_grad();
        scalar(critic.forward(p).mean() - critic.forward(q).mean())
    }
}

/// Where a mapper run stands before it starts.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeState {
    /// Final checkpoint and a full history exist; nothing left to do.
    Completed(Vec<f64>),
    /// Continue after `iteration`, whose checkpoint exists and whose first
    /// `iteration` history values are in `history`.
    Resumed { iteration: usize, history: Vec<f64> },
    Fresh,
}

impl ResumeState {
    /// Inspects `ckpt_dir` and the history log. Checkpoints beyond
    /// `num_iters`, or not covered by the log, are ignored.
    pub fn detect(ckpt_dir: &Path, log_path: &Path, num_iters: usize) -> Result<Self> {
        let log = read_values_log(log_path)?.unwrap_or_default();
        let checkpoints = list_checkpoints(ckpt_dir)?;
        if checkpoints.contains(&num_iters) && log.len() >= num_iters {
            return Ok(ResumeState::Completed(log[..num_iters].to_vec()));
        }
        for &k in checkpoints.iter().filter(|&&k| k < num_iters) {
            if log.len() >= k {
                return Ok(ResumeState::Resumed {
                    iteration: k,
                    history: log[..k].to_vec(),
                });
            }
            warn!(
                checkpoint = k,
                logged = log.len(),
                "history log does not cover checkpoint, trying an older one"
            );
        }
        Ok(ResumeState::Fresh)
    }
}

/// Iterations of all checkpoints in `dir`, newest first.
fn list_checkpoints(dir: &Path) -> Result<Vec<usize>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BnnError::io(dir, e)),
    };
    let mut its = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BnnError::io(dir, e))?;
        if let Some(k) = entry.file_name().to_str().and_then(parse_checkpoint_name) {
            its.push(k);
        }
    }
    its.sort_unstable_by(|a, b| b.cmp(a));
    Ok(its)
}

/// Squared Frobenius norm of an optional gradient.
fn sq_norm<B: Backend, const D: usize>(g: Option<Tensor<B, D>>) -> Result<f64> {
    g.map_or(Ok(0.0), |g| scalar(g.powf_scalar(2.0).sum()))
}

/// Norm of the concatenated gradient over every generator parameter.
fn param_grad_norm<B: AutodiffBackend>(net: &GaussianNet<B>, grads: &B::Gradients) -> Result<f64> {
    let mut sq = 0.0;
    for layer in &net.layers {
        sq += sq_norm(layer.w_mu.val().grad(grads))?;
        sq += sq_norm(layer.w_rho.val().grad(grads))?;
        sq += sq_norm(layer.b_mu.val().grad(grads))?;
        sq += sq_norm(layer.b_rho.val().grad(grads))?;
        if let Some(a) = &layer.coef {
            sq += sq_norm(a.val().grad(grads))?;
        }
    }
    Ok(sq.sqrt())
}

/// Outcome of [`WassersteinMapper::optimise`].
#[derive(Debug, Clone, Serialize)]
pub struct MapperReport {
    /// Distance estimate of every outer iteration, `num_iters` values.
    pub history: Vec<f64>,
    /// Outer iterations performed by this invocation.
    pub iterations_run: usize,
    pub resumed_from: Option<usize>,
    pub lipschitz: Vec<LipschitzRecord>,
    pub param_grad_norms: Vec<ParamGradRecord>,
}

pub struct WassersteinMapper<'a, B: AutodiffBackend, P: FunctionPrior + ?Sized> {
    target: &'a P,
    generator: GaussianNet<B>,
    inputs: Array2<f64>,
    phi: Tensor<B, 2>,
    cfg: MapperConfig,
    out_dir: PathBuf,
    seed: u64,
    device: B::Device,
}

impl<'a, B: AutodiffBackend, P: FunctionPrior + ?Sized> WassersteinMapper<'a, B, P> {
    /// The measurement set is the `n_measure`-point grid of `grid`. It is
    /// deterministic, so it is built once and reused by every iteration.
    pub fn new(
        target: &'a P,
        generator: GaussianNet<B>,
        grid: &GridGenerator,
        embedding: &RbfEmbedding,
        cfg: &MapperConfig,
        out_dir: impl Into<PathBuf>,
        device: &B::Device,
    ) -> Result<Self> {
        let fan_in = generator.layers.first().map(|l| l.fan_in()).unwrap_or(0);
        if fan_in != embedding.width() {
            return Err(BnnError::Shape(format!(
                "generator expects {fan_in} input features, embedding has {}",
                embedding.width()
            )));
        }
        let measurement = grid.generate(cfg.n_measure)?;
        let phi = embedding.tensor::<B>(measurement.points(), device)?;
        Ok(Self {
            target,
            generator,
            inputs: measurement.points().clone(),
            phi,
            cfg: cfg.clone(),
            out_dir: out_dir.into(),
            seed: 0,
            device: device.clone(),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn checkpoint_path(&self, iteration: usize) -> PathBuf {
        self.out_dir
            .join(CHECKPOINT_DIR)
            .join(checkpoint_name(iteration))
    }

    /// Runs the outer loop up to `num_iters`, resuming where a previous
    /// invocation stopped. Returns the trained generator and the report.
    pub fn optimise(self) -> Result<(GaussianNet<B>, MapperReport)> {
        let cfg = &self.cfg;
        let ckpt_dir = self.out_dir.join(CHECKPOINT_DIR);
        fs::create_dir_all(&ckpt_dir).map_err(|e| BnnError::io(&ckpt_dir, e))?;
        let log_path = self.out_dir.join(LOG_FILE);

        let mut generator = self.generator.clone();
        let (start, mut history) =
            match ResumeState::detect(&ckpt_dir, &log_path, cfg.num_iters)? {
                ResumeState::Completed(history) => {
                    info!(
                        iterations = cfg.num_iters,
                        "mapper already trained, loading final checkpoint"
                    );
                    let generator = generator
                        .load_checkpoint(&self.checkpoint_path(cfg.num_iters), &self.device)?;
                    let report = MapperReport {
                        history,
                        iterations_run: 0,
                        resumed_from: Some(cfg.num_iters),
                        lipschitz: Vec::new(),
                        param_grad_norms: Vec::new(),
                    };
                    return Ok((generator, report));
                }
                ResumeState::Resumed { iteration, history } => {
                    info!(iteration, "resuming mapper from checkpoint");
                    generator =
                        generator.load_checkpoint(&self.checkpoint_path(iteration), &self.device)?;
                    (iteration, history)
                }
                ResumeState::Fresh => (0, Vec::with_capacity(cfg.num_iters)),
            };

        let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(start as u64));
        let critic = Critic::<B>::new(cfg.n_measure, &cfg.critic_hidden, &mut rng, &self.device);
        let mut trainer = critic.trainer(cfg.penalty_coeff);
        let mut outer_optim = RmsPropConfig::new().init::<B, GaussianNet<B>>();

        let mut lipschitz = Vec::new();
        let mut param_grad_norms = Vec::new();
        let pb = progress_bar(cfg.num_iters - start, "Mapper");

        for iteration in start + 1..=cfg.num_iters {
            let target = self
                .target
                .sample_functions(&self.inputs, cfg.n_samples, &mut rng)?;
            let p = to_tensor2::<B>(&target, &self.device);
            let q = generator.sample_functions(self.phi.clone(), cfg.n_samples, &mut rng);

            let (steps, lr) = if iteration == start + 1 {
                (cfg.starting_steps, cfg.starting_lr)
            } else {
                (cfg.inner_steps, cfg.inner_lr)
            };
            let inner = trainer.train(&p, &q.clone().detach(), steps, lr, &mut rng, iteration)?;
            lipschitz.extend(inner);

            let critic = trainer.critic().clone().no_grad();
            let loss = critic.forward(p).mean() - critic.forward(q).mean();
            let distance =
                BnnError::ensure_finite(scalar(loss.clone())?, "generator", iteration, "distance")?;
            let grads = loss.backward();
            let norm = BnnError::ensure_finite(
                param_grad_norm(&generator, &grads)?,
                "generator",
                iteration,
                "parameter gradient norm",
            )?;
            let grads = GradientsParams::from_grads(grads, &generator);
            generator = outer_optim.step(cfg.outer_lr, generator, grads);

            history.push(distance);
            param_grad_norms.push(ParamGradRecord {
                outer: iteration,
                norm,
            });

            if iteration % cfg.checkpoint_every == 0 || iteration == cfg.num_iters {
                generator.save_checkpoint(&self.checkpoint_path(iteration))?;
                write_values_log(&log_path, &history)?;
                debug!(iteration, "saved mapper checkpoint");
            }
            if cfg.print_every > 0 && iteration % cfg.print_every == 0 {
                info!(iteration, distance, grad_norm = norm, "mapper");
            }
            pb.inc(1);
            pb.set_message(format!("W1≈{distance:.4}"));
        }
        pb.finish_with_message("Done!");

        write_records(&lipschitz, &self.out_dir.join("lipschitz.csv"))?;
        write_records(&param_grad_norms, &self.out_dir.join("param_grad_norms.csv"))?;

        let report = MapperReport {
            history,
            iterations_run: cfg.num_iters - start,
            resumed_from: (start > 0).then_some(start),
            lipschitz,
            param_grad_norms,
        };
        Ok((generator, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::from_tensor2;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use tempfile::tempdir;

    type B = Autodiff<NdArray<f32>>;

    #[test]
    fn analytic_input_gradient_matches_autodiff() {
        let device = Default::default();
        let mut rng = SmallRng::seed_from_u64(3);
        let critic = Critic::<B>::new(5, &[7, 6], &mut rng, &device);
        let x = crate::net::standard_normal::<B, 2>(&mut rng, [4, 5], &device).require_grad();
        let (out, g) = critic.forward_with_input_grad(x.clone());
        let grads = out.sum().backward();
        let expected = from_tensor2(x.grad(&grads).unwrap()).unwrap();
        let analytic = from_tensor2(g.inner()).unwrap();
        assert_abs_diff_eq!(analytic, expected, epsilon = 1e-4);
    }

    #[test]
    fn checkpoint_names_parse_back() {
        assert_eq!(parse_checkpoint_name(&checkpoint_name(250)), Some(250));
        assert_eq!(parse_checkpoint_name("it-50.ckpt.tmp"), None);
        assert_eq!(parse_checkpoint_name("wsr_values.log"), None);
    }

    fn touch(dir: &Path, it: usize) {
        fs::write(dir.join(checkpoint_name(it)), b"").unwrap();
    }

    #[test]
    fn resume_state_without_files_is_fresh() {
        let dir = tempdir().unwrap();
        let state =
            ResumeState::detect(&dir.path().join("ckpts"), &dir.path().join(LOG_FILE), 10)
                .unwrap();
        assert_eq!(state, ResumeState::Fresh);
    }

    #[test]
    fn final_checkpoint_and_full_log_mean_completed() {
        let dir = tempdir().unwrap();
        touch(dir.path(), 4);
        let log = dir.path().join(LOG_FILE);
        write_values_log(&log, &[4.0, 3.0, 2.0, 1.0, 0.5]).unwrap();
        let state = ResumeState::detect(dir.path(), &log, 4).unwrap();
        assert_eq!(state, ResumeState::Completed(vec![4.0, 3.0, 2.0, 1.0]));
    }

    #[test]
    fn short_log_falls_back_to_an_older_checkpoint() {
        let dir = tempdir().unwrap();
        touch(dir.path(), 2);
        touch(dir.path(), 4);
        touch(dir.path(), 6);
        let log = dir.path().join(LOG_FILE);
        write_values_log(&log, &[4.0, 3.0, 2.0]).unwrap();
        let state = ResumeState::detect(dir.path(), &log, 8).unwrap();
        assert_eq!(
            state,
            ResumeState::Resumed {
                iteration: 2,
                history: vec![4.0, 3.0]
            }
        );
    }

    #[test]
    fn checkpoint_without_log_is_fresh() {
        let dir = tempdir().unwrap();
        touch(dir.path(), 5);
        let state = ResumeState::detect(dir.path(), &dir.path().join(LOG_FILE), 10).unwrap();
        assert_eq!(state, ResumeState::Fresh);
    }
}
