//! Stochastic-gradient Hamiltonian Monte Carlo as burn optimisers.
//!
//! Both variants treat the gradient they receive as the gradient of the
//! potential `U(theta)` and move parameters along a noisy, damped momentum.
//! They plug into burn's [`OptimizerAdaptor`], so a sampler step is the same
//! call as a training step:
//!
//! ```text
//! let grads = GradientsParams::from_grads(potential.backward(), &net);
//! net = optim.step(lr, net, grads);
//! ```
//!
//! Injected noise comes from a seeded [`SmallRng`] shared by all parameter
//! tensors of one optimiser, so a chain is reproducible from its seed.

use crate::net::standard_normal;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::SimpleOptimizer;
use burn::LearningRate;
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct SharedRng(Arc<Mutex<SmallRng>>);

impl SharedRng {
    fn new(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(SmallRng::seed_from_u64(seed))))
    }

    fn normal<B: Backend, const D: usize>(
        &self,
        shape: [usize; D],
        device: &B::Device,
    ) -> Tensor<B, D> {
        let mut rng = self.0.lock().unwrap_or_else(|p| p.into_inner());
        standard_normal::<B, D>(&mut *rng, shape, device)
    }
}

/// Settings of plain SGHMC.
#[derive(Debug, Clone, PartialEq)]
pub struct SghmcConfig {
    /// Momentum decay (friction) per step.
    pub mdecay: f64,
    pub seed: u64,
}

impl SghmcConfig {
    pub fn new(mdecay: f64) -> Self {
        Self { mdecay, seed: 42 }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
    ) -> OptimizerAdaptor<Sghmc, M, B> {
        OptimizerAdaptor::from(Sghmc {
            mdecay: self.mdecay,
            rng: SharedRng::new(self.seed),
        })
    }
}

/// Plain SGHMC with a fixed step size:
/// `v <- (1 - mdecay) v - lr grad + N(0, 2 lr mdecay)`, `theta <- theta + v`.
#[derive(Debug, Clone)]
pub struct Sghmc {
    mdecay: f64,
    rng: SharedRng,
}

#[derive(Record, Clone)]
pub struct SghmcState<B: Backend, const D: usize> {
    pub momentum: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Sghmc {
    type State<const D: usize> = SghmcState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let device = tensor.device();
        let momentum = state
            .map(|s| s.momentum)
            .unwrap_or_else(|| Tensor::zeros(tensor.dims(), &device));
        let noise_std = (2.0 * lr * self.mdecay).sqrt();
        let noise = self
            .rng
            .normal::<B, D>(tensor.dims(), &device)
            .mul_scalar(noise_std);
        let momentum = momentum.mul_scalar(1.0 - self.mdecay) - grad.mul_scalar(lr) + noise;
        let tensor = tensor + momentum.clone();
        (tensor, Some(SghmcState { momentum }))
    }

    fn to_device<const D: usize>(
        mut state: Self::State<D>,
        device: &B::Device,
    ) -> Self::State<D> {
        state.momentum = state.momentum.to_device(device);
        state
    }
}

/// Settings of adaptive SGHMC.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveSghmcConfig {
    pub mdecay: f64,
    /// Steps during which the preconditioner keeps adapting.
    pub num_burn_in_steps: usize,
    pub epsilon: f64,
    pub seed: u64,
}

impl AdaptiveSghmcConfig {
    pub fn new(mdecay: f64, num_burn_in_steps: usize) -> Self {
        Self {
            mdecay,
            num_burn_in_steps,
            epsilon: 1e-16,
            seed: 42,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
    ) -> OptimizerAdaptor<AdaptiveSghmc, M, B> {
        OptimizerAdaptor::from(AdaptiveSghmc {
            mdecay: self.mdecay,
            num_burn_in_steps: self.num_burn_in_steps,
            epsilon: self.epsilon,
            rng: SharedRng::new(self.seed),
        })
    }
}

/// SGHMC with a diagonal preconditioner estimated from running gradient
/// moments during burn-in (Springenberg et al., 2016). The learning rate
/// enters squared, so `lr = 1e-2` corresponds to a plain step of `1e-4`.
#[derive(Debug, Clone)]
pub struct AdaptiveSghmc {
    mdecay: f64,
    num_burn_in_steps: usize,
    epsilon: f64,
    rng: SharedRng,
}

#[derive(Record, Clone)]
pub struct AdaptiveSghmcState<B: Backend, const D: usize> {
    pub iteration: usize,
    pub tau: Tensor<B, D>,
    pub g: Tensor<B, D>,
    pub v_hat: Tensor<B, D>,
    pub momentum: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for AdaptiveSghmc {
    type State<const D: usize> = AdaptiveSghmcState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let device = tensor.device();
        let dims = tensor.dims();
        let mut s = state.unwrap_or_else(|| AdaptiveSghmcState {
            iteration: 0,
            tau: Tensor::ones(dims, &device),
            g: Tensor::ones(dims, &device),
            v_hat: Tensor::ones(dims, &device),
            momentum: Tensor::zeros(dims, &device),
        });
        s.iteration += 1;

        if s.iteration <= self.num_burn_in_steps {
            let tau_inv = s.tau.clone().add_scalar(1.0).recip();
            let signal = s.g.clone().powf_scalar(2.0) / s.v_hat.clone().add_scalar(self.epsilon);
            s.tau = (s.tau.clone() - s.tau.clone() * signal).add_scalar(1.0);
            s.g = s.g.clone() - s.g.clone() * tau_inv.clone() + tau_inv.clone() * grad.clone();
            s.v_hat = s.v_hat.clone() - s.v_hat.clone() * tau_inv.clone()
                + tau_inv * grad.clone().powf_scalar(2.0);
        }

        let minv = s.v_hat.clone().sqrt().add_scalar(self.epsilon).recip();
        let lr2 = lr * lr;
        let noise_var = minv
            .clone()
            .mul_scalar(2.0 * lr2 * self.mdecay)
            .sub_scalar(lr2 * lr2)
            .clamp_min(1e-16);
        let noise = self.rng.normal::<B, D>(dims, &device) * noise_var.sqrt();

        s.momentum = s.momentum.clone() - (minv * grad).mul_scalar(lr2)
            - s.momentum.clone().mul_scalar(self.mdecay)
            + noise;
        let tensor = tensor + s.momentum.clone();
        (tensor, Some(s))
    }

    fn to_device<const D: usize>(
        mut state: Self::State<D>,
        device: &B::Device,
    ) -> Self::State<D> {
        state.tau = state.tau.to_device(device);
        state.g = state.g.to_device(device);
        state.v_hat = state.v_hat.to_device(device);
        state.momentum = state.momentum.to_device(device);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::from_tensor1;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Param;
    use burn::optim::{GradientsParams, Optimizer};

    type B = Autodiff<NdArray<f32>>;

    #[derive(Module, Debug)]
    struct Point<B: Backend> {
        x: Param<Tensor<B, 1>>,
    }

    fn point(n: usize) -> Point<B> {
        Point {
            x: Param::from_tensor(Tensor::zeros([n], &Default::default())),
        }
    }

    /// Runs `steps` updates on the standard normal potential `0.5 |x|^2` and
    /// returns the final positions.
    fn run<O: Optimizer<Point<B>, B>>(mut optim: O, lr: f64, steps: usize) -> Vec<f64> {
        let mut p = point(1000);
        for _ in 0..steps {
            let potential = p.x.val().powf_scalar(2.0).sum().mul_scalar(0.5);
            let grads = GradientsParams::from_grads(potential.backward(), &p);
            p = optim.step(lr, p, grads);
        }
        from_tensor1(p.x.val().inner()).unwrap().to_vec()
    }

    fn variance(xs: &[f64]) -> f64 {
        let n = xs.len() as f64;
        let m = xs.iter().sum::<f64>() / n;
        xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n
    }

    #[test]
    fn sghmc_samples_standard_normal() {
        let optim = SghmcConfig::new(0.1).with_seed(3).init::<B, Point<B>>();
        let xs = run(optim, 0.01, 2000);
        let v = variance(&xs);
        assert!((0.75..1.25).contains(&v), "variance {v}");
    }

    #[test]
    fn adaptive_sghmc_samples_standard_normal() {
        let optim = AdaptiveSghmcConfig::new(0.05, 300)
            .with_seed(5)
            .init::<B, Point<B>>();
        let xs = run(optim, 0.1, 3000);
        let v = variance(&xs);
        assert!((0.7..1.3).contains(&v), "variance {v}");
    }

    #[test]
    fn equal_seeds_give_equal_chains() {
        let chain = |seed| {
            let optim = SghmcConfig::new(0.05).with_seed(seed).init::<B, Point<B>>();
            run(optim, 0.01, 20)
        };
        let (a, b, c) = (chain(11), chain(11), chain(12));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
