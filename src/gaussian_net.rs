//! Trainable generator of network functions with Gaussian weights.
//!
//! Every weight and bias has a mean and a softplus-parameterised standard
//! deviation. A function draw samples all parameters once and evaluates the
//! network with them, so a batch of draws is a batch of independent random
//! networks. In nonstationary mode every layer also carries a coefficient
//! vector over the embedding features; the noise part of the layer at input
//! `x` is scaled by `exp(phi(x) . a_l)`, letting the induced prior variance
//! vary across the domain.
//!
//! The mapper optimises the means, the softplus parameters and the
//! coefficients. The optimised values, evaluated at a spatial anchor, become
//! a per-parameter Gaussian prior for the sampler (see
//! [`GaussianNet::gaussian_params`]).

use crate::config::{ActivationKind, ArchitectureConfig};
use crate::error::{BnnError, Result};
use crate::net::{from_tensor1, from_tensor2, standard_normal, LayerValues};
use crate::prior::GaussianParams;
use burn::module::{Ignored, Param};
use burn::prelude::*;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::softplus;
use ndarray::Array1;
use rand::Rng;
use std::path::Path;

/// `softplus^{-1}(1)`: initial standard deviations are one.
const RHO_INIT: f64 = 0.541_324_854_612_918_1;

#[derive(Module, Debug)]
pub struct GaussianLayer<B: Backend> {
    pub w_mu: Param<Tensor<B, 2>>,
    pub w_rho: Param<Tensor<B, 2>>,
    pub b_mu: Param<Tensor<B, 1>>,
    pub b_rho: Param<Tensor<B, 1>>,
    /// Noise-scale coefficients over the embedding features, `[embed_width, 1]`.
    pub coef: Option<Param<Tensor<B, 2>>>,
}

impl<B: Backend> GaussianLayer<B> {
    fn new(fan_in: usize, fan_out: usize, embed_width: Option<usize>, device: &B::Device) -> Self {
        Self {
            w_mu: Param::from_tensor(Tensor::zeros([fan_in, fan_out], device)),
            w_rho: Param::from_tensor(Tensor::full([fan_in, fan_out], RHO_INIT, device)),
            b_mu: Param::from_tensor(Tensor::zeros([fan_out], device)),
            b_rho: Param::from_tensor(Tensor::full([fan_out], RHO_INIT, device)),
            coef: embed_width.map(|k| Param::from_tensor(Tensor::zeros([k, 1], device))),
        }
    }

    pub fn fan_in(&self) -> usize {
        self.w_mu.val().dims()[0]
    }

    pub fn fan_out(&self) -> usize {
        self.w_mu.val().dims()[1]
    }

    pub fn w_std(&self) -> Tensor<B, 2> {
        softplus(self.w_rho.val(), 1.0)
    }

    pub fn b_std(&self) -> Tensor<B, 1> {
        softplus(self.b_rho.val(), 1.0)
    }

    /// `exp(phi . a)` per input, `[n, 1]`; `None` for stationary layers.
    fn noise_scale(&self, phi: &Tensor<B, 2>) -> Option<Tensor<B, 2>> {
        self.coef
            .as_ref()
            .map(|a| phi.clone().matmul(a.val()).exp())
    }

    /// Evaluates the layer for a batch of independent draws.
    ///
    /// `h` is `[n_draws, n, fan_in]`, `phi` the embedded inputs `[n, K]`.
    fn forward_draws(
        &self,
        h: Tensor<B, 3>,
        phi: &Tensor<B, 2>,
        rng: &mut impl Rng,
    ) -> Tensor<B, 3> {
        let [s, n, fan_in] = h.dims();
        let fan_out = self.fan_out();
        let device = h.device();
        let scale = 1.0 / (fan_in as f64).sqrt();

        let eps_w = standard_normal::<B, 3>(rng, [s, fan_in, fan_out], &device);
        let eps_b = standard_normal::<B, 2>(rng, [s, fan_out], &device);

        let mean_part = h
            .clone()
            .reshape([s * n, fan_in])
            .matmul(self.w_mu.val())
            .reshape([s, n, fan_out])
            .mul_scalar(scale)
            + self.b_mu.val().reshape([1, 1, fan_out]);

        let w_noise = self.w_std().unsqueeze_dim::<3>(0) * eps_w;
        let b_noise = (self.b_std().unsqueeze_dim::<2>(0) * eps_b).unsqueeze_dim::<3>(1);
        let noise = h.matmul(w_noise).mul_scalar(scale) + b_noise;

        match self.noise_scale(phi) {
            Some(sc) => mean_part + noise * sc.unsqueeze_dim::<3>(0),
            None => mean_part + noise,
        }
    }

    /// Host-side mean and standard deviation, the latter multiplied by
    /// `noise_scale` for anchored priors.
    fn gaussian_values(&self, noise_scale: f64) -> Result<(LayerValues, LayerValues)> {
        let mean = LayerValues {
            weight: from_tensor2(self.w_mu.val())?,
            bias: from_tensor1(self.b_mu.val())?,
        };
        let std = LayerValues {
            weight: from_tensor2(self.w_std())? * noise_scale,
            bias: from_tensor1(self.b_std())? * noise_scale,
        };
        Ok((mean, std))
    }
}

#[derive(Module, Debug)]
pub struct GaussianNet<B: Backend> {
    pub layers: Vec<GaussianLayer<B>>,
    activation: Ignored<ActivationKind>,
}

impl<B: Backend> GaussianNet<B> {
    /// Builds a generator whose initial draws match the fixed `N(0, 1)`
    /// prior: all means zero, all standard deviations one and, in
    /// nonstationary mode, all coefficients zero.
    pub fn new(arch: &ArchitectureConfig, nonstationary: bool, device: &B::Device) -> Self {
        let embed = nonstationary.then(|| arch.embed_width());
        let layers = arch
            .layer_shapes()
            .into_iter()
            .map(|(fan_in, fan_out)| GaussianLayer::new(fan_in, fan_out, embed, device))
            .collect();
        Self {
            layers,
            activation: Ignored(arch.activation),
        }
    }

    pub fn is_nonstationary(&self) -> bool {
        self.layers.iter().any(|l| l.coef.is_some())
    }

    pub fn activation(&self) -> ActivationKind {
        self.activation.0
    }

    /// Draws `n_draws` random networks and evaluates them on the embedded
    /// inputs `phi` (`[n, K]`). Returns `[n_draws, n]`.
    pub fn sample_functions(
        &self,
        phi: Tensor<B, 2>,
        n_draws: usize,
        rng: &mut impl Rng,
    ) -> Tensor<B, 2> {
        let [n, k] = phi.dims();
        let h = phi
            .clone()
            .unsqueeze_dim::<3>(0)
            .repeat_dim(0, n_draws)
            .reshape([n_draws, n, k]);
        let last = self.layers.len() - 1;
        let out = self
            .layers
            .iter()
            .enumerate()
            .fold(h, |h, (l, layer)| {
                let z = layer.forward_draws(h, &phi, rng);
                if l == last {
                    z
                } else {
                    self.activation.0.apply(z)
                }
            });
        out.reshape([n_draws, n])
    }

    /// Per-parameter Gaussian prior. With `anchor_phi` (the embedding of a
    /// spatial anchor) the standard deviations of a nonstationary net are
    /// scaled by `exp(phi(anchor) . a_l)` layer by layer.
    pub fn gaussian_params(&self, anchor_phi: Option<&Array1<f64>>) -> Result<GaussianParams> {
        let mut mean = Vec::with_capacity(self.layers.len());
        let mut std = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let scale = match (anchor_phi, layer.coef.as_ref()) {
                (Some(phi), Some(a)) => {
                    let a = from_tensor2(a.val())?;
                    if a.nrows() != phi.len() {
                        return Err(BnnError::Shape(format!(
                            "anchor embedding has {} features, coefficients expect {}",
                            phi.len(),
                            a.nrows()
                        )));
                    }
                    phi.dot(&a.column(0)).exp()
                }
                _ => 1.0,
            };
            let (m, s) = layer.gaussian_values(scale)?;
            mean.push(m);
            std.push(s);
        }
        GaussianParams::new(mean, std)
    }

    /// Serialises all generator parameters to `path` atomically.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let bytes = Recorder::<B>::record(&recorder, self.clone().into_record(), ()).map_err(
            |e| BnnError::Checkpoint {
                path: path.to_path_buf(),
                detail: e.to_string(),
            },
        )?;
        crate::context::write_atomic(path, &bytes)
    }

    /// Loads parameters saved by [`GaussianNet::save_checkpoint`] into a net
    /// of the same architecture.
    pub fn load_checkpoint(self, path: &Path, device: &B::Device) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| BnnError::io(path, e))?;
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, bytes, device).map_err(|e| {
            BnnError::Checkpoint {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }
        })?;
        Ok(self.load_record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::from_tensor2;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    type B = Autodiff<NdArray<f32>>;

    fn small_arch() -> ArchitectureConfig {
        ArchitectureConfig {
            input_dim: 2,
            hidden_dims: vec![4, 6, 5],
            activation: ActivationKind::Tanh,
            embedding_lengthscale: 0.3,
        }
    }

    #[test]
    fn draws_have_one_row_per_function() {
        let device = Default::default();
        let net = GaussianNet::<B>::new(&small_arch(), false, &device);
        let phi = Tensor::<B, 2>::ones([7, 4], &device);
        let mut rng = SmallRng::seed_from_u64(1);
        let draws = net.sample_functions(phi, 3, &mut rng);
        assert_eq!(draws.dims(), [3, 7]);
    }

    #[test]
    fn zero_coefficients_reproduce_stationary_draws() {
        let device = Default::default();
        let stat = GaussianNet::<B>::new(&small_arch(), false, &device);
        let nonstat = GaussianNet::<B>::new(&small_arch(), true, &device);
        assert!(nonstat.is_nonstationary());
        let phi = Tensor::<B, 2>::ones([5, 4], &device).mul_scalar(0.3);
        let a = from_tensor2(stat.sample_functions(phi.clone(), 4, &mut SmallRng::seed_from_u64(9)))
            .unwrap();
        let b = from_tensor2(nonstat.sample_functions(phi, 4, &mut SmallRng::seed_from_u64(9)))
            .unwrap();
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
    }

    #[test]
    fn initial_prior_is_standard_normal() {
        let device = Default::default();
        let net = GaussianNet::<B>::new(&small_arch(), true, &device);
        let params = net.gaussian_params(Some(&Array1::ones(4))).unwrap();
        for (m, s) in params.mean.iter().zip(&params.std) {
            assert!(m.weight.iter().all(|&v| v == 0.0));
            assert!(s.weight.iter().all(|&v| (v - 1.0).abs() < 1e-5));
            assert!(s.bias.iter().all(|&v| (v - 1.0).abs() < 1e-5));
        }
    }

    #[test]
    fn gradients_reach_every_parameter_group() {
        let device = Default::default();
        let net = GaussianNet::<B>::new(&small_arch(), true, &device);
        let phi = Tensor::<B, 2>::ones([5, 4], &device).mul_scalar(0.5);
        let mut rng = SmallRng::seed_from_u64(2);
        let loss = net.sample_functions(phi, 8, &mut rng).powf_scalar(2.0).mean();
        let grads = loss.backward();
        let first = &net.layers[0];
        assert!(first.w_mu.val().grad(&grads).is_some());
        assert!(first.w_rho.val().grad(&grads).is_some());
        assert!(first.coef.as_ref().unwrap().val().grad(&grads).is_some());
    }

    #[test]
    fn checkpoint_round_trip_preserves_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("it-1.ckpt");
        let device = Default::default();
        let mut net = GaussianNet::<B>::new(&small_arch(), true, &device);
        net.layers[1].b_mu = Param::from_tensor(Tensor::full([5], 0.25, &device));
        net.save_checkpoint(&path).unwrap();

        let fresh = GaussianNet::<B>::new(&small_arch(), true, &device);
        let loaded = fresh.load_checkpoint(&path, &device).unwrap();
        let bias = from_tensor1(loaded.layers[1].b_mu.val()).unwrap();
        assert!(bias.iter().all(|&v| (v - 0.25).abs() < 1e-7));
    }

    #[test]
    fn missing_checkpoint_is_an_io_error() {
        let device = Default::default();
        let net = GaussianNet::<B>::new(&small_arch(), false, &device);
        let err = net
            .load_checkpoint(Path::new("/nonexistent/it-50.ckpt"), &device)
            .unwrap_err();
        assert!(matches!(err, BnnError::Io { .. }));
    }
}
