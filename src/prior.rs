//! Priors over network parameters.
//!
//! Both variants reduce to independent Gaussians per parameter. A
//! [`Prior::FixedGaussian`] shares one mean and standard deviation across all
//! parameters; a [`Prior::OptimGaussian`] carries per-parameter values taken
//! from a mapper checkpoint, optionally evaluated at a spatial anchor.

use crate::config::ArchitectureConfig;
use crate::data::GridAnchor;
use crate::embedding::RbfEmbedding;
use crate::error::{BnnError, Result};
use crate::gaussian_net::GaussianNet;
use crate::net::{to_tensor1, to_tensor2, LayerValues, Net, ParamSnapshot};
use burn::prelude::*;
use ndarray::{Array1, Array2, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use std::path::Path;

/// Per-parameter Gaussian, laid out like a [`ParamSnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianParams {
    pub mean: Vec<LayerValues>,
    pub std: Vec<LayerValues>,
}

impl GaussianParams {
    pub fn new(mean: Vec<LayerValues>, std: Vec<LayerValues>) -> Result<Self> {
        if mean.len() != std.len()
            || mean
                .iter()
                .zip(&std)
                .any(|(m, s)| m.weight.dim() != s.weight.dim() || m.bias.len() != s.bias.len())
        {
            return Err(BnnError::Shape(
                "prior means and standard deviations differ in layout".into(),
            ));
        }
        let bad_std = std
            .iter()
            .flat_map(|s| s.weight.iter().chain(s.bias.iter()))
            .any(|&v| !(v.is_finite() && v > 0.0));
        if bad_std {
            return Err(BnnError::config(
                "prior standard deviations must be positive and finite",
            ));
        }
        Ok(Self { mean, std })
    }

    /// The same `N(mean, std^2)` for every parameter.
    pub fn shared(shapes: &[(usize, usize)], mean: f64, std: f64) -> Result<Self> {
        let fill = |v: f64| {
            shapes
                .iter()
                .map(|&(i, o)| LayerValues {
                    weight: Array2::from_elem((i, o), v),
                    bias: Array1::from_elem(o, v),
                })
                .collect()
        };
        Self::new(fill(mean), fill(std))
    }

    pub fn num_params(&self) -> usize {
        self.mean.iter().map(LayerValues::len).sum()
    }

    pub fn layer_shapes(&self) -> Vec<(usize, usize)> {
        self.mean.iter().map(|l| (l.fan_in(), l.fan_out())).collect()
    }

    /// One draw of every parameter.
    pub fn sample(&self, rng: &mut impl Rng) -> ParamSnapshot {
        self.mean
            .iter()
            .zip(&self.std)
            .map(|(m, s)| {
                let mut draw = m.clone();
                Zip::from(&mut draw.weight)
                    .and(&s.weight)
                    .for_each(|w, &sd| *w += sd * rng.sample::<f64, _>(StandardNormal));
                Zip::from(&mut draw.bias)
                    .and(&s.bias)
                    .for_each(|b, &sd| *b += sd * rng.sample::<f64, _>(StandardNormal));
                draw
            })
            .collect()
    }

    /// Host-side log density of a full parameter snapshot.
    pub fn log_density(&self, theta: &[LayerValues]) -> f64 {
        let term = |x: f64, m: f64, s: f64| {
            let z = (x - m) / s;
            -0.5 * z * z - s.ln() - 0.5 * (2.0 * PI).ln()
        };
        theta
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(t, (m, s))| {
                let w: f64 = Zip::from(&t.weight)
                    .and(&m.weight)
                    .and(&s.weight)
                    .fold(0.0, |acc, &x, &mu, &sd| acc + term(x, mu, sd));
                let b: f64 = Zip::from(&t.bias)
                    .and(&m.bias)
                    .and(&s.bias)
                    .fold(0.0, |acc, &x, &mu, &sd| acc + term(x, mu, sd));
                w + b
            })
            .sum()
    }

    /// Moves the prior onto `device` for repeated log-density evaluation.
    pub fn to_device<B: Backend>(&self, device: &B::Device) -> PriorTensors<B> {
        let layers = self
            .mean
            .iter()
            .zip(&self.std)
            .map(|(m, s)| {
                let log_norm = s
                    .weight
                    .iter()
                    .chain(s.bias.iter())
                    .map(|v| v.ln() + 0.5 * (2.0 * PI).ln())
                    .sum::<f64>();
                LayerPrior {
                    w_mean: to_tensor2(&m.weight, device),
                    w_std: to_tensor2(&s.weight, device),
                    b_mean: to_tensor1(&m.bias, device),
                    b_std: to_tensor1(&s.bias, device),
                    log_norm,
                }
            })
            .collect();
        PriorTensors { layers }
    }
}

#[derive(Debug, Clone)]
struct LayerPrior<B: Backend> {
    w_mean: Tensor<B, 2>,
    w_std: Tensor<B, 2>,
    b_mean: Tensor<B, 1>,
    b_std: Tensor<B, 1>,
    log_norm: f64,
}

/// Device-resident copy of a [`GaussianParams`].
#[derive(Debug, Clone)]
pub struct PriorTensors<B: Backend> {
    layers: Vec<LayerPrior<B>>,
}

impl<B: Backend> PriorTensors<B> {
    /// `log p(theta)` of the network's current parameters, shape `[1]`.
    pub fn log_prob(&self, net: &Net<B>) -> Tensor<B, 1> {
        let device = net.layers[0].weight.val().device();
        let mut total = Tensor::<B, 1>::zeros([1], &device);
        let mut log_norm = 0.0;
        for (layer, prior) in net.layers.iter().zip(&self.layers) {
            let zw = (layer.weight.val() - prior.w_mean.clone()) / prior.w_std.clone();
            let zb = (layer.bias.val() - prior.b_mean.clone()) / prior.b_std.clone();
            total = total + zw.powf_scalar(2.0).sum().mul_scalar(-0.5);
            total = total + zb.powf_scalar(2.0).sum().mul_scalar(-0.5);
            log_norm += prior.log_norm;
        }
        total.sub_scalar(log_norm)
    }
}

/// Prior over the sampler's network parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Prior {
    FixedGaussian { mean: f64, std: f64 },
    OptimGaussian(GaussianParams),
}

impl Prior {
    pub fn name(&self) -> &'static str {
        match self {
            Prior::FixedGaussian { .. } => "fixed_gaussian",
            Prior::OptimGaussian(_) => "optim_gaussian",
        }
    }

    /// Per-parameter form for the given layer layout.
    pub fn params(&self, shapes: &[(usize, usize)]) -> Result<GaussianParams> {
        match self {
            Prior::FixedGaussian { mean, std } => GaussianParams::shared(shapes, *mean, *std),
            Prior::OptimGaussian(p) => {
                if p.layer_shapes() != shapes {
                    return Err(BnnError::Shape(format!(
                        "optimised prior has layers {:?}, network expects {:?}",
                        p.layer_shapes(),
                        shapes
                    )));
                }
                Ok(p.clone())
            }
        }
    }

    /// Optimised prior from a mapper checkpoint. For nonstationary
    /// generators pass the anchor embedding to obtain that location's prior.
    pub fn from_checkpoint<B: Backend>(
        path: &Path,
        arch: &ArchitectureConfig,
        nonstationary: bool,
        anchor_phi: Option<&Array1<f64>>,
        device: &B::Device,
    ) -> Result<Self> {
        let net =
            GaussianNet::<B>::new(arch, nonstationary, device).load_checkpoint(path, device)?;
        Ok(Prior::OptimGaussian(net.gaussian_params(anchor_phi)?))
    }
}

/// Prior owned by one anchor of the nonstationary grid.
#[derive(Debug, Clone)]
pub struct LocationPrior {
    pub anchor: GridAnchor,
    pub prior: Prior,
}

/// One optimised prior per grid anchor, all derived from the same trained
/// generator.
pub fn location_priors<B: Backend>(
    net: &GaussianNet<B>,
    embedding: &RbfEmbedding,
    anchors: &[GridAnchor],
) -> Result<Vec<LocationPrior>> {
    anchors
        .iter()
        .map(|anchor| {
            let phi = embedding.feature(anchor.point.view());
            Ok(LocationPrior {
                anchor: anchor.clone(),
                prior: Prior::OptimGaussian(net.gaussian_params(Some(&phi))?),
            })
        })
        .collect()
}
