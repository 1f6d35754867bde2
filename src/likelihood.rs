//! Observation model for the posterior sampler.

use crate::error::{BnnError, Result};
use burn::prelude::*;
use std::f64::consts::PI;

/// `y ~ N(f(x), noise_var)`, independently per observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianLikelihood {
    noise_var: f64,
}

impl GaussianLikelihood {
    pub fn new(noise_var: f64) -> Result<Self> {
        if !(noise_var.is_finite() && noise_var > 0.0) {
            return Err(BnnError::config(format!(
                "likelihood noise variance must be positive, got {noise_var}"
            )));
        }
        Ok(Self { noise_var })
    }

    pub fn noise_var(&self) -> f64 {
        self.noise_var
    }

    /// Summed log likelihood of a batch, shape `[1]`. `f` and `y` share a shape.
    pub fn log_lik<B: Backend, const D: usize>(
        &self,
        f: Tensor<B, D>,
        y: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        let n = f.shape().num_elements() as f64;
        let sq = (y - f).powf_scalar(2.0).sum();
        sq.mul_scalar(-0.5 / self.noise_var)
            .sub_scalar(0.5 * n * (2.0 * PI * self.noise_var).ln())
    }

    /// Host-side counterpart of [`GaussianLikelihood::log_lik`].
    pub fn log_lik_values(&self, f: &[f64], y: &[f64]) -> f64 {
        let n = f.len() as f64;
        let sq: f64 = f.iter().zip(y).map(|(a, b)| (a - b).powi(2)).sum();
        -0.5 * sq / self.noise_var - 0.5 * n * (2.0 * PI * self.noise_var).ln()
    }
}
