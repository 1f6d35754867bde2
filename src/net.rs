//! Deterministic network body shared by the posterior sampler.
//!
//! Parameters live in typed per-layer records ([`DenseLayer`]): a weight
//! matrix `[fan_in, fan_out]` and a bias vector `[fan_out]`, indexed by layer
//! number. Layers use the standardised parameterisation
//! `h W / sqrt(fan_in) + b`, so unit-variance weights keep activations at
//! unit scale regardless of width.

use crate::config::ActivationKind;
use crate::error::{BnnError, Result};
use burn::module::{Ignored, Param};
use burn::prelude::*;
use burn::tensor::activation;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;

impl ActivationKind {
    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            ActivationKind::Tanh => x.tanh(),
            ActivationKind::Relu => activation::relu(x),
            ActivationKind::Softplus => activation::softplus(x, 1.0),
            ActivationKind::Sigmoid => activation::sigmoid(x),
        }
    }
}

/// Host-side copy of one layer's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerValues {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl LayerValues {
    pub fn zeros(fan_in: usize, fan_out: usize) -> Self {
        Self {
            weight: Array2::zeros((fan_in, fan_out)),
            bias: Array1::zeros(fan_out),
        }
    }

    pub fn fan_in(&self) -> usize {
        self.weight.nrows()
    }

    pub fn fan_out(&self) -> usize {
        self.weight.ncols()
    }

    pub fn len(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Weights then biases, row-major.
    pub fn flatten(&self) -> Vec<f64> {
        self.weight.iter().chain(self.bias.iter()).copied().collect()
    }
}

/// A full parameter snapshot of a [`Net`].
pub type ParamSnapshot = Vec<LayerValues>;

#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    pub weight: Param<Tensor<B, 2>>,
    pub bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> DenseLayer<B> {
    pub fn from_values(values: &LayerValues, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(to_tensor2(&values.weight, device)),
            bias: Param::from_tensor(to_tensor1(&values.bias, device)),
        }
    }

    pub fn fan_in(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let scale = 1.0 / (self.fan_in() as f64).sqrt();
        h.matmul(self.weight.val()).mul_scalar(scale) + self.bias.val().unsqueeze_dim::<2>(0)
    }

    pub fn values(&self) -> Result<LayerValues> {
        Ok(LayerValues {
            weight: from_tensor2(self.weight.val())?,
            bias: from_tensor1(self.bias.val())?,
        })
    }
}

/// Feed-forward body mapping embedded inputs `[n, embed_width]` to outputs
/// `[n, 1]`.
#[derive(Module, Debug)]
pub struct Net<B: Backend> {
    pub layers: Vec<DenseLayer<B>>,
    activation: Ignored<ActivationKind>,
}

impl<B: Backend> Net<B> {
    pub fn from_values(
        values: &[LayerValues],
        activation: ActivationKind,
        device: &B::Device,
    ) -> Result<Self> {
        if values.is_empty() {
            return Err(BnnError::Shape("a network needs at least one layer".into()));
        }
        for pair in values.windows(2) {
            if pair[0].fan_out() != pair[1].fan_in() {
                return Err(BnnError::Shape(format!(
                    "layer widths do not chain: {} -> {}",
                    pair[0].fan_out(),
                    pair[1].fan_in()
                )));
            }
        }
        Ok(Self {
            layers: values
                .iter()
                .map(|v| DenseLayer::from_values(v, device))
                .collect(),
            activation: Ignored(activation),
        })
    }

    pub fn activation(&self) -> ActivationKind {
        self.activation.0
    }

    pub fn forward(&self, phi: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len() - 1;
        self.layers
            .iter()
            .enumerate()
            .fold(phi, |h, (l, layer)| {
                let z = layer.forward(h);
                if l == last {
                    z
                } else {
                    self.activation.0.apply(z)
                }
            })
    }

    pub fn snapshot(&self) -> Result<ParamSnapshot> {
        self.layers.iter().map(DenseLayer::values).collect()
    }
}

/// Tensor of i.i.d. `N(0, 1)` draws taken from `rng`.
pub(crate) fn standard_normal<B: Backend, const D: usize>(
    rng: &mut impl Rng,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::<B, D>::from_data(TensorData::new(data, shape), device)
}

/// Tensor of i.i.d. `U(0, 1)` draws taken from `rng`.
pub(crate) fn standard_uniform<B: Backend, const D: usize>(
    rng: &mut impl Rng,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen::<f32>()).collect();
    Tensor::<B, D>::from_data(TensorData::new(data, shape), device)
}

pub(crate) fn to_tensor2<B: Backend>(a: &Array2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let (r, c) = a.dim();
    let flat: Vec<f32> = a.iter().map(|&v| v as f32).collect();
    Tensor::<B, 2>::from_data(TensorData::new(flat, [r, c]), device)
}

pub(crate) fn to_tensor1<B: Backend>(a: &Array1<f64>, device: &B::Device) -> Tensor<B, 1> {
    let flat: Vec<f32> = a.iter().map(|&v| v as f32).collect();
    let n = flat.len();
    Tensor::<B, 1>::from_data(TensorData::new(flat, [n]), device)
}

fn tensor_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f64>> {
    let data = t.into_data().convert::<f32>();
    let flat = data
        .to_vec::<f32>()
        .map_err(|e| BnnError::Shape(format!("reading tensor data failed: {e:?}")))?;
    Ok(flat.into_iter().map(f64::from).collect())
}

pub(crate) fn from_tensor2<B: Backend>(t: Tensor<B, 2>) -> Result<Array2<f64>> {
    let [r, c] = t.dims();
    Array2::from_shape_vec((r, c), tensor_vec(t)?).map_err(|e| BnnError::Shape(e.to_string()))
}

pub(crate) fn from_tensor1<B: Backend>(t: Tensor<B, 1>) -> Result<Array1<f64>> {
    Ok(Array1::from(tensor_vec(t)?))
}

/// Scalar value of a one-element tensor.
pub(crate) fn scalar<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<f64> {
    tensor_vec(t)?
        .first()
        .copied()
        .ok_or_else(|| BnnError::Shape("expected a scalar tensor".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn two_layer() -> Vec<LayerValues> {
        let mut l0 = LayerValues::zeros(4, 3);
        l0.weight.fill(1.0);
        l0.bias.fill(0.5);
        let mut l1 = LayerValues::zeros(3, 1);
        l1.weight.fill(2.0);
        vec![l0, l1]
    }

    #[test]
    fn forward_uses_standardised_scaling() {
        let device = Default::default();
        let net = Net::<B>::from_values(&two_layer(), ActivationKind::Relu, &device).unwrap();
        let phi = Tensor::<B, 2>::ones([2, 4], &device);
        let out = from_tensor2(net.forward(phi)).unwrap();
        assert_eq!(out.dim(), (2, 1));
        // Hidden units: 4 / sqrt(4) + 0.5 = 2.5; output: 3 * 2.5 * 2 / sqrt(3).
        let expected = 3.0 * 2.5 * 2.0 / 3f64.sqrt();
        assert_abs_diff_eq!(out[[0, 0]], expected, epsilon = 1e-4);
    }

    #[test]
    fn snapshot_returns_loaded_values() {
        let device = Default::default();
        let values = two_layer();
        let net = Net::<B>::from_values(&values, ActivationKind::Tanh, &device).unwrap();
        let snap = net.snapshot().unwrap();
        assert_eq!(snap, values);
        assert_eq!(snap.iter().map(LayerValues::len).sum::<usize>(), 4 * 3 + 3 + 3 + 1);
    }

    #[test]
    fn mismatched_widths_are_rejected() {
        let device = Default::default();
        let values = vec![LayerValues::zeros(4, 3), LayerValues::zeros(2, 1)];
        assert!(Net::<B>::from_values(&values, ActivationKind::Tanh, &device).is_err());
    }
}
