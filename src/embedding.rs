//! Fixed radial-basis-function embedding in front of every network.
//!
//! Centres form a regular grid over the bounding box of the domain, so the
//! embedding width must be a perfect `input_dim`-th power. The features carry
//! no trainable parameters and are computed host-side once per input set.

use crate::config::integer_root;
use crate::data::{GridGenerator, MeasurementSet};
use crate::error::{BnnError, Result};
use crate::net::to_tensor2;
use burn::prelude::*;
use ndarray::{Array1, Array2, ArrayView1};

#[derive(Debug, Clone, PartialEq)]
pub struct RbfEmbedding {
    centres: Array2<f64>,
    lengthscale: f64,
}

impl RbfEmbedding {
    /// Places `width` centres on a grid spanning `domain`.
    pub fn new(domain: &MeasurementSet, width: usize, lengthscale: f64) -> Result<Self> {
        let dim = domain.dim();
        let per_axis = integer_root(width, dim).ok_or_else(|| {
            BnnError::config(format!(
                "embedding width {width} is not a perfect power of {dim}"
            ))
        })?;
        let pts = domain.points();
        let lows: Vec<f64> = (0..dim)
            .map(|d| pts.column(d).fold(f64::INFINITY, |a, &b| a.min(b)))
            .collect();
        let highs: Vec<f64> = (0..dim)
            .map(|d| pts.column(d).fold(f64::NEG_INFINITY, |a, &b| a.max(b)))
            .collect();

        // Unit grid, then stretched per axis onto the bounding box.
        let unit = GridGenerator::new(0.0, 1.0, dim).generate_per_axis(per_axis)?;
        let mut centres = unit.points().clone();
        for (d, mut col) in centres.columns_mut().into_iter().enumerate() {
            col.mapv_inplace(|u| lows[d] + u * (highs[d] - lows[d]));
        }
        Ok(Self {
            centres,
            lengthscale,
        })
    }

    pub fn width(&self) -> usize {
        self.centres.nrows()
    }

    pub fn input_dim(&self) -> usize {
        self.centres.ncols()
    }

    pub fn centres(&self) -> &Array2<f64> {
        &self.centres
    }

    /// Features of one input, length `width`.
    pub fn feature(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        let denom = 2.0 * self.lengthscale * self.lengthscale;
        self.centres
            .outer_iter()
            .map(|c| (-(&c - &x).mapv(|d| d * d).sum() / denom).exp())
            .collect()
    }

    /// Features of every row of `inputs`, shape `[n, width]`.
    pub fn features(&self, inputs: &Array2<f64>) -> Result<Array2<f64>> {
        if inputs.ncols() != self.input_dim() {
            return Err(BnnError::Shape(format!(
                "embedding expects {}-dimensional inputs, got {}",
                self.input_dim(),
                inputs.ncols()
            )));
        }
        let mut out = Array2::<f64>::zeros((inputs.nrows(), self.width()));
        for (x, mut row) in inputs.outer_iter().zip(out.outer_iter_mut()) {
            row.assign(&self.feature(x));
        }
        Ok(out)
    }

    /// Features as a backend tensor, ready to feed a network.
    pub fn tensor<B: Backend>(
        &self,
        inputs: &Array2<f64>,
        device: &B::Device,
    ) -> Result<Tensor<B, 2>> {
        let phi = self.features(inputs)?;
        Ok(to_tensor2(&phi, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::from_tensor2;
    use approx::assert_abs_diff_eq;

    fn domain() -> MeasurementSet {
        GridGenerator::new(0.0, 1.0, 2).generate(25).unwrap()
    }

    #[test]
    fn centres_span_the_domain() {
        let emb = RbfEmbedding::new(&domain(), 9, 0.2).unwrap();
        assert_eq!(emb.width(), 9);
        assert_abs_diff_eq!(emb.centres()[[0, 0]], 0.0);
        assert_abs_diff_eq!(emb.centres()[[8, 1]], 1.0);
        assert_abs_diff_eq!(emb.centres()[[4, 0]], 0.5);
    }

    #[test]
    fn feature_peaks_at_its_centre() {
        let emb = RbfEmbedding::new(&domain(), 9, 0.2).unwrap();
        let phi = emb.feature(ndarray::arr1(&[0.5, 0.5]).view());
        assert_abs_diff_eq!(phi[4], 1.0);
        assert!(phi.iter().all(|&v| v <= 1.0 && v > 0.0));
    }

    #[test]
    fn width_must_be_grid_sized() {
        assert!(RbfEmbedding::new(&domain(), 10, 0.2).is_err());
    }

    #[test]
    fn tensors_round_trip() {
        type B = burn::backend::NdArray<f32>;
        let emb = RbfEmbedding::new(&domain(), 4, 0.3).unwrap();
        let x = domain().points().clone();
        let t = emb.tensor::<B>(&x, &Default::default()).unwrap();
        assert_eq!(t.dims(), [25, 4]);
        let back = from_tensor2(t).unwrap();
        let direct = emb.features(&x).unwrap();
        assert_abs_diff_eq!(back, direct, epsilon = 1e-6);
    }
}
