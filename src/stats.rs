//! Convergence diagnostics for multi-chain samples.
//!
//! [`RhatMulti`] accumulates per-chain running moments draw by draw, so
//! R-hat can be reported while chains are still running. [`compute_rhat`]
//! applies it to a full prediction matrix laid out chain-major.

use crate::error::{BnnError, Result};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::<f64>::zeros((n_chains, n_params)),
            mean_sq: Array2::<f64>::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    /// Adds one draw of every chain; `x` is `[n_chains, n_params]`.
    pub fn step(&mut self, x: ArrayView2<'_, f64>) -> Result<()> {
        if x.dim() != (self.n_chains, self.n_params) {
            return Err(BnnError::Shape(format!(
                "expected a ({}, {}) draw, got {:?}",
                self.n_chains,
                self.n_params,
                x.dim()
            )));
        }
        self.n += 1;
        let n = self.n as f64;
        self.mean = (&self.mean * (n - 1.0) + &x) / n;
        if self.n == 1 {
            self.mean_sq = x.pow2();
        } else {
            self.mean_sq = (&self.mean_sq * (n - 1.0) + x.pow2()) / n;
        }
        Ok(())
    }

    /// Potential scale reduction per parameter.
    pub fn all(&self) -> Result<Array1<f64>> {
        if self.n_chains < 2 || self.n < 2 {
            return Err(BnnError::Shape(format!(
                "R-hat needs at least two chains and two draws, got {} and {}",
                self.n_chains, self.n
            )));
        }
        let mean_chain = self
            .mean
            .mean_axis(Axis(0))
            .ok_or_else(|| BnnError::Shape("mean across chains failed".into()))?;
        let n_chains = self.n_chains as f64;
        let n = self.n as f64;
        let fac = n / (n_chains - 1.0);
        let between = (&self.mean - &mean_chain.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * fac;
        let sm2 = (&self.mean_sq - &self.mean.pow2()) * n / (n - 1.0);
        let within = sm2
            .mean_axis(Axis(0))
            .ok_or_else(|| BnnError::Shape("mean of within-chain variances failed".into()))?;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).sqrt())
    }
}

/// R-hat per column of `samples` (`[n_chains * n_draws, n_points]`), whose
/// rows hold chain 0's draws first, then chain 1's, and so on.
pub fn compute_rhat(samples: &Array2<f64>, n_chains: usize) -> Result<Array1<f64>> {
    if n_chains == 0 || samples.nrows() % n_chains != 0 {
        return Err(BnnError::Shape(format!(
            "{} rows cannot be split into {} equal chains",
            samples.nrows(),
            n_chains
        )));
    }
    let n_draws = samples.nrows() / n_chains;
    let n_points = samples.ncols();
    let standard = samples.as_standard_layout();
    let by_chain = standard
        .view()
        .into_shape_with_order((n_chains, n_draws, n_points))
        .map_err(|e| BnnError::Shape(e.to_string()))?;
    let mut psr = RhatMulti::new(n_chains, n_points);
    for t in 0..n_draws {
        psr.step(by_chain.index_axis(Axis(1), t))?;
    }
    psr.all()
}

/// R-hat of one stationary sequence cut into `k` consecutive pseudo-chains.
/// Trailing draws that do not fill a pseudo-chain are dropped.
pub fn split_rhat(draws: &Array2<f64>, k: usize) -> Result<Array1<f64>> {
    if k < 2 {
        return Err(BnnError::Shape("split R-hat needs at least two pieces".into()));
    }
    let len = draws.nrows() / k;
    compute_rhat(&draws.slice(s![..len * k, ..]).to_owned(), k)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RhatSummary {
    pub mean: f64,
    pub std: f64,
    pub max: f64,
}

impl RhatSummary {
    pub fn from_values(rhat: &Array1<f64>) -> Result<Self> {
        let mean = rhat
            .mean()
            .ok_or_else(|| BnnError::Shape("no R-hat values".into()))?;
        Ok(Self {
            mean,
            std: rhat.std(0.0),
            max: *rhat.max().map_err(|e| BnnError::Shape(e.to_string()))?,
        })
    }

    /// Summary over the concatenation of several R-hat arrays, one per grid
    /// location, so the spread covers every (location, point) value.
    pub fn collate(parts: &[Array1<f64>]) -> Result<Self> {
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        let all = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| BnnError::Shape(e.to_string()))?;
        Self::from_values(&all)
    }
}

/// Normalised autocorrelation of `x` at every lag, computed by FFT.
pub fn autocorrelation(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = x.iter().sum::<f64>() / n as f64;
    let size = (2 * n).next_power_of_two();
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(size).process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(size).process(&mut buf);

    let c0 = buf[0].re;
    if c0 <= 0.0 {
        return vec![1.0; n];
    }
    buf.iter().take(n).map(|c| c.re / c0).collect()
}

/// Effective sample size of `chains` (`[n_chains, n_draws]`) from the
/// chain-averaged autocorrelation, truncated at the first negative pair sum.
pub fn effective_sample_size(chains: &Array2<f64>) -> f64 {
    let (m, n) = chains.dim();
    if m == 0 || n < 2 {
        return (m * n) as f64;
    }
    let mut rho = vec![0.0; n];
    for chain in chains.outer_iter() {
        let ac = autocorrelation(&chain.to_vec());
        for (r, a) in rho.iter_mut().zip(ac) {
            *r += a / m as f64;
        }
    }
    let mut tau = -1.0;
    let mut t = 0;
    while t + 1 < n {
        let pair = rho[t] + rho[t + 1];
        if pair < 0.0 {
            break;
        }
        tau += 2.0 * pair;
        t += 2;
    }
    (m * n) as f64 / tau.max(1.0 / (m * n) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collated_spread_covers_every_location_and_point() {
        // Equal location means, different spreads within locations.
        let parts = [arr1(&[1.0, 1.2]), arr1(&[1.1, 1.1])];
        let s = RhatSummary::collate(&parts).unwrap();
        approx::assert_abs_diff_eq!(s.mean, 1.1, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(s.std, 0.005f64.sqrt(), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(s.max, 1.2);
        assert!(RhatSummary::collate(&[]).is_err());
    }
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;
    use std::f64;

    fn run_rhat_test(data0: Array2<f64>, data1: Array2<f64>, expected: Array1<f64>, tol: f64) {
        let mut psr = RhatMulti::new(3, 4);
        psr.step(data0.view()).unwrap();
        psr.step(data1.view()).unwrap();
        let rhat = psr.all().unwrap();
        let diff = *(rhat.clone() - expected.clone()).abs().max().unwrap();
        assert!(
            diff < tol,
            "Mismatch in Rhat. Got {:?}, expected {:?}, diff = {:?}",
            rhat,
            expected,
            diff
        );
    }

    #[test]
    fn test_rhat_two_draws() {
        // Step 0 data (chains x params)
        let data_step_0 = arr2(&[
            [0.0, 1.0, 0.0, 1.0], // chain 0
            [1.0, 2.0, 0.0, 2.0], // chain 1
            [0.0, 0.0, 0.0, 2.0], // chain 2
        ]);
        // Step 1 data (chains x params)
        let data_step_1 = arr2(&[
            [1.0, 2.0, 2.0, 0.0], // chain 0
            [1.0, 1.0, 1.0, 1.0], // chain 1
            [0.0, 1.0, 0.0, 0.0], // chain 2
        ]);
        let expected = array![f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        run_rhat_test(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn test_rhat_other_data() {
        let data_step_0 = arr2(&[
            [1.0, 0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 2.0],
        ]);
        let data_step_1 = arr2(&[
            [1.0, 2.0, 0.0, 2.0],
            [1.0, 2.0, 0.0, 0.0],
            [2.0, 0.0, 1.0, 2.0],
        ]);
        let expected = array![f64::consts::FRAC_1_SQRT_2, 0.74535599, 1.0, 1.5];
        run_rhat_test(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn compute_rhat_matches_streaming_accumulator() {
        // Chain-major rows: chain 0 draws 0..2, chain 1, chain 2.
        let samples = arr2(&[
            [0.0, 1.0, 0.0, 1.0],
            [1.0, 2.0, 2.0, 0.0],
            [1.0, 2.0, 0.0, 2.0],
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0, 2.0],
            [0.0, 1.0, 0.0, 0.0],
        ]);
        let rhat = compute_rhat(&samples, 3).unwrap();
        assert_abs_diff_eq!(rhat[0], f64::consts::SQRT_2, epsilon = 1e-7);
        assert_abs_diff_eq!(rhat[3], 0.8660254, epsilon = 1e-7);
    }

    #[test]
    fn uneven_chains_are_rejected() {
        let samples = Array2::<f64>::zeros((7, 2));
        assert!(compute_rhat(&samples, 3).is_err());
    }

    #[test]
    fn shifted_chains_have_large_rhat() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut samples = Array2::<f64>::zeros((400, 1));
        for (i, mut row) in samples.outer_iter_mut().enumerate() {
            let offset = if i < 200 { 0.0 } else { 5.0 };
            row[0] = offset + rng.sample::<f64, _>(StandardNormal);
        }
        let rhat = compute_rhat(&samples, 2).unwrap();
        assert!(rhat[0] > 2.0, "rhat {}", rhat[0]);
    }

    #[test]
    fn autocorrelation_of_white_noise_vanishes() {
        let mut rng = SmallRng::seed_from_u64(1);
        let x: Vec<f64> = (0..4096).map(|_| rng.sample(StandardNormal)).collect();
        let ac = autocorrelation(&x);
        assert_abs_diff_eq!(ac[0], 1.0, epsilon = 1e-12);
        assert!(ac[1].abs() < 0.05);
        assert!(ac[10].abs() < 0.05);
    }

    #[test]
    fn ess_drops_for_correlated_chains() {
        let mut rng = SmallRng::seed_from_u64(2);
        let n = 2000;
        let mut iid = Array2::<f64>::zeros((2, n));
        let mut ar = Array2::<f64>::zeros((2, n));
        for c in 0..2 {
            let mut prev = 0.0;
            for t in 0..n {
                let e: f64 = rng.sample(StandardNormal);
                iid[[c, t]] = e;
                prev = 0.9 * prev + e;
                ar[[c, t]] = prev;
            }
        }
        let ess_iid = effective_sample_size(&iid);
        let ess_ar = effective_sample_size(&ar);
        assert!(ess_iid > 0.6 * (2 * n) as f64, "iid ess {ess_iid}");
        // AR(1) with phi = 0.9 has ESS ratio (1 - phi) / (1 + phi) ~ 0.05.
        assert!(ess_ar < 0.15 * (2 * n) as f64, "ar ess {ess_ar}");
    }
}
