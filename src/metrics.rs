//! Predictive-accuracy metrics on held-out points.
//!
//! Predictions arrive as `[n_draws, n_points]` ensembles of latent function
//! values. Measurement-error noise `N(0, me_var)` is added before empirical
//! quantiles are taken, so intervals describe new observations rather than
//! the latent field.

use crate::config::MetricsConfig;
use crate::error::{BnnError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::Serialize;

fn check_shapes(preds: &Array2<f64>, obs: &Array1<f64>) -> Result<()> {
    if obs.is_empty() {
        return Err(BnnError::Shape("holdout set is empty".into()));
    }
    if preds.ncols() != obs.len() || preds.nrows() == 0 {
        return Err(BnnError::Shape(format!(
            "predictions {:?} do not match {} observations",
            preds.dim(),
            obs.len()
        )));
    }
    Ok(())
}

/// Empirical quantile with linear interpolation between order statistics.
/// `sorted` must be ascending and non-empty.
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

fn sorted_column(col: ArrayView1<'_, f64>) -> Vec<f64> {
    let mut v = col.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

/// Adds `N(0, me_var)` noise to every predictive draw.
pub fn add_measurement_noise(
    preds: &Array2<f64>,
    me_var: f64,
    rng: &mut impl Rng,
) -> Array2<f64> {
    let sd = me_var.max(0.0).sqrt();
    preds.mapv(|v| v + sd * rng.sample::<f64, _>(StandardNormal))
}

/// Root mean squared error of the predictive mean.
pub fn rmspe(preds: &Array2<f64>, obs: &Array1<f64>) -> Result<f64> {
    check_shapes(preds, obs)?;
    let mean = predictive_mean(preds)?;
    let mse = (&mean - obs).mapv(|e| e * e).mean().unwrap_or(f64::NAN);
    Ok(mse.sqrt())
}

pub fn predictive_mean(preds: &Array2<f64>) -> Result<Array1<f64>> {
    preds
        .mean_axis(Axis(0))
        .ok_or_else(|| BnnError::Shape("empty prediction ensemble".into()))
}

/// Per-point variance of the ensemble's own draws.
pub fn predictive_variance(preds: &Array2<f64>) -> Array1<f64> {
    preds.var_axis(Axis(0), 0.0)
}

/// Percentage of observations inside the central `percent`% interval of
/// `noisy` (draws that already include measurement noise).
pub fn perc_coverage(noisy: &Array2<f64>, obs: &Array1<f64>, percent: f64) -> Result<f64> {
    check_shapes(noisy, obs)?;
    let tail = (1.0 - percent / 100.0) / 2.0;
    let hits = noisy
        .axis_iter(Axis(1))
        .zip(obs)
        .filter(|(col, y)| {
            let s = sorted_column(col.view());
            quantile(&s, tail) <= **y && **y <= quantile(&s, 1.0 - tail)
        })
        .count();
    Ok(100.0 * hits as f64 / obs.len() as f64)
}

/// Mean interval score (Gneiting & Raftery, 2007) of the central
/// `(1 - alpha)` interval: width plus `2 / alpha` times the miss distance.
pub fn interval_score(noisy: &Array2<f64>, obs: &Array1<f64>, alpha: f64) -> Result<f64> {
    check_shapes(noisy, obs)?;
    let total: f64 = noisy
        .axis_iter(Axis(1))
        .zip(obs)
        .map(|(col, &y)| {
            let s = sorted_column(col);
            let l = quantile(&s, alpha / 2.0);
            let u = quantile(&s, 1.0 - alpha / 2.0);
            (u - l) + (2.0 / alpha) * ((l - y).max(0.0) + (y - u).max(0.0))
        })
        .sum();
    Ok(total / obs.len() as f64)
}

/// Metrics of one method on one holdout set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HoldoutMetrics {
    pub rmspe: f64,
    pub coverage: f64,
    pub interval_score: f64,
    pub mean_predictive_variance: f64,
    pub n_points: usize,
}

impl HoldoutMetrics {
    pub fn evaluate(
        preds: &Array2<f64>,
        obs: &Array1<f64>,
        cfg: &MetricsConfig,
        me_var: f64,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        check_shapes(preds, obs)?;
        let noisy = add_measurement_noise(preds, me_var, rng);
        Ok(Self {
            rmspe: rmspe(preds, obs)?,
            coverage: perc_coverage(&noisy, obs, cfg.coverage_percent)?,
            interval_score: interval_score(&noisy, obs, cfg.score_alpha)?,
            mean_predictive_variance: predictive_variance(preds).mean().unwrap_or(f64::NAN),
            n_points: obs.len(),
        })
    }
}

/// Long- and short-range metrics of one method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsReport {
    pub long_range: HoldoutMetrics,
    pub short_range: HoldoutMetrics,
}

impl MetricsReport {
    /// `preds` covers the whole test grid; columns are picked by index.
    pub fn evaluate(
        preds: &Array2<f64>,
        truth: &Array1<f64>,
        long_range: &[usize],
        short_range: &[usize],
        cfg: &MetricsConfig,
        me_var: f64,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let on = |idx: &[usize]| (preds.select(Axis(1), idx), truth.select(Axis(0), idx));
        let (p_long, y_long) = on(long_range);
        let (p_short, y_short) = on(short_range);
        Ok(Self {
            long_range: HoldoutMetrics::evaluate(&p_long, &y_long, cfg, me_var, rng)?,
            short_range: HoldoutMetrics::evaluate(&p_short, &y_short, cfg, me_var, rng)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn quantile_interpolates() {
        let s = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(quantile(&s, 0.5), 3.0);
        assert_abs_diff_eq!(quantile(&s, 0.1), 1.4, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile(&s, 1.0), 5.0);
    }

    #[test]
    fn rmspe_uses_predictive_mean() {
        let preds = arr2(&[[0.0, 2.0], [2.0, 2.0]]);
        let obs = arr1(&[1.0, 0.0]);
        // Means are (1, 2); errors (0, 2).
        assert_abs_diff_eq!(rmspe(&preds, &obs).unwrap(), 2f64.sqrt());
    }

    #[test]
    fn interval_score_penalises_misses() {
        let preds = Array2::from_shape_fn((101, 1), |(i, _)| i as f64 / 100.0);
        let inside = interval_score(&preds, &arr1(&[0.5]), 0.1).unwrap();
        assert_abs_diff_eq!(inside, 0.9, epsilon = 1e-9);
        let above = interval_score(&preds, &arr1(&[1.95]), 0.1).unwrap();
        assert_abs_diff_eq!(above, 0.9 + 20.0, epsilon = 1e-9);
    }

    #[test]
    fn coverage_is_calibrated_under_the_noise_model() {
        let mut rng = SmallRng::seed_from_u64(17);
        let (n_draws, n_points) = (2000, 3000);
        let latent = Array2::<f64>::zeros((n_draws, n_points));
        let me_var: f64 = 0.25;
        let obs = Array1::from_shape_fn(n_points, |_| {
            me_var.sqrt() * rng.sample::<f64, _>(StandardNormal)
        });
        let cfg = MetricsConfig {
            coverage_percent: 90.0,
            score_alpha: 0.1,
        };
        let m = HoldoutMetrics::evaluate(&latent, &obs, &cfg, me_var, &mut rng).unwrap();
        assert!((m.coverage - 90.0).abs() < 2.0, "coverage {}", m.coverage);
        assert_abs_diff_eq!(m.mean_predictive_variance, 0.0);
    }

    #[test]
    fn empty_holdout_is_rejected() {
        let preds = Array2::<f64>::zeros((4, 3));
        let truth = arr1(&[0.0, 1.0, 2.0]);
        let cfg = MetricsConfig::default();
        let mut rng = SmallRng::seed_from_u64(1);
        let res = MetricsReport::evaluate(&preds, &truth, &[0, 1], &[], &cfg, 0.1, &mut rng);
        assert!(matches!(res, Err(BnnError::Shape(_))), "{res:?}");
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let preds = Array2::<f64>::zeros((4, 3));
        assert!(rmspe(&preds, &arr1(&[0.0, 1.0])).is_err());
    }
}
