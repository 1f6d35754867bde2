//! Target priors over functions.
//!
//! The mapper only needs draws of a target prior on a measurement set, which
//! is what [`FunctionPrior`] provides. [`GaussianProcess`] is the isotropic
//! GP used both as a target and as the posterior baseline;
//! [`EmpiricalFieldPrior`] resamples a bank of observed fields on the test
//! grid.

use crate::config::{GpConfig, KernelKind};
use crate::data::{MeasurementSet, SampleBatch, TrainingData};
use crate::error::{BnnError, Result};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::Serialize;
use std::f64::consts::{LN_2, PI};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Anything that can produce function draws on an input set.
pub trait FunctionPrior {
    /// `n_draws` functions evaluated at every row of `inputs`,
    /// shape `[n_draws, n_points]`.
    fn sample_functions(
        &self,
        inputs: &Array2<f64>,
        n_draws: usize,
        rng: &mut SmallRng,
    ) -> Result<SampleBatch>;
}

const SQRT_3: f64 = 1.732_050_807_568_877_2;
const JITTER: f64 = 1e-6;
const MAX_JITTER_TRIES: usize = 6;
/// Smallest log-space step of the hyperparameter search.
const MIN_LOG_STEP: f64 = 0.02;

/// Isotropic covariance `ampl * k(r / leng)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kernel {
    pub kind: KernelKind,
    /// Marginal variance.
    pub ampl: f64,
    pub leng: f64,
}

impl Kernel {
    pub fn eval(&self, a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        let r2 = (&a - &b).mapv(|d| d * d).sum() / (self.leng * self.leng);
        match self.kind {
            KernelKind::Rbf => self.ampl * (-0.5 * r2).exp(),
            KernelKind::Matern32 => {
                let s = SQRT_3 * r2.sqrt();
                self.ampl * (1.0 + s) * (-s).exp()
            }
        }
    }

    pub fn gram(&self, a: &Array2<f64>, b: &Array2<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(a.nrows(), b.nrows(), |i, j| self.eval(a.row(i), b.row(j)))
    }
}

/// Cholesky factor of `m + jitter * I`, raising the jitter tenfold until the
/// factorisation succeeds.
fn jittered_cholesky(m: &DMatrix<f64>, scale: f64) -> Result<Cholesky<f64, Dyn>> {
    let mut jitter = JITTER * scale.max(f64::MIN_POSITIVE);
    for _ in 0..MAX_JITTER_TRIES {
        let mut shifted = m.clone();
        for i in 0..shifted.nrows() {
            shifted[(i, i)] += jitter;
        }
        if let Some(chol) = Cholesky::new(shifted) {
            return Ok(chol);
        }
        debug!(jitter, "cholesky failed, raising jitter");
        jitter *= 10.0;
    }
    Err(BnnError::NumericalInstability {
        stage: "gp",
        iteration: 0,
        detail: format!("covariance of size {} is not positive definite", m.nrows()),
    })
}

/// `mean + L z` for `n_draws` standard normal vectors `z`.
fn correlated_draws(
    mean: &DVector<f64>,
    chol: &Cholesky<f64, Dyn>,
    n_draws: usize,
    rng: &mut SmallRng,
) -> SampleBatch {
    let n = mean.len();
    let z = DMatrix::from_fn(n, n_draws, |_, _| rng.sample::<f64, _>(StandardNormal));
    let f = chol.l_dirty().lower_triangle() * z;
    Array2::from_shape_fn((n_draws, n), |(s, i)| mean[i] + f[(i, s)])
}

#[derive(Debug, Clone)]
struct Conditioning {
    x: Array2<f64>,
    y: DVector<f64>,
    noise_var: f64,
}

/// Prior Cholesky factor of the last input set drawn on.
#[derive(Debug)]
struct PriorFactor {
    inputs: Array2<f64>,
    chol: Cholesky<f64, Dyn>,
}

/// Result of [`GaussianProcess::fit_hyperparameters`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HyperFit {
    pub ampl: f64,
    pub leng: f64,
    pub noise_var: f64,
    pub loglik: f64,
    pub fit: f64,
    pub complexity: f64,
    pub evaluations: usize,
}

/// Zero-mean Gaussian process with an isotropic kernel.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    kernel: Kernel,
    data: Option<Conditioning>,
    prior_cache: Arc<Mutex<Option<Arc<PriorFactor>>>>,
}

impl GaussianProcess {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            data: None,
            prior_cache: Arc::default(),
        }
    }

    pub fn from_config(cfg: &GpConfig) -> Self {
        Self::new(Kernel {
            kind: cfg.kernel,
            ampl: cfg.ampl,
            leng: cfg.leng,
        })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Replaces the kernel hyperparameters, keeping any assigned data.
    pub fn update_kernel(&mut self, ampl: f64, leng: f64) {
        self.kernel.ampl = ampl;
        self.kernel.leng = leng;
        self.prior_cache = Arc::default();
    }

    /// Conditions subsequent predictions on noisy observations.
    pub fn assign_data(&mut self, data: &TrainingData, noise_var: f64) -> Result<()> {
        if !(noise_var.is_finite() && noise_var > 0.0) {
            return Err(BnnError::config(format!(
                "GP noise variance must be positive, got {noise_var}"
            )));
        }
        self.data = Some(Conditioning {
            x: data.x.clone(),
            y: DVector::from_iterator(data.len(), data.y.iter().copied()),
            noise_var,
        });
        Ok(())
    }

    fn conditioning(&self) -> Result<&Conditioning> {
        self.data
            .as_ref()
            .ok_or_else(|| BnnError::config("GP has no data assigned"))
    }

    /// Log marginal likelihood of the assigned data under the given
    /// hyperparameters, split as `(loglik, fit, complexity)` where
    /// `fit = -y' K^-1 y / 2` and `complexity = -log|K| / 2`.
    pub fn marginal_loglik(&self, ampl: f64, leng: f64, noise_var: f64) -> Result<(f64, f64, f64)> {
        let data = self.conditioning()?;
        let kernel = Kernel {
            ampl,
            leng,
            ..self.kernel
        };
        let mut k = kernel.gram(&data.x, &data.x);
        for i in 0..k.nrows() {
            k[(i, i)] += noise_var;
        }
        let chol = jittered_cholesky(&k, ampl)?;
        let alpha = chol.solve(&data.y);
        let fit = -0.5 * data.y.dot(&alpha);
        let complexity = -chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let n = data.y.len() as f64;
        Ok((fit + complexity - 0.5 * n * (2.0 * PI).ln(), fit, complexity))
    }

    /// Maximum-likelihood `(ampl, leng, noise_var)` by coordinate pattern
    /// search in log space, starting from the current values. The step
    /// halves whenever no coordinate move improves the likelihood. The
    /// optimum replaces the kernel and the noise of the assigned data.
    pub fn fit_hyperparameters(&mut self, max_evals: usize) -> Result<HyperFit> {
        let noise = self.conditioning()?.noise_var;
        let eval = |x: &[f64; 3]| self.marginal_loglik(x[0].exp(), x[1].exp(), x[2].exp());
        let mut x = [self.kernel.ampl.ln(), self.kernel.leng.ln(), noise.ln()];
        let mut best = eval(&x)?;
        let mut evals = 1;
        let mut step = LN_2;
        while step > MIN_LOG_STEP && evals < max_evals {
            let mut improved = false;
            'search: for d in 0..3 {
                for dir in [1.0, -1.0] {
                    if evals >= max_evals {
                        break 'search;
                    }
                    let mut cand = x;
                    cand[d] += dir * step;
                    evals += 1;
                    match eval(&cand) {
                        Ok(v) if v.0 > best.0 => {
                            x = cand;
                            best = v;
                            improved = true;
                            break 'search;
                        }
                        Ok(_) | Err(BnnError::NumericalInstability { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            if !improved {
                step *= 0.5;
            }
        }

        let fit = HyperFit {
            ampl: x[0].exp(),
            leng: x[1].exp(),
            noise_var: x[2].exp(),
            loglik: best.0,
            fit: best.1,
            complexity: best.2,
            evaluations: evals,
        };
        self.update_kernel(fit.ampl, fit.leng);
        if let Some(data) = self.data.as_mut() {
            data.noise_var = fit.noise_var;
        }
        info!(
            ampl = fit.ampl,
            leng = fit.leng,
            noise_var = fit.noise_var,
            loglik = fit.loglik,
            "fitted GP hyperparameters"
        );
        Ok(fit)
    }

    /// Posterior mean and covariance of the latent function at `inputs`.
    pub fn posterior(&self, inputs: &Array2<f64>) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let data = self.conditioning()?;
        let mut kxx = self.kernel.gram(&data.x, &data.x);
        for i in 0..kxx.nrows() {
            kxx[(i, i)] += data.noise_var;
        }
        let chol = jittered_cholesky(&kxx, self.kernel.ampl)?;
        let kxs = self.kernel.gram(&data.x, inputs);
        let mean = kxs.transpose() * chol.solve(&data.y);
        let cov = self.kernel.gram(inputs, inputs) - kxs.transpose() * chol.solve(&kxs);
        Ok((mean, cov))
    }

    /// Posterior draws at `inputs`; with `noisy` the observation noise is
    /// added to every draw.
    pub fn predict_f_samples(
        &self,
        inputs: &Array2<f64>,
        n_draws: usize,
        noisy: bool,
        rng: &mut SmallRng,
    ) -> Result<SampleBatch> {
        let (mean, mut cov) = self.posterior(inputs)?;
        if noisy {
            let noise = self.conditioning()?.noise_var;
            for i in 0..cov.nrows() {
                cov[(i, i)] += noise;
            }
        }
        // Symmetrise against round-off before factorising.
        let cov = (&cov + cov.transpose()) * 0.5;
        let chol = jittered_cholesky(&cov, self.kernel.ampl)?;
        Ok(correlated_draws(&mean, &chol, n_draws, rng))
    }
}

impl FunctionPrior for GaussianProcess {
    fn sample_functions(
        &self,
        inputs: &Array2<f64>,
        n_draws: usize,
        rng: &mut SmallRng,
    ) -> Result<SampleBatch> {
        let factor = {
            let mut cache = self.prior_cache.lock().unwrap_or_else(|p| p.into_inner());
            match cache.as_ref() {
                Some(f) if f.inputs == *inputs => Arc::clone(f),
                _ => {
                    let k = self.kernel.gram(inputs, inputs);
                    let f = Arc::new(PriorFactor {
                        inputs: inputs.clone(),
                        chol: jittered_cholesky(&k, self.kernel.ampl)?,
                    });
                    *cache = Some(Arc::clone(&f));
                    f
                }
            }
        };
        let mean = DVector::zeros(inputs.nrows());
        Ok(correlated_draws(&mean, &factor.chol, n_draws, rng))
    }
}

/// Bank of observed fields on a fixed domain, resampled with replacement.
///
/// Inputs that are not domain points take the value of their nearest domain
/// point.
#[derive(Debug, Clone)]
pub struct EmpiricalFieldPrior {
    domain: MeasurementSet,
    fields: Array2<f64>,
}

impl EmpiricalFieldPrior {
    /// `fields` is `[n_fields, domain.len()]`.
    pub fn new(domain: MeasurementSet, fields: Array2<f64>) -> Result<Self> {
        if fields.ncols() != domain.len() || fields.nrows() == 0 {
            return Err(BnnError::Shape(format!(
                "field bank {:?} does not cover a domain of {} points",
                fields.dim(),
                domain.len()
            )));
        }
        Ok(Self { domain, fields })
    }

    pub fn n_fields(&self) -> usize {
        self.fields.nrows()
    }

    pub fn domain(&self) -> &MeasurementSet {
        &self.domain
    }

    /// Removes the last field from the bank and returns it as ground truth.
    pub fn withhold_last(self) -> Result<(Self, Array1<f64>)> {
        let n = self.fields.nrows();
        if n < 2 {
            return Err(BnnError::config(
                "field bank needs at least two fields to withhold one",
            ));
        }
        let truth = self.fields.row(n - 1).to_owned();
        let fields = self.fields.slice_axis(Axis(0), (0..n - 1).into()).to_owned();
        Ok((
            Self {
                domain: self.domain,
                fields,
            },
            truth,
        ))
    }
}

impl FunctionPrior for EmpiricalFieldPrior {
    fn sample_functions(
        &self,
        inputs: &Array2<f64>,
        n_draws: usize,
        rng: &mut SmallRng,
    ) -> Result<SampleBatch> {
        let cols: Vec<usize> = inputs
            .outer_iter()
            .map(|x| self.domain.nearest(x))
            .collect();
        let rows: Vec<usize> = (0..n_draws)
            .map(|_| rng.gen_range(0..self.fields.nrows()))
            .collect();
        Ok(self.fields.select(Axis(0), &rows).select(Axis(1), &cols))
    }
}
