use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use gpig_bnn::bayes_net::{BayesNet, Ensemble};
use gpig_bnn::config::ExperimentConfig;
use gpig_bnn::context::ExperimentContext;
use gpig_bnn::data::{grid_anchors, GridGenerator, HoldoutPartition, MeasurementSet, TrainingData};
use gpig_bnn::embedding::RbfEmbedding;
use gpig_bnn::error::{BnnError, Result};
use gpig_bnn::gaussian_net::GaussianNet;
use gpig_bnn::gp::{EmpiricalFieldPrior, FunctionPrior, GaussianProcess, HyperFit};
use gpig_bnn::io::csv::{load_fields, save_csv, save_samples};
use gpig_bnn::likelihood::GaussianLikelihood;
use gpig_bnn::mapper::{checkpoint_name, WassersteinMapper, CHECKPOINT_DIR};
use gpig_bnn::metrics::MetricsReport;
use gpig_bnn::prior::{location_priors, Prior};
use gpig_bnn::stats::{effective_sample_size, RhatSummary};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use std::error::Error;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type B = Autodiff<NdArray<f32>>;

/// Likelihood evaluations allowed for the GP hyperparameter search.
const GP_MLE_EVALS: usize = 300;

/// GP-induced BNN priors on a 2-D field: GP baseline, Wasserstein prior
/// matching, then fixed-prior and GP-induced-prior SGHMC posteriors.
#[derive(Debug, Parser)]
#[command(name = "gpig-bnn", version, about)]
struct Cli {
    /// JSON experiment configuration. Missing keys take their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for checkpoints, samples and summaries.
    #[arg(short, long, default_value = "exp")]
    out_dir: PathBuf,

    /// Overrides the configured seed.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct LocationRhat {
    anchor_index: usize,
    anchor: Vec<f64>,
    rhat: RhatSummary,
}

#[derive(Debug, Serialize)]
struct BnnSummary {
    prior: &'static str,
    num_params: usize,
    ensemble_size: usize,
    metrics: MetricsReport,
    rhat: RhatSummary,
    /// Over every (location, point) value.
    location_rhat_collated: Option<RhatSummary>,
    location_rhat: Vec<LocationRhat>,
    mean_output_ess: f64,
}

#[derive(Debug, Serialize)]
struct MapperSummary {
    iterations_run: usize,
    resumed_from: Option<usize>,
    final_distance: Option<f64>,
    nonstationary: bool,
}

#[derive(Debug, Serialize)]
struct ExperimentSummary {
    gp_hyperparameters: HyperFit,
    gp: MetricsReport,
    mapper: MapperSummary,
    fixed_bnn: BnnSummary,
    gpig_bnn: BnnSummary,
}

/// Everything the stages share once the data is set up.
struct Setup {
    test: MeasurementSet,
    grid: GridGenerator,
    embedding: RbfEmbedding,
    truth: Array1<f64>,
    partition: HoldoutPartition,
    data: TrainingData,
    fields: Option<EmpiricalFieldPrior>,
}

fn setup(cfg: &ExperimentConfig, rng: &mut SmallRng) -> Result<Setup> {
    if cfg.architecture.input_dim != 2 {
        return Err(BnnError::Configuration(format!(
            "the holdout partition needs a 2-D grid, got input_dim {}",
            cfg.architecture.input_dim
        )));
    }
    let grid = GridGenerator::new(0.0, 1.0, cfg.architecture.input_dim);
    let test = grid.generate_per_axis(cfg.n_test)?;
    let embedding = RbfEmbedding::new(
        &test,
        cfg.architecture.embed_width(),
        cfg.architecture.embedding_lengthscale,
    )?;

    let (fields, truth) = match &cfg.data.fields_path {
        Some(path) => {
            let bank = EmpiricalFieldPrior::new(test.clone(), load_fields(path)?)?;
            let (prior, truth) = bank.withhold_last()?;
            info!(path = %path.display(), fields = prior.n_fields(), "loaded field bank");
            (Some(prior), truth)
        }
        None => {
            let truth = GaussianProcess::from_config(&cfg.gp)
                .sample_functions(test.points(), 1, rng)?
                .row(0)
                .to_owned();
            (None, truth)
        }
    };

    let partition = HoldoutPartition::new(cfg.n_test, cfg.data.n_train, rng)?;
    let data = TrainingData::new(
        test.select(&partition.train),
        truth.select(Axis(0), &partition.train),
    )?;
    info!(
        train = partition.train.len(),
        short_range = partition.short_range.len(),
        long_range = partition.long_range.len(),
        "partitioned test grid"
    );
    Ok(Setup {
        test,
        grid,
        embedding,
        truth,
        partition,
        data,
        fields,
    })
}

/// Mean over grid points of the effective sample size of the predictive
/// draws, `preds` holding `n_chains` equal blocks of rows.
fn mean_output_ess(preds: &Array2<f64>, n_chains: usize) -> Result<f64> {
    let per_chain = preds.nrows() / n_chains.max(1);
    if per_chain * n_chains != preds.nrows() {
        return Err(BnnError::Shape(format!(
            "{} draws do not split into {n_chains} chains",
            preds.nrows()
        )));
    }
    let total: f64 = preds
        .axis_iter(Axis(1))
        .map(|col| {
            let chains = col
                .to_owned()
                .into_shape_with_order((n_chains, per_chain))
                .map_err(|e| BnnError::Shape(e.to_string()))?;
            Ok(effective_sample_size(&chains))
        })
        .sum::<Result<f64>>()?;
    Ok(total / preds.ncols() as f64)
}

struct Stage<'a> {
    cfg: &'a ExperimentConfig,
    ctx: &'a ExperimentContext,
    setup: &'a Setup,
    me_var: f64,
}

impl Stage<'_> {
    fn metrics(&self, preds: &Array2<f64>) -> Result<MetricsReport> {
        // Same noise stream for every method.
        let mut rng = SmallRng::seed_from_u64(self.cfg.seed);
        MetricsReport::evaluate(
            preds,
            &self.setup.truth,
            &self.setup.partition.long_range,
            &self.setup.partition.short_range,
            &self.cfg.metrics,
            self.me_var,
            &mut rng,
        )
    }

    fn bnn(&self, prior: &Prior) -> Result<BayesNet<B>> {
        BayesNet::new(
            &self.cfg.architecture,
            self.setup.embedding.clone(),
            &self.setup.data,
            GaussianLikelihood::new(self.me_var)?,
            prior,
            &Default::default(),
        )
    }

    fn summarise(
        &self,
        name: &str,
        bnn: &BayesNet<B>,
        ensemble: &Ensemble,
        location_rhat: Vec<LocationRhat>,
        location_rhat_collated: Option<RhatSummary>,
    ) -> Result<BnnSummary> {
        let x = self.setup.test.points();
        let preds = bnn.predict(ensemble, x)?;
        save_samples(&preds, &self.ctx.file(&format!("{name}_preds.csv")))?;
        save_csv(
            &ensemble.parameter_traces()?,
            &self.ctx.file(&format!("{name}_traces.csv")),
        )?;

        let rhat = bnn.rhat(ensemble, x)?;
        let summary = BnnSummary {
            prior: bnn.prior_name(),
            num_params: bnn.num_params(),
            ensemble_size: ensemble.len(),
            metrics: self.metrics(&preds)?,
            rhat,
            location_rhat_collated,
            location_rhat,
            mean_output_ess: mean_output_ess(&preds, ensemble.num_chains())?,
        };
        if summary.rhat.max > 1.1 {
            warn!(name, rhat = summary.rhat.max, "chains have not mixed");
        }
        info!(
            name,
            rmspe_long = summary.metrics.long_range.rmspe,
            rmspe_short = summary.metrics.short_range.rmspe,
            rhat = summary.rhat.mean,
            "posterior evaluated"
        );
        Ok(summary)
    }
}

fn run(cfg: &ExperimentConfig, ctx: &ExperimentContext) -> Result<ExperimentSummary> {
    ctx.write_json("config.json", cfg)?;
    let mut rng = SmallRng::seed_from_u64(cfg.seed);
    let setup = setup(cfg, &mut rng)?;
    let device = Default::default();

    // GP posterior baseline with maximum-likelihood hyperparameters.
    let mut gp = GaussianProcess::from_config(&cfg.gp);
    gp.assign_data(&setup.data, cfg.gp.noise_var)?;
    let hyper = gp.fit_hyperparameters(GP_MLE_EVALS)?;
    ctx.write_json("gp_hyperparameters.json", &hyper)?;
    let stage = Stage {
        cfg,
        ctx,
        setup: &setup,
        me_var: hyper.noise_var,
    };
    let n_pred = cfg.sampling.num_samples * cfg.sampling.num_chains;
    let gp_preds = gp.predict_f_samples(setup.test.points(), n_pred, false, &mut rng)?;
    save_samples(&gp_preds, &ctx.file("gp_preds.csv"))?;
    let gp_metrics = stage.metrics(&gp_preds)?;
    info!(
        rmspe_long = gp_metrics.long_range.rmspe,
        rmspe_short = gp_metrics.short_range.rmspe,
        "GP baseline evaluated"
    );

    // Prior matching against the field bank, or the fitted GP prior.
    let fitted_prior = GaussianProcess::new(*gp.kernel());
    let target: &dyn FunctionPrior = match &setup.fields {
        Some(bank) => bank,
        None => &fitted_prior,
    };
    let nonstationary = cfg.mapper.nonstationary;
    let mapper_dir = ctx.stage_dir(if nonstationary {
        "mapper_nonstationary"
    } else {
        "mapper"
    })?;
    let generator = GaussianNet::<B>::new(&cfg.architecture, nonstationary, &device);
    let (generator, report) = WassersteinMapper::new(
        target,
        generator,
        &setup.grid,
        &setup.embedding,
        &cfg.mapper,
        &mapper_dir,
        &device,
    )?
    .with_seed(cfg.seed)
    .optimise()?;
    ctx.write_json("mapper_report.json", &report)?;
    let mapper = MapperSummary {
        iterations_run: report.iterations_run,
        resumed_from: report.resumed_from,
        final_distance: report.history.last().copied(),
        nonstationary,
    };

    // Fixed-prior BNN.
    let fixed_prior = Prior::FixedGaussian {
        mean: cfg.fixed_prior.mean,
        std: cfg.fixed_prior.std,
    };
    let fixed = stage.bnn(&fixed_prior)?;
    let fixed_ensemble = fixed.sample_multi_chains(&cfg.sampling, cfg.seed)?;
    let fixed_bnn = stage.summarise("fixed_bnn", &fixed, &fixed_ensemble, Vec::new(), None)?;

    // GP-induced BNN, one posterior per anchor when nonstationary.
    let final_ckpt = mapper_dir
        .join(CHECKPOINT_DIR)
        .join(checkpoint_name(cfg.mapper.num_iters));
    let base_prior =
        Prior::from_checkpoint::<B>(&final_ckpt, &cfg.architecture, nonstationary, None, &device)?;
    let gpig = stage.bnn(&base_prior)?;
    let gpig_bnn = if generator.is_nonstationary() {
        let anchors = grid_anchors(
            &setup.test,
            cfg.nonstationary_grid.grid_width,
            cfg.nonstationary_grid.grid_height,
        )?;
        let priors = location_priors(&generator, &setup.embedding, &anchors)?;
        let locations = gpig.sample_locations(&priors, &cfg.sampling, cfg.seed)?;
        let values = locations
            .iter()
            .map(|l| gpig.rhat_values(&l.ensemble, setup.test.points()))
            .collect::<Result<Vec<_>>>()?;
        let location_rhat = locations
            .iter()
            .zip(&values)
            .map(|(l, v)| {
                Ok(LocationRhat {
                    anchor_index: l.anchor.index,
                    anchor: l.anchor.point.to_vec(),
                    rhat: RhatSummary::from_values(v)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let collated = RhatSummary::collate(&values)?;
        let pooled = Ensemble::pool(locations.iter().map(|l| &l.ensemble));
        stage.summarise("gpig_bnn", &gpig, &pooled, location_rhat, Some(collated))?
    } else {
        let ensemble = gpig.sample_multi_chains(&cfg.sampling, cfg.seed)?;
        stage.summarise("gpig_bnn", &gpig, &ensemble, Vec::new(), None)?
    };

    Ok(ExperimentSummary {
        gp_hyperparameters: hyper,
        gp: gp_metrics,
        mapper,
        fixed_bnn,
        gpig_bnn,
    })
}

fn main() -> std::result::Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => ExperimentConfig::from_json_file(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(seed) = cli.seed {
        cfg.seed = seed;
    }

    let ctx = ExperimentContext::open(&cli.out_dir)?;
    let summary = run(&cfg, &ctx)?;
    let path = ctx.write_json("summary.json", &summary)?;
    println!("Saved experiment summary to {}", path.display());
    Ok(())
}
