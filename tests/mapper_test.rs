//! Wasserstein mapper: reproducibility, resume-or-run, and the critic's
//! distance estimate on a toy pair of distributions.

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Tensor, TensorData};
use gpig_bnn::config::{ArchitectureConfig, KernelKind, MapperConfig};
use gpig_bnn::data::GridGenerator;
use gpig_bnn::embedding::RbfEmbedding;
use gpig_bnn::gaussian_net::GaussianNet;
use gpig_bnn::gp::{GaussianProcess, Kernel};
use gpig_bnn::prior::Prior;
use gpig_bnn::mapper::{checkpoint_name, Critic, MapperReport, WassersteinMapper, CHECKPOINT_DIR};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

type B = Autodiff<NdArray<f32>>;

fn arch() -> ArchitectureConfig {
    ArchitectureConfig {
        input_dim: 2,
        hidden_dims: vec![4, 6],
        embedding_lengthscale: 0.5,
        ..ArchitectureConfig::default()
    }
}

fn mapper_config() -> MapperConfig {
    MapperConfig {
        num_iters: 4,
        n_samples: 8,
        n_measure: 9,
        inner_steps: 2,
        starting_steps: 5,
        critic_hidden: vec![8],
        checkpoint_every: 2,
        print_every: 0,
        nonstationary: false,
        ..MapperConfig::default()
    }
}

fn run_mapper(dir: &Path, seed: u64) -> MapperReport {
    run_mapper_with_generator(dir, seed).1
}

fn run_mapper_with_generator(dir: &Path, seed: u64) -> (GaussianNet<B>, MapperReport) {
    let device = Default::default();
    let grid = GridGenerator::new(0.0, 1.0, 2);
    let domain = grid.generate(16).unwrap();
    let embedding = RbfEmbedding::new(&domain, 4, 0.5).unwrap();
    let target = GaussianProcess::new(Kernel {
        kind: KernelKind::Rbf,
        ampl: 1.0,
        leng: 0.3,
    });
    let generator = GaussianNet::<B>::new(&arch(), false, &device);
    WassersteinMapper::new(
        &target,
        generator,
        &grid,
        &embedding,
        &mapper_config(),
        dir,
        &device,
    )
    .unwrap()
    .with_seed(seed)
    .optimise()
    .unwrap()
}

#[test]
fn same_seed_reproduces_the_history() {
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    let first = run_mapper(a.path(), 11);
    let second = run_mapper(b.path(), 11);
    assert_eq!(first.history.len(), 4);
    assert_eq!(first.history, second.history);
    assert!(first.history.iter().all(|d| d.is_finite()));
}

#[test]
fn completed_run_is_not_repeated() {
    let dir = tempdir().unwrap();
    let first = run_mapper(dir.path(), 3);
    assert_eq!(first.iterations_run, 4);
    assert_eq!(first.resumed_from, None);
    assert!(dir.path().join("lipschitz.csv").exists());
    assert!(dir.path().join("param_grad_norms.csv").exists());

    let again = run_mapper(dir.path(), 3);
    assert_eq!(again.iterations_run, 0);
    assert_eq!(again.resumed_from, Some(4));
    assert_eq!(again.history.len(), 4);
    for (x, y) in again.history.iter().zip(&first.history) {
        approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-6 * y.abs().max(1.0));
    }
}

#[test]
fn missing_final_checkpoint_resumes_from_the_last_one() {
    let dir = tempdir().unwrap();
    let first = run_mapper(dir.path(), 5);
    fs::remove_file(dir.path().join(CHECKPOINT_DIR).join(checkpoint_name(4))).unwrap();

    let resumed = run_mapper(dir.path(), 5);
    assert_eq!(resumed.resumed_from, Some(2));
    assert_eq!(resumed.iterations_run, 2);
    assert_eq!(resumed.history.len(), 4);
    for (x, y) in resumed.history[..2].iter().zip(&first.history[..2]) {
        approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-6 * y.abs().max(1.0));
    }
    assert!(dir
        .path()
        .join(CHECKPOINT_DIR)
        .join(checkpoint_name(4))
        .exists());
}

fn normal_column(rng: &mut SmallRng, n: usize, mean: f32) -> Tensor<B, 2> {
    let values: Vec<f32> = (0..n)
        .map(|_| mean + rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_data(TensorData::new(values, [n, 1]), &Default::default())
}

#[test]
fn critic_recovers_the_distance_between_shifted_normals() {
    let device = Default::default();
    let mut rng = SmallRng::seed_from_u64(21);
    let mut trainer = Critic::<B>::new(1, &[32, 32], &mut rng, &device).trainer(10.0);

    for step in 0..1500 {
        let p = normal_column(&mut rng, 256, 2.0);
        let q = normal_column(&mut rng, 256, 0.0);
        trainer.train(&p, &q, 1, 5e-3, &mut rng, step).unwrap();
    }

    let p = normal_column(&mut rng, 4000, 2.0);
    let q = normal_column(&mut rng, 4000, 0.0);
    let w1 = trainer.distance(p, q).unwrap();
    // W1(N(2, 1), N(0, 1)) = 2.
    assert!((w1 - 2.0).abs() < 0.5, "estimated W1 = {w1}");
}

#[test]
fn final_checkpoint_reloads_as_the_optimised_prior() {
    let dir = tempdir().unwrap();
    let (generator, report) = run_mapper_with_generator(dir.path(), 13);
    let ckpt = dir.path().join(CHECKPOINT_DIR).join(checkpoint_name(report.history.len()));
    let loaded = Prior::from_checkpoint::<B>(&ckpt, &arch(), false, None, &Default::default())
        .unwrap();
    assert_eq!(
        loaded,
        Prior::OptimGaussian(generator.gaussian_params(None).unwrap())
    );

    let missing = dir.path().join(CHECKPOINT_DIR).join(checkpoint_name(99));
    let res = Prior::from_checkpoint::<B>(&missing, &arch(), false, None, &Default::default());
    assert!(res.is_err());
}
