use gpig_bnn::config::{ExperimentConfig, SamplerKind};
use gpig_bnn::error::BnnError;
use std::fs;
use tempfile::tempdir;

#[test]
fn unknown_sampler_is_a_configuration_error() {
    let err = ExperimentConfig::from_json_str(r#"{"sampling": {"sampler": "nuts"}}"#).unwrap_err();
    assert!(matches!(err, BnnError::Configuration(_)), "{err}");
    assert!(err.to_string().contains("nuts"), "{err}");
}

#[test]
fn partial_config_keeps_reference_defaults() {
    let cfg = ExperimentConfig::from_json_str(
        r#"{"seed": 4, "sampling": {"sampler": "sghmc", "num_chains": 2}}"#,
    )
    .unwrap();
    assert_eq!(cfg.seed, 4);
    assert_eq!(cfg.sampling.sampler, SamplerKind::Sghmc);
    assert_eq!(cfg.sampling.num_chains, 2);
    assert_eq!(cfg.sampling.keep_every, 500);
    assert_eq!(cfg.sampling.effective_lr(), 1e-4);
    assert_eq!(cfg.mapper.n_measure, 64 * 64);
}

#[test]
fn burn_in_must_align_with_thinning() {
    let err = ExperimentConfig::from_json_str(
        r#"{"sampling": {"num_burn_in_steps": 105, "keep_every": 10}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, BnnError::Configuration(_)));
}

#[test]
fn zero_thinning_is_rejected() {
    let err = ExperimentConfig::from_json_str(r#"{"sampling": {"keep_every": 0}}"#).unwrap_err();
    assert!(matches!(err, BnnError::Configuration(_)));
}

#[test]
fn mapper_needs_at_least_one_iteration() {
    let err = ExperimentConfig::from_json_str(r#"{"mapper": {"num_iters": 0}}"#).unwrap_err();
    assert!(matches!(err, BnnError::Configuration(_)));
}

#[test]
fn unreadable_config_is_an_io_error() {
    let dir = tempdir().unwrap();
    let err = ExperimentConfig::from_json_file(&dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(err, BnnError::Io { .. }));
}

#[test]
fn default_config_round_trips_through_a_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    let cfg = ExperimentConfig::default();
    fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
    assert_eq!(ExperimentConfig::from_json_file(&path).unwrap(), cfg);
}
