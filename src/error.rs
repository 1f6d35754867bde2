//! Error taxonomy shared by every stage of the experiment.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BnnError {
    /// Unsupported option names or malformed hyperparameters. Always fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A loss, gradient or potential became NaN or infinite.
    #[error("numerical instability during {stage} at iteration {iteration}: {detail}")]
    NumericalInstability {
        stage: &'static str,
        iteration: usize,
        detail: String,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {} could not be used: {detail}", path.display())]
    Checkpoint { path: PathBuf, detail: String },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BnnError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BnnError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        BnnError::Configuration(msg.into())
    }

    /// Fails with [`BnnError::NumericalInstability`] unless `value` is finite.
    pub(crate) fn ensure_finite(
        value: f64,
        stage: &'static str,
        iteration: usize,
        what: &str,
    ) -> Result<f64> {
        if value.is_finite() {
            Ok(value)
        } else {
            Err(BnnError::NumericalInstability {
                stage,
                iteration,
                detail: format!("{what} is {value}"),
            })
        }
    }
}

pub type Result<T> = std::result::Result<T, BnnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_values_pass_through() {
        let v = BnnError::ensure_finite(1.5, "critic", 3, "loss").unwrap();
        assert_eq!(v, 1.5);
    }

    #[test]
    fn nan_is_reported_with_stage_and_iteration() {
        let err = BnnError::ensure_finite(f64::NAN, "critic", 7, "loss").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("critic"), "{msg}");
        assert!(msg.contains("iteration 7"), "{msg}");
    }

    #[test]
    fn io_error_names_the_path() {
        let err = BnnError::io(
            "/tmp/missing.ckpt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/missing.ckpt"));
    }
}
