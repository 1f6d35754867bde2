//! File formats of the experiment outputs.
//!
//! The Wasserstein history is a plain-text table with one `%.6e` value per
//! line, readable by `numpy.loadtxt`. Everything tabular goes through
//! [`csv`].

pub mod csv;

use crate::context::write_atomic;
use crate::error::{BnnError, Result};
use std::path::Path;

/// Scientific notation with a signed two-digit exponent, e.g. `1.250000e-03`.
pub fn format_sci(v: f64) -> String {
    let s = format!("{v:.6e}");
    match s.split_once('e') {
        Some((mantissa, exp)) => match exp.parse::<i32>() {
            Ok(e) => {
                let sign = if e < 0 { '-' } else { '+' };
                format!("{mantissa}e{sign}{:02}", e.abs())
            }
            Err(_) => s,
        },
        None => s,
    }
}

/// Replaces the log at `path` with `values`, one per line.
pub fn write_values_log(path: &Path, values: &[f64]) -> Result<()> {
    let mut text = String::with_capacity(values.len() * 14);
    for v in values {
        text.push_str(&format_sci(*v));
        text.push('\n');
    }
    write_atomic(path, text.as_bytes())
}

/// Values of a log written by [`write_values_log`]; `None` if the file does
/// not exist.
pub fn read_values_log(path: &Path) -> Result<Option<Vec<f64>>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BnnError::io(path, e)),
    };
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, l)| {
            l.parse::<f64>().map_err(|e| BnnError::Checkpoint {
                path: path.to_path_buf(),
                detail: format!("line {}: {e}", i + 1),
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scientific_format_matches_numpy() {
        assert_eq!(format_sci(0.00125), "1.250000e-03");
        assert_eq!(format_sci(12345.0), "1.234500e+04");
        assert_eq!(format_sci(-2.0), "-2.000000e+00");
    }

    #[test]
    fn values_log_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wsr_values.log");
        assert_eq!(read_values_log(&path).unwrap(), None);
        write_values_log(&path, &[1.5, 0.25, 3e-7]).unwrap();
        let back = read_values_log(&path).unwrap().unwrap();
        assert_eq!(back, vec![1.5, 0.25, 3e-7]);
    }

    #[test]
    fn garbage_in_log_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wsr_values.log");
        std::fs::write(&path, "1.0\nnot-a-number\n").unwrap();
        let err = read_values_log(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }
}
