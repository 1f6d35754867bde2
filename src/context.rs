//! Experiment context: owns the output directory tree and every file write.
//!
//! Components never open ambient global paths. They receive a context (or a
//! stage directory derived from one) and write through it, so two experiments
//! with different roots never interfere.

use crate::error::{BnnError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ExperimentContext {
    root: PathBuf,
}

impl ExperimentContext {
    /// Opens (and creates if needed) the experiment root directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| BnnError::io(&root, e))?;
        debug!(root = %root.display(), "opened experiment context");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by one stage of the experiment, e.g. `mapper` or
    /// `ckpts_nonstationary`. Created on first use.
    pub fn stage_dir(&self, stage: &str) -> Result<PathBuf> {
        let dir = self.root.join(stage);
        fs::create_dir_all(&dir).map_err(|e| BnnError::io(&dir, e))?;
        Ok(dir)
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Serialises `value` as pretty JSON into `name` under the root.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.file(name);
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic(&path, &bytes)?;
        Ok(path)
    }
}

/// Writes `bytes` next to `path` and renames into place, so readers only ever
/// observe a complete file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|e| BnnError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| BnnError::io(path, e))?;
    Ok(())
}

/// Progress bar for a long-running loop of `len` steps.
pub(crate) fn progress_bar(len: usize, prefix: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.into());
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_dirs_live_under_the_root() {
        let dir = tempdir().unwrap();
        let ctx = ExperimentContext::open(dir.path().join("run")).unwrap();
        let stage = ctx.stage_dir("mapper").unwrap();
        assert!(stage.starts_with(ctx.root()));
        assert!(stage.is_dir());
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.log");
        write_atomic(&path, b"1\n").unwrap();
        write_atomic(&path, b"2\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "2\n");
        assert!(!dir.path().join("values.log.tmp").exists());
    }

    #[test]
    fn json_summaries_are_readable() {
        let dir = tempdir().unwrap();
        let ctx = ExperimentContext::open(dir.path()).unwrap();
        let path = ctx.write_json("summary.json", &vec![1.0, 2.5]).unwrap();
        let back: Vec<f64> = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(back, vec![1.0, 2.5]);
    }
}
