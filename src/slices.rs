//! Scoped temporary candle files
//!
//! Sub-periods and walk-forward train/test windows are written to CSV files
//! inside one temporary directory and read back by the backtester. The
//! directory and every file in it are removed when the [`SliceArena`] is
//! dropped, including when a search unwinds after an interrupt or error.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

use crate::data;
use crate::types::Candle;

#[derive(Debug, Error)]
pub enum SliceError {
    #[error("failed to create temporary directory: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("failed to write slice {label}: {source}")]
    Write {
        label: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read slice {label}: {source}")]
    Read {
        label: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A named slice written to the arena
#[derive(Debug, Clone)]
pub struct SliceFile {
    pub label: String,
    pub path: PathBuf,
    pub rows: usize,
}

impl SliceFile {
    /// Read the slice back
    pub fn load(&self) -> Result<Vec<Candle>, SliceError> {
        data::load_csv(&self.path).map_err(|source| SliceError::Read {
            label: self.label.clone(),
            source,
        })
    }
}

/// Owner of all temporary slice files of one search
#[derive(Debug)]
pub struct SliceArena {
    dir: TempDir,
    files: Vec<SliceFile>,
}

impl SliceArena {
    pub fn new() -> Result<Self, SliceError> {
        let dir = tempfile::Builder::new()
            .prefix("coin-trader-slices-")
            .tempdir()
            .map_err(SliceError::TempDir)?;
        debug!("Created slice arena at {}", dir.path().display());
        Ok(SliceArena {
            dir,
            files: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `candles` under a new file and remember it
    pub fn write(&mut self, label: &str, candles: &[Candle]) -> Result<SliceFile, SliceError> {
        let path = self
            .dir
            .path()
            .join(format!("{:03}_{}.csv", self.files.len(), sanitize(label)));
        data::write_csv(&path, candles).map_err(|source| SliceError::Write {
            label: label.to_string(),
            source,
        })?;

        let file = SliceFile {
            label: label.to_string(),
            path,
            rows: candles.len(),
        };
        self.files.push(file.clone());
        Ok(file)
    }

    /// Write a slice and immediately load it back
    pub fn isolate(&mut self, label: &str, candles: &[Candle]) -> Result<Vec<Candle>, SliceError> {
        self.write(label, candles)?.load()
    }

    pub fn files(&self) -> &[SliceFile] {
        &self.files
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candles(n: usize) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let c = 100.0 + i as f64;
                Candle::new_unchecked(start + Duration::hours(4 * i as i64), c, c + 1.0, c - 1.0, c, 1.0)
            })
            .collect()
    }

    #[test]
    fn test_files_removed_on_drop() {
        let (dir, file) = {
            let mut arena = SliceArena::new().unwrap();
            let file = arena.write("2024-01~2024-02", &candles(10)).unwrap();
            assert!(file.path.exists());
            assert_eq!(arena.files().len(), 1);
            (arena.path().to_path_buf(), file.path)
        };
        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[test]
    fn test_isolate_round_trips() {
        let mut arena = SliceArena::new().unwrap();
        let source = candles(25);
        let loaded = arena.isolate("train 1", &source).unwrap();
        assert_eq!(loaded, source);
        assert!(arena.files()[0]
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("train_1"));
    }
}
