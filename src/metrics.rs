//! Scalar metrics sink
//!
//! Append-only JSONL scalar log for external visualization. One record per
//! emitted scalar, flushed per write so an interrupted run keeps everything
//! logged up to its last step. Write-only contract; nothing in the harness
//! reads the log back.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::Result;

const SCALARS_FILE: &str = "scalars.jsonl";

#[derive(Serialize)]
struct ScalarRecord<'a> {
    name: &'a str,
    value: f64,
    step: usize,
    ts: DateTime<Utc>,
}

/// Appends named scalar values to the run's log directory
pub struct ScalarWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl ScalarWriter {
    /// Open (or continue) the scalar log inside `log_dir`.
    pub fn create<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        let path = log_dir.as_ref().join(SCALARS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "scalar log opened");
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `(name, value, step)` record.
    pub fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            name,
            value,
            step,
            ts: Utc::now(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
