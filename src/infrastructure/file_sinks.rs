// File sinks: the flat data file and the per-setpoint CSV log
use crate::application::sweep_sink::SweepSink;
use crate::domain::sweep::SweepRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

/// One measurement per line, in sweep order, no header.
pub struct DataFileSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl DataFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        create_parent(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .with_context(|| format!("Failed to create data file {}", path.display()))?;
        tracing::info!("Writing measurements to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }
}

#[async_trait]
impl SweepSink for DataFileSink {
    fn name(&self) -> &str {
        "data-file"
    }

    async fn record(&mut self, record: &SweepRecord) -> Result<()> {
        self.writer
            .write_record([record.measurement.to_string()])
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        // Keep completed points on disk if the run dies mid-sweep.
        self.writer.flush()?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Full record per setpoint with a header row.
pub struct CsvLogSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvLogSink {
    pub fn create(path: &Path) -> Result<Self> {
        create_parent(path)?;
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }
}

#[async_trait]
impl SweepSink for CsvLogSink {
    fn name(&self) -> &str {
        "csv-log"
    }

    async fn record(&mut self, record: &SweepRecord) -> Result<()> {
        self.writer
            .serialize(record)
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        self.writer.flush()?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
