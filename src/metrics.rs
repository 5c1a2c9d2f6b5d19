use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;

/// Destination for epoch-indexed scalar series.
pub trait MetricsSink {
    fn add_record(&mut self, record: ScalarRecord) -> Result<()>;

    fn add_scalar(&mut self, tag: &str, value: f32, epoch: usize) -> Result<()> {
        self.add_record(ScalarRecord {
            tag: tag.to_string(),
            series: None,
            epoch,
            value,
        })
    }

    /// Several named series under one tag, e.g. train and validation on one chart.
    fn add_scalars(&mut self, tag: &str, values: &[(&str, f32)], epoch: usize) -> Result<()> {
        for &(series, value) in values {
            self.add_record(ScalarRecord {
                tag: tag.to_string(),
                series: Some(series.to_string()),
                epoch,
                value,
            })?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    pub epoch: usize,
    pub value: f32,
}

/// Appends one JSON object per scalar to `metrics_<machine>.jsonl` and echoes
/// each value to the log.
pub struct JsonlMetrics {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlMetrics {
    pub fn create(dir: &Path, machine_type: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("metrics_{machine_type}.jsonl"));
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetrics {
    fn add_record(&mut self, record: ScalarRecord) -> Result<()> {
        match &record.series {
            Some(series) => log::info!(
                "epoch {:>3} {}[{series}] = {:.6}",
                record.epoch,
                record.tag,
                record.value
            ),
            None => log::info!("epoch {:>3} {} = {:.6}", record.epoch, record.tag, record.value),
        }
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every scalar in memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    pub records: Vec<ScalarRecord>,
}

impl MemoryMetrics {
    /// Values logged with `add_scalar` under `tag`.
    pub fn series(&self, tag: &str) -> Vec<f32> {
        self.records
            .iter()
            .filter(|r| r.tag == tag && r.series.is_none())
            .map(|r| r.value)
            .collect()
    }

    /// Values logged with `add_scalars` under `tag` for one named series.
    pub fn grouped(&self, tag: &str, series: &str) -> Vec<f32> {
        self.records
            .iter()
            .filter(|r| r.tag == tag && r.series.as_deref() == Some(series))
            .map(|r| r.value)
            .collect()
    }
}

impl MetricsSink for MemoryMetrics {
    fn add_record(&mut self, record: ScalarRecord) -> Result<()> {
        self.records.push(record);
        Ok(())
    }
}
