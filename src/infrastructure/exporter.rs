//! Atomic exporter - temp file in the destination directory, then rename
//!
//! 읽는 쪽은 절대 부분적으로 쓰인 파일을 보지 않는다. 쓰기 도중 실패하면
//! 임시 파일만 사라지고 기존 결과 파일은 그대로 남는다.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, WriterBuilder};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::domain::FlatRecord;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("export I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("export task failed: {0}")]
    Task(String),
}

/// Fully written temp file waiting to replace its destination
pub struct StagedFile {
    temp: NamedTempFile,
    destination: PathBuf,
}

impl StagedFile {
    /// Write `contents` into a temp file beside `destination` and flush it to disk
    pub fn write<F>(destination: &Path, contents: F) -> Result<Self, ExportError>
    where
        F: FnOnce(&mut dyn Write) -> Result<(), ExportError>,
    {
        let dir = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_err = |source| ExportError::Io {
            path: destination.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let mut temp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            contents(&mut writer)?;
            writer.flush().map_err(io_err)?;
        }
        temp.as_file().sync_all().map_err(io_err)?;

        Ok(Self {
            temp,
            destination: destination.to_path_buf(),
        })
    }

    #[must_use]
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically rename over the destination
    pub fn commit(self) -> Result<PathBuf, ExportError> {
        let destination = self.destination;
        self.temp
            .persist(&destination)
            .map_err(|e| ExportError::Io {
                path: destination.clone(),
                source: e.error,
            })?;
        Ok(destination)
    }
}

/// Write `destination` atomically
pub fn write_atomic<F>(destination: &Path, contents: F) -> Result<PathBuf, ExportError>
where
    F: FnOnce(&mut dyn Write) -> Result<(), ExportError>,
{
    StagedFile::write(destination, contents)?.commit()
}

pub fn write_json(destination: &Path, records: &[FlatRecord]) -> Result<PathBuf, ExportError> {
    write_atomic(destination, |w| {
        serde_json::to_writer_pretty(&mut *w, records)?;
        Ok(())
    })
}

/// Every field quoted, header row in the fixed column order
pub fn write_csv(destination: &Path, records: &[FlatRecord]) -> Result<PathBuf, ExportError> {
    write_atomic(destination, |w| {
        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Always)
            .from_writer(w);
        if records.is_empty() {
            writer.write_record(crate::domain::CSV_COLUMNS)?;
        }
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush().map_err(csv::Error::from)?;
        Ok(())
    })
}

/// Paths of one export
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub json_path: PathBuf,
    pub csv_path: PathBuf,
    pub records: usize,
}

/// JSON + CSV pair written side by side
#[derive(Debug, Clone)]
pub struct AtomicExporter {
    json_path: PathBuf,
    csv_path: PathBuf,
}

impl AtomicExporter {
    #[must_use]
    pub const fn new(json_path: PathBuf, csv_path: PathBuf) -> Self {
        Self { json_path, csv_path }
    }

    pub fn export(&self, records: &[FlatRecord]) -> Result<ExportReport, ExportError> {
        let json_path = write_json(&self.json_path, records)?;
        let csv_path = write_csv(&self.csv_path, records)?;
        info!(
            "💾 Exported {} record(s) to {:?} and {:?}",
            records.len(),
            json_path,
            csv_path
        );
        Ok(ExportReport {
            json_path,
            csv_path,
            records: records.len(),
        })
    }

    /// [`Self::export`] on the blocking pool
    pub async fn export_async(&self, records: Vec<FlatRecord>) -> Result<ExportReport, ExportError> {
        let exporter = self.clone();
        tokio::task::spawn_blocking(move || exporter.export(&records))
            .await
            .map_err(|e| ExportError::Task(e.to_string()))?
    }
}
