//! Progress store - append-only JSONL log of enrichment outcomes
//!
//! 한 줄 = 완료된 McEntry 하나. 실행 중 크래시가 나도 이미 기록된 줄은 남으므로
//! 재시작 시 이 파일을 한 번 스캔해 재개 상태를 만든다.
//!
//! Concurrent batches share one store. Lines are serialized before the lock is
//! taken; the lock only covers the file write itself.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{CarrierKey, McEntry};

#[derive(Error, Debug)]
pub enum ProgressStoreError {
    #[error("progress log I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize progress record for {mc_number}: {source}")]
    Serialize {
        mc_number: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Every record read back from the log plus how many lines were unusable
#[derive(Debug, Default)]
pub struct ProgressScan {
    pub entries: Vec<McEntry>,
    pub malformed_lines: usize,
}

/// Resumption state derived from one scan
#[derive(Debug, Default, Clone)]
pub struct ResumeState {
    /// Keys with at least one complete record; skipped this run
    pub fully_enriched: HashSet<CarrierKey>,
    /// Keys whose records all still lack insurance status; retried first
    pub needs_reenrichment: HashSet<CarrierKey>,
    /// Most useful prior record per key, seeds the next attempt
    pub prior: HashMap<CarrierKey, McEntry>,
}

impl ResumeState {
    #[must_use]
    pub fn from_entries(entries: &[McEntry]) -> Self {
        let mut state = Self::default();
        for entry in entries {
            let key = entry.key();
            if key.is_empty() {
                continue;
            }
            if entry.needs_reenrichment() {
                if !state.fully_enriched.contains(&key) {
                    state.needs_reenrichment.insert(key.clone());
                }
            } else {
                state.needs_reenrichment.remove(&key);
                state.fully_enriched.insert(key.clone());
            }
            // later records carry the newest partial data
            state.prior.insert(key, entry.clone());
        }
        state
    }

    #[must_use]
    pub fn is_fully_enriched(&self, key: &CarrierKey) -> bool {
        self.fully_enriched.contains(key)
    }
}

/// Append-only JSONL progress log
pub struct ProgressStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl ProgressStore {
    /// Open (or create) the log in append mode
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ProgressStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| ProgressStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| ProgressStoreError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record
    pub async fn append(&self, entry: &McEntry) -> Result<(), ProgressStoreError> {
        self.append_all(std::slice::from_ref(entry)).await
    }

    /// Append records as whole lines; a concurrent writer never interleaves
    pub async fn append_all(&self, entries: &[McEntry]) -> Result<(), ProgressStoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buffer = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry).map_err(|source| ProgressStoreError::Serialize {
                mc_number: entry.mc_number.clone(),
                source,
            })?;
            buffer.push(b'\n');
        }

        let io_err = |source| ProgressStoreError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = self.file.lock().await;
        file.write_all(&buffer).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        drop(file);

        debug!("Appended {} record(s) to {:?}", entries.len(), self.path);
        Ok(())
    }

    /// Read every record from the log at `path`; a missing file is an empty log
    pub async fn scan(path: impl AsRef<Path>) -> Result<ProgressScan, ProgressStoreError> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No progress log at {:?}, starting fresh", path);
                return Ok(ProgressScan::default());
            }
            Err(source) => {
                return Err(ProgressStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let mut scan = ProgressScan::default();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<McEntry>(line) {
                Ok(entry) => scan.entries.push(entry),
                Err(e) => {
                    scan.malformed_lines += 1;
                    warn!("⚠️ Skipping malformed progress line {} in {:?}: {}", line_no + 1, path, e);
                }
            }
        }

        info!(
            "📂 Progress log {:?}: {} record(s), {} malformed line(s)",
            path,
            scan.entries.len(),
            scan.malformed_lines
        );
        Ok(scan)
    }

    /// Scan this store's own log
    pub async fn load(&self) -> Result<ProgressScan, ProgressStoreError> {
        Self::scan(&self.path).await
    }
}
