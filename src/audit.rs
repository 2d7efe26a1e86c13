//! Append-only JSON-lines audit log, one entry per run.
//!
//! Before each append, entries older than the retention window are dropped
//! by rewriting the file through a temp file in the same directory and
//! renaming it into place. Pruning is best-effort; a failed prune never
//! blocks the append.

use crate::config::AuditConfig;
use crate::error::ExtractError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAX_RETENTION_HOURS: u64 = 24 * 365 * 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// One run, as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub status: AuditStatus,
    /// File name of the input document.
    pub file: String,
    /// SHA-256 of the document bytes.
    pub sha256: String,
    pub provider_id: String,
    pub provider_name: String,
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handle on one audit log file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    retention_hours: Option<u64>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>, retention_hours: Option<u64>) -> Self {
        Self {
            path: path.into(),
            retention_hours,
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(config.path.clone(), config.retention_hours)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prune, then append `entry` as a single JSON line.
    pub async fn record(&self, entry: AuditEntry) -> Result<(), ExtractError> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.record_blocking(&entry))
            .await
            .map_err(|e| ExtractError::Internal(format!("audit task panicked: {e}")))?
    }

    fn record_blocking(&self, entry: &AuditEntry) -> Result<(), ExtractError> {
        if let Some(hours) = self.retention_hours {
            let hours = hours.min(MAX_RETENTION_HOURS) as i64;
            let cutoff = entry.timestamp - ChronoDuration::hours(hours);
            if let Err(e) = self.prune_before(cutoff) {
                warn!("Audit log prune failed for {}: {}", self.path.display(), e);
            }
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;
        }
        let line = serde_json::to_string(entry)
            .map_err(|e| ExtractError::Internal(format!("audit entry serialisation: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.write_error(e))?;
        writeln!(file, "{line}").map_err(|e| self.write_error(e))?;
        debug!("Audit entry appended to {}", self.path.display());
        Ok(())
    }

    /// Drop entries whose timestamp is before `cutoff`. Lines that do not
    /// parse are kept untouched.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> std::io::Result<usize> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let expired = serde_json::from_str::<AuditEntry>(&line)
                .map(|e| e.timestamp < cutoff)
                .unwrap_or(false);
            if expired {
                dropped += 1;
            } else {
                kept.push(line);
            }
        }
        if dropped == 0 {
            return Ok(0);
        }

        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for line in &kept {
            writeln!(tmp, "{line}")?;
        }
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!("Pruned {} expired audit entries", dropped);
        Ok(dropped)
    }

    /// Every parseable entry currently in the log.
    pub fn read_entries(&self) -> Result<Vec<AuditEntry>, ExtractError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.write_error(e)),
        };
        Ok(text
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    fn write_error(&self, source: std::io::Error) -> ExtractError {
        ExtractError::OutputWriteFailed {
            path: self.path.clone(),
            source,
        }
    }
}
