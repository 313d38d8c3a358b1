//! Poison-record handling.
//!
//! A record whose payload does not decode can never be processed, and
//! retrying it would stall its partition forever. Under
//! [`PoisonPolicy::Skip`] such records are counted, appended to a JSONL
//! dead-letter log, and skipped.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::record::{Record, TopicPartition};

/// What a consumer does with a record it cannot decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// Quarantine the record and keep consuming.
    #[default]
    Skip,
    /// Stop the consumer with an error.
    Fail,
}

/// An entry in the dead-letter log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition the record was read from.
    pub partition: u32,
    /// Offset of the record.
    pub offset: u64,
    /// Record key.
    pub key: String,
    /// Raw payload, lossily rendered as UTF-8.
    pub payload: String,
    /// Decode error message.
    pub error: String,
    /// Time of quarantine in milliseconds since the Unix epoch.
    pub ts_ms: i64,
}

/// Dead-letter sink plus a count of skipped records.
#[derive(Debug, Default)]
pub struct Quarantine {
    path: Option<PathBuf>,
    skipped: AtomicU64,
}

impl Quarantine {
    /// A quarantine that only counts.
    pub fn counting() -> Self {
        Self::default()
    }

    /// A quarantine that also appends to the JSONL file at `path`.
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            skipped: AtomicU64::new(0),
        }
    }

    /// Number of records quarantined so far.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Dead-letter log location, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Quarantine `record`.
    ///
    /// The record is counted even if the dead-letter write fails; the write
    /// failure is logged rather than returned, since it must not stop the
    /// partition.
    pub fn admit(&self, tp: &TopicPartition, record: &Record, error: &CodecError) {
        let total = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            partition = %tp,
            offset = record.offset,
            key = %record.key,
            error = %error,
            skipped_total = total,
            "skipping undecodable record"
        );
        let Some(path) = &self.path else {
            return;
        };
        let entry = DeadLetter {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset: record.offset,
            key: record.key.clone(),
            payload: String::from_utf8_lossy(&record.value).into_owned(),
            error: error.to_string(),
            ts_ms: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = append_dead_letter(path, &entry) {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "failed to write dead letter"
            );
        }
    }
}

/// Append a single dead-letter entry to the JSONL log at `path`.
pub(crate) fn append_dead_letter(path: &Path, entry: &DeadLetter) -> io::Result<()> {
    let json = serde_json::to_string(entry).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

/// Read every entry of a dead-letter log. Missing file means no entries.
///
/// # Errors
///
/// Returns `io::Error` on read failure or on a line that does not parse.
pub fn read_dead_letters(path: &Path) -> io::Result<Vec<DeadLetter>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)))
        .collect()
}
