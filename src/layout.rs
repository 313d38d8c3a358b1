//! On-disk directory layout for file-backed brokers and state stores.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Manages the on-disk directory layout under a single data directory.
///
/// ```text
/// <base_dir>/
///     log/
///         <topic>/
///             topic.json          -- partition count
///             <partition>.jsonl   -- one record per line
///     offsets/
///         <group>.json            -- committed offsets
///     snapshots/
///         <owner>/<topic>/<partition>.json
///     dead_letters/
///         <owner>.jsonl
/// ```
///
/// Cheap to clone (wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct DataLayout {
    base_dir: PathBuf,
}

/// Contents of `topic.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TopicMeta {
    pub partitions: u32,
}

impl DataLayout {
    /// Create a layout rooted at `base_dir`. Nothing is created on disk
    /// until a component writes.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/log`
    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("log")
    }

    /// `<base_dir>/log/<topic>`
    pub fn topic_dir(&self, topic: &str) -> PathBuf {
        self.log_dir().join(topic)
    }

    /// `<base_dir>/log/<topic>/<partition>.jsonl`
    pub fn segment_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.topic_dir(topic).join(format!("{partition}.jsonl"))
    }

    /// `<base_dir>/offsets/<group>.json`
    pub fn offsets_path(&self, group: &str) -> PathBuf {
        self.base_dir.join("offsets").join(format!("{group}.json"))
    }

    /// `<base_dir>/snapshots/<owner>/<topic>/<partition>.json`
    ///
    /// `owner` separates shards of the same changelog held by different
    /// components (`processor-<group>` and `view-<owner>`).
    pub fn snapshot_path(&self, owner: &str, topic: &str, partition: u32) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(owner)
            .join(topic)
            .join(format!("{partition}.json"))
    }

    /// `<base_dir>/dead_letters/<owner>.jsonl`
    pub fn dead_letter_path(&self, owner: &str) -> PathBuf {
        self.base_dir
            .join("dead_letters")
            .join(format!("{owner}.jsonl"))
    }

    /// Ensures the topic directory and its metadata file exist.
    ///
    /// Idempotent. Returns the partition count on record, which is the
    /// existing count when the topic was already present (the caller decides
    /// whether a mismatch is an error).
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if directory creation or file I/O fails, or if an
    /// existing `topic.json` cannot be parsed.
    pub(crate) fn ensure_topic(&self, topic: &str, partitions: u32) -> io::Result<u32> {
        let dir = self.topic_dir(topic);
        fs::create_dir_all(&dir)?;
        let meta_path = dir.join("topic.json");
        match fs::read(&meta_path) {
            Ok(bytes) => {
                let meta: TopicMeta = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(meta.partitions)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let json = serde_json::to_vec(&TopicMeta { partitions })
                    .map_err(io::Error::other)?;
                write_atomic(&meta_path, &json)?;
                Ok(partitions)
            }
            Err(e) => Err(e),
        }
    }

    /// Lists all topics with their partition counts, sorted by name.
    ///
    /// Directories without a readable `topic.json` are skipped with a
    /// warning. Returns an empty vector if the log directory does not exist.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the log directory fails for a reason
    /// other than it not existing.
    pub(crate) fn list_topics(&self) -> io::Result<Vec<(String, u32)>> {
        let entries = match fs::read_dir(self.log_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut topics = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta_path = entry.path().join("topic.json");
            match fs::read(&meta_path)
                .ok()
                .and_then(|b| serde_json::from_slice::<TopicMeta>(&b).ok())
            {
                Some(meta) => topics.push((name, meta.partitions)),
                None => tracing::warn!(
                    path = %meta_path.display(),
                    "topic directory without readable metadata, skipping"
                ),
            }
        }
        topics.sort();
        Ok(topics)
    }
}

/// Write `bytes` to `path` atomically.
///
/// Writes a uniquely named temp file next to `path` then renames it over
/// `path`, so readers never observe a partially-written file and
/// concurrent writers never share a temp file. Creates parent directories.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, writing, or renaming fails.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
