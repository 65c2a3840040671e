use crate::clock::datetime_file_string;
use crate::error::{AppError, Result};
use crate::reading::Payload;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

const ENTRY_EXTENSION: &str = "json";

/// Same-second collisions get a numeric suffix; give up after this many.
const MAX_NAME_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueEntry {
    pub name: String,
    pub path: PathBuf,
}

/// Directory of pending uploads, one serialized [`Payload`] per file.
///
/// File names come from the capture timestamp, so name order is
/// chronological order.
#[derive(Debug, Clone)]
pub struct UploadQueue {
    dir: PathBuf,
}

impl UploadQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `payload` to a new entry. Existing entries are never overwritten.
    pub fn enqueue(&self, payload: &Payload) -> Result<QueueEntry> {
        std::fs::create_dir_all(&self.dir)?;

        let body = serde_json::to_vec(payload)?;
        let stem = datetime_file_string(&payload.timestamp);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&body)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{}.{}", stem, ENTRY_EXTENSION)
            } else {
                format!("{}_{}.{}", stem, attempt, ENTRY_EXTENSION)
            };
            let path = self.dir.join(&name);

            match tmp.persist_noclobber(&path) {
                Ok(_) => {
                    info!("Queued reading for upload as {}", name);
                    return Ok(QueueEntry { name, path });
                }
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                    tmp = e.file;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::InvalidData(format!(
            "No free queue entry name for timestamp {}",
            stem
        )))
    }

    /// Pending entries sorted by name, oldest first.
    pub fn list_pending(&self) -> Result<Vec<QueueEntry>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            ENTRY_EXTENSION
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| AppError::InvalidData(format!("Bad queue pattern: {}", e)))?;

        let mut entries = Vec::new();
        for path in paths {
            let path = path.map_err(|e| AppError::Io(e.into()))?;
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                entries.push(QueueEntry {
                    name: name.to_string(),
                    path: path.clone(),
                });
            }
        }

        entries.sort();
        Ok(entries)
    }

    /// Reads an entry back, tagging the payload with its source file.
    pub fn load(&self, entry: &QueueEntry) -> Result<Payload> {
        let content = std::fs::read(&entry.path)?;
        let mut payload: Payload = serde_json::from_slice(&content)?;
        payload.source_file = Some(entry.name.clone());
        Ok(payload)
    }

    /// Deletes an entry. Missing entries are not an error.
    pub fn remove(&self, entry: &QueueEntry) -> Result<()> {
        self.remove_named(&entry.name)
    }

    pub fn remove_named(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.dir.join(name)) {
            Ok(()) => {
                debug!("Removed queue entry {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn count(&self) -> usize {
        let Ok(read_dir) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        read_dir
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map_or(false, |ext| ext == ENTRY_EXTENSION)
            })
            .count()
    }
}
