//! Durable resume store.
//!
//! A single JSON file holding `{workingDirectory, resumableId}` pairs. It is
//! written at shutdown (replacing prior contents) and read once at startup:
//! [`ResumeStore::take`] removes the file after reading it.

use std::path::{Path, PathBuf};
use tether_core::{ResumableEntry, TetherError, TetherResult};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored pairs with `entries`.
    ///
    /// Writes a sibling temp file and renames it over the target so a crash
    /// mid-write never leaves a truncated record.
    pub async fn save(&self, entries: &[ResumableEntry]) -> TetherResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!(path = %self.path.display(), count = entries.len(), "saved resumable sessions");
        Ok(())
    }

    /// Read the stored pairs and clear the store.
    ///
    /// A missing file yields an empty list. An unreadable record is discarded
    /// with a warning rather than blocking startup.
    pub async fn take(&self) -> TetherResult<Vec<ResumableEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no resumable sessions stored");
                return Ok(Vec::new());
            }
            Err(e) => return Err(TetherError::Io(e)),
        };
        tokio::fs::remove_file(&self.path).await?;

        match serde_json::from_slice::<Vec<ResumableEntry>>(&bytes) {
            Ok(entries) => {
                info!(path = %self.path.display(), count = entries.len(), "loaded resumable sessions");
                Ok(entries)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding corrupt resume store");
                Ok(Vec::new())
            }
        }
    }
}
