//! JSON blob persistence for TideOps control-plane state.
//!
//! Provides [`BlobStore`], a single-document JSON store the *caller* of the
//! engines uses to keep the instance-refresh record between control ticks.
//! The engines themselves never touch storage.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A JSON file holding one document.
///
/// Data lives at `{dir}/state/{name}.json` and is rewritten whole on every
/// save.
pub struct BlobStore {
    path: PathBuf,
}

impl BlobStore {
    pub fn new(dir: &Path, name: &str) -> Self {
        let path = dir.join("state").join(format!("{name}.json"));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. Returns `None` when the file is missing or does not
    /// parse; a corrupt blob is logged and treated as absent.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "corrupt state blob, treating as absent");
                    None
                }
            },
            Err(_) => {
                debug!(path = %self.path.display(), "no state blob yet");
                None
            }
        }
    }

    /// Write the document, creating parent directories as needed.
    pub fn save<T: Serialize>(&self, value: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }

    /// Remove the document if present.
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
