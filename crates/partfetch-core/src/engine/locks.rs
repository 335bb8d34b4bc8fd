//! Per-destination exclusion for downloads within one process

use crate::error::FetchError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry of destination paths currently being downloaded
#[derive(Debug, Clone, Default)]
pub struct DestinationLocks {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path`, failing fast if another download holds it
    pub fn acquire(&self, path: &Path) -> Result<DestinationLock, FetchError> {
        let mut held = self.held.lock();
        if !held.insert(path.to_path_buf()) {
            return Err(FetchError::DestinationBusy(path.to_path_buf()));
        }
        Ok(DestinationLock {
            path: path.to_path_buf(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.held.lock().contains(path)
    }
}

/// Releases its path when dropped
#[derive(Debug)]
pub struct DestinationLock {
    path: PathBuf,
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        self.held.lock().remove(&self.path);
    }
}
