//! Range download engine
//!
//! This module implements the resumable transfer path:
//! - Range planning and on-disk part naming
//! - Per-part workers that append to `.partial` files
//! - A bounded worker pool per file with retry and backoff
//! - Per-part completion callbacks and an optional merge

mod download_task;
mod locks;
mod merge;
mod part_worker;
mod plan;
mod progress;
mod range_engine;
mod retry;

pub use download_task::*;
pub use locks::*;
pub use merge::*;
pub use plan::*;
pub use progress::*;
pub use range_engine::*;
pub use retry::*;

use std::path::Path;
use tracing::{debug, warn};

/// Remove a file, treating "already gone" as success
pub(crate) async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}
