//! Shared types for partfetch
//!
//! This crate contains the data structures shared between the core engine
//! and the CLI: the remote content tree, byte ranges, ready parts,
//! settings and the events the core broadcasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Content Types
// ============================================================================

/// A node of the remote content tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentNode {
    File {
        id: String,
        name: String,
        link: String,
        size: u64,
    },
    Folder {
        id: String,
        name: String,
        children: Vec<ContentNode>,
    },
}

impl ContentNode {
    pub fn id(&self) -> &str {
        match self {
            ContentNode::File { id, .. } | ContentNode::Folder { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ContentNode::File { name, .. } | ContentNode::Folder { name, .. } => name,
        }
    }
}

/// A downloadable file, flattened out of the content tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub link: String,
    /// Size reported by the content API (0 if unknown)
    pub size: u64,
    /// Local destination for the single-part artifact
    pub dest_path: PathBuf,
}

impl RemoteFile {
    /// Directory the artifacts of this file are written to
    pub fn dest_dir(&self) -> &Path {
        self.dest_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

// ============================================================================
// Range Types
// ============================================================================

/// A contiguous byte range of a remote file
///
/// Only the range of an empty file has no bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub start: u64,
    len: u64,
    pub part_index: u32,
    pub total_parts: u32,
}

impl RangeSpec {
    /// Range over `start..=end`
    pub fn new(start: u64, end: u64, part_index: u32, total_parts: u32) -> Self {
        Self {
            start,
            len: end - start + 1,
            part_index,
            total_parts,
        }
    }

    /// The single range covering a whole file of `len` bytes
    pub fn whole(len: u64) -> Self {
        Self {
            start: 0,
            len,
            part_index: 0,
            total_parts: 1,
        }
    }

    /// Number of bytes covered by this range
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inclusive end offset, or None for an empty range
    pub fn end(&self) -> Option<u64> {
        self.len.checked_sub(1).map(|last| self.start + last)
    }

    pub fn is_single(&self) -> bool {
        self.total_parts == 1
    }

    /// `Range` header value for fetching this range from `offset` bytes in
    pub fn header_from(&self, offset: u64) -> String {
        let end = self.start + self.len.saturating_sub(1);
        format!("bytes={}-{}", self.start + offset, end)
    }
}

/// A completed part handed to the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPart {
    pub task_id: Uuid,
    pub file_name: String,
    pub path: PathBuf,
    pub part_index: u32,
    pub total_parts: u32,
    pub len: u64,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts per range, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Add random jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Base delay before retry number `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_dir: PathBuf,
    /// Per-part size ceiling in bytes
    pub part_size: u64,
    /// Concurrent range requests per file
    pub workers: u32,
    /// Disk budget ceiling in bytes
    pub max_disk_bytes: u64,
    /// Free space to always leave on the filesystem
    pub min_free_space: u64,
    /// Capacity of the part-ready channel
    pub channel_capacity: usize,
    /// Delete each part once the sink consumed it
    pub delete_after_sink: bool,
    /// Concatenate multi-part downloads into one file before handing off
    pub merge_parts: bool,
    pub api_base: String,
    pub website_token: Option<String>,
    /// Pre-issued account token; skips token issuance
    pub account_token: Option<String>,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Maximum time to wait for the next body chunk
    pub stall_timeout_secs: u64,
    pub retry: RetryPolicy,
}

pub const DEFAULT_PART_SIZE: u64 = 2 * 1024 * 1024 * 1024;

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir()
                .map(|p| p.join("partfetch"))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            part_size: DEFAULT_PART_SIZE,
            workers: 2,
            max_disk_bytes: 10 * 1024 * 1024 * 1024,
            min_free_space: 512 * 1024 * 1024,
            channel_capacity: 4,
            delete_after_sink: true,
            merge_parts: false,
            api_base: "https://api.gofile.io".to_string(),
            website_token: None,
            account_token: None,
            user_agent: "Mozilla/5.0 (partfetch)".to_string(),
            connect_timeout_secs: 30,
            request_timeout_secs: 60,
            stall_timeout_secs: 120,
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path).map_err(|e| SettingsError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let settings: Settings = serde_json::from_str(&raw).map_err(|e| SettingsError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        settings.validate().map_err(|message| SettingsError {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(settings)
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<(), String> {
        if self.part_size == 0 {
            return Err("part_size must be greater than zero".to_string());
        }
        if self.workers == 0 {
            return Err("workers must be at least 1".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Failure to load a settings file
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid settings file {}: {message}", .path.display())]
pub struct SettingsError {
    pub path: PathBuf,
    pub message: String,
}

// ============================================================================
// Event Types
// ============================================================================

/// Final state of one file in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Events emitted by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Resolved {
        root: String,
        files: usize,
        total_bytes: u64,
    },
    FileStarted {
        id: Uuid,
        name: String,
        size: u64,
        total_parts: u32,
    },
    DownloadProgress {
        id: Uuid,
        downloaded: u64,
        total: u64,
        speed: u64,
        eta: Option<u64>, // seconds
    },
    PartReady {
        id: Uuid,
        part_index: u32,
        total_parts: u32,
        len: u64,
    },
    PartConsumed {
        id: Uuid,
        part_index: u32,
    },
    FileFinished {
        id: Uuid,
        name: String,
        status: FileStatus,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    },
}
