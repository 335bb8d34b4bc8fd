//! Error types for partfetch core

use std::path::PathBuf;
use thiserror::Error;

/// Why a content lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveErrorKind {
    NotFound,
    PasswordRejected,
    Unavailable,
}

impl std::fmt::Display for ResolveErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveErrorKind::NotFound => write!(f, "content not found"),
            ResolveErrorKind::PasswordRejected => write!(f, "password required or rejected"),
            ResolveErrorKind::Unavailable => write!(f, "content unavailable"),
        }
    }
}

/// Errors that can occur in partfetch core
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Could not resolve {id}: {kind}")]
    Resolve { id: String, kind: ResolveErrorKind },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Download of {file} failed at part {part}: {source}")]
    Download {
        file: String,
        part: u32,
        #[source]
        source: Box<FetchError>,
    },

    #[error("Disk budget exceeded: {required} bytes required, {available} available")]
    DiskFull { required: u64, available: u64 },

    #[error("Merge into {path:?} failed: {source}")]
    Merge {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Destination already being downloaded: {0:?}")]
    DestinationBusy(PathBuf),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Sink error: {0}")]
    Sink(String),
}

impl FetchError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(e) => !e.is_builder() && !e.is_redirect(),
            FetchError::Timeout => true,
            FetchError::Server { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429 || is_auth_status(*status)
            }
            FetchError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// The server rejected our credential
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, FetchError::Server { status, .. } if is_auth_status(*status))
    }

    /// Wrap an error as the terminal failure of one part of a file
    pub fn in_part(self, file: &str, part: u32) -> FetchError {
        match self {
            e @ (FetchError::Cancelled
            | FetchError::DiskFull { .. }
            | FetchError::Download { .. }) => e,
            e => FetchError::Download {
                file: file.to_string(),
                part,
                source: Box::new(e),
            },
        }
    }
}

fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 403
}
