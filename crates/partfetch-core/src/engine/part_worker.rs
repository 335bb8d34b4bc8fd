//! Part worker - downloads a single byte range to its own file
//!
//! Each worker owns one `<part>.partial` file and appends to it, so a
//! retried or resumed request only asks for the bytes still missing. The
//! file is renamed to its final name once the whole range is on disk.

use crate::auth::TokenManager;
use crate::disk::DiskBudgetGuard;
use crate::engine::plan::{part_path, partial_path};
use crate::engine::progress::ProgressCounter;
use crate::engine::retry::with_retry;
use crate::error::FetchError;
use futures::StreamExt;
use partfetch_types::{RangeSpec, RetryPolicy};
use reqwest::header::{HeaderMap, CONTENT_RANGE, COOKIE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a worker needs that is shared by all parts of one file
pub struct TransferContext {
    pub client: Client,
    pub tokens: Arc<TokenManager>,
    pub disk: Arc<DiskBudgetGuard>,
    pub progress: ProgressCounter,
    /// Fires on user cancellation or when a sibling part failed for good
    pub cancel: CancellationToken,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub stall_timeout: Duration,
    pub link: String,
    pub file_name: String,
}

/// A part that is complete on disk
#[derive(Debug, Clone)]
pub struct PartResult {
    pub range: RangeSpec,
    pub path: PathBuf,
    pub len: u64,
    /// Bytes transferred over the network for this part in this run
    pub fetched: u64,
}

/// What is on disk for a part before it starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Complete,
    Partial(u64),
    Absent,
}

/// Downloads one range of a file
pub struct PartWorker {
    ctx: Arc<TransferContext>,
    range: RangeSpec,
    final_path: PathBuf,
    partial_path: PathBuf,
}

impl PartWorker {
    pub fn new(ctx: Arc<TransferContext>, range: RangeSpec, dest: &Path) -> Self {
        let final_path = part_path(dest, &range);
        let partial_path = partial_path(&final_path);
        Self {
            ctx,
            range,
            final_path,
            partial_path,
        }
    }

    /// Inspect existing artifacts for this part
    pub async fn inspect(&self) -> Result<PartState, FetchError> {
        if let Some(len) = file_len(&self.final_path).await? {
            if len == self.range.len() {
                return Ok(PartState::Complete);
            }
            warn!(
                "Part {} of {} has {} bytes, expected {}; fetching again",
                self.range.part_index,
                self.ctx.file_name,
                len,
                self.range.len()
            );
            tokio::fs::remove_file(&self.final_path).await?;
        }
        Ok(match file_len(&self.partial_path).await? {
            Some(len) => PartState::Partial(len),
            None => PartState::Absent,
        })
    }

    /// Run the part to completion
    pub async fn run(self) -> Result<PartResult, FetchError> {
        let expected = self.range.len();

        let state = self.inspect().await?;
        if state == PartState::Complete {
            info!(
                "Part {}/{} of {} already complete",
                self.range.part_index + 1,
                self.range.total_parts,
                self.ctx.file_name
            );
            self.ctx.disk.adopt(expected);
            self.ctx.progress.add(expected);
            return Ok(PartResult {
                range: self.range,
                path: self.final_path,
                len: expected,
                fetched: 0,
            });
        }

        if self.ctx.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        // Bytes from an earlier run are already on disk; only the rest is reserved
        let existing = match state {
            PartState::Partial(len) if len <= expected => len,
            _ => 0,
        };
        self.ctx.disk.adopt(existing);
        if let Err(e) = self.ctx.disk.try_reserve(expected - existing) {
            self.ctx.disk.release(existing);
            return Err(e);
        }

        let what = format!(
            "Part {}/{} of {}",
            self.range.part_index + 1,
            self.range.total_parts,
            self.ctx.file_name
        );
        let result = with_retry(&self.ctx.retry, &self.ctx.cancel, &what, |attempt| {
            self.fetch_once(attempt)
        })
        .await;

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                return_reservation(&self.ctx.disk, &self.partial_path, expected).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&self.partial_path, &self.final_path).await {
            self.ctx.disk.release(expected);
            return Err(e.into());
        }

        info!("{} complete ({} bytes fetched)", what, fetched);
        Ok(PartResult {
            range: self.range,
            path: self.final_path,
            len: expected,
            fetched,
        })
    }

    /// One request for whatever is still missing; returns bytes fetched
    async fn fetch_once(&self, attempt: u32) -> Result<u64, FetchError> {
        let expected = self.range.len();
        let mut existing = file_len(&self.partial_path).await?.unwrap_or(0);
        if existing > expected {
            warn!(
                "{:?} is longer than its range ({} > {}); restarting it",
                self.partial_path, existing, expected
            );
            tokio::fs::remove_file(&self.partial_path).await?;
            existing = 0;
        }
        if attempt == 1 {
            self.ctx.progress.add(existing);
        }
        if existing == expected {
            return Ok(0);
        }
        if self.ctx.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let credential = self.ctx.tokens.acquire().await?;
        let range_header = self.range.header_from(existing);
        debug!(
            "Part {} of {} requesting {} (attempt {})",
            self.range.part_index, self.ctx.file_name, range_header, attempt
        );

        let request = self
            .ctx
            .client
            .get(&self.ctx.link)
            .header(COOKIE, format!("accountToken={}", credential.as_str()))
            .header(RANGE, range_header);
        let response = send(&self.ctx, request).await?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                check_content_range(response.headers(), self.range.start + existing)?;
            }
            StatusCode::OK if existing == 0 && self.range.start == 0 && self.range.is_single() => {}
            StatusCode::OK => {
                return Err(FetchError::Protocol(format!(
                    "server ignored range request for part {} of {}",
                    self.range.part_index, self.ctx.file_name
                )));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.ctx.tokens.invalidate(&credential).await;
                return Err(FetchError::Server {
                    status: status.as_u16(),
                    message: "download token rejected".to_string(),
                });
            }
            _ => {
                return Err(FetchError::Server {
                    status: status.as_u16(),
                    message: format!("failed to download part {}", self.range.part_index),
                });
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.partial_path)
            .await?;
        let mut written = 0;
        let streamed = stream_body(response, &mut file, Some(expected - existing), &self.ctx, false, &mut written).await;
        file.flush().await?;
        file.sync_all().await?;
        streamed?;

        if existing + written < expected {
            return Err(FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended after {} of {} bytes", existing + written, expected),
            )));
        }
        Ok(written)
    }
}

/// Download the whole file with plain GETs, restarting from zero on retry
///
/// Used when the server does not support ranges. With an unknown size the
/// disk budget is reserved chunk by chunk as data arrives.
pub async fn fetch_whole(
    ctx: Arc<TransferContext>,
    dest: &Path,
    known_size: Option<u64>,
) -> Result<PartResult, FetchError> {
    let partial = partial_path(dest);
    if let Some(size) = known_size {
        if file_len(dest).await? == Some(size) {
            info!("{} already complete", ctx.file_name);
            ctx.disk.adopt(size);
            ctx.progress.add(size);
            return Ok(PartResult {
                range: RangeSpec::whole(size),
                path: dest.to_path_buf(),
                len: size,
                fetched: 0,
            });
        }
        if file_len(&partial).await?.is_some() {
            debug!("Discarding stale {:?}", partial);
            tokio::fs::remove_file(&partial).await?;
        }
        ctx.disk.try_reserve(size)?;
    }

    let chunk_reserved = AtomicU64::new(0);
    let what = format!("Sequential download of {}", ctx.file_name);
    let result = with_retry(&ctx.retry, &ctx.cancel, &what, |attempt| {
        let ctx = &ctx;
        let partial = &partial;
        let chunk_reserved = &chunk_reserved;
        async move {
            if attempt > 1 {
                let stale = file_len(partial).await?.unwrap_or(0);
                ctx.progress.rewind(stale);
                if known_size.is_some() {
                    // Truncated below but still reserved for the rewrite
                    ctx.disk.mark_unwritten(stale);
                } else {
                    ctx.disk.release(chunk_reserved.swap(0, Ordering::AcqRel));
                }
            }
            if ctx.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let credential = ctx.tokens.acquire().await?;
            let request = ctx
                .client
                .get(&ctx.link)
                .header(COOKIE, format!("accountToken={}", credential.as_str()));
            let response = send(ctx, request).await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ctx.tokens.invalidate(&credential).await;
            }
            if status != StatusCode::OK {
                return Err(FetchError::Server {
                    status: status.as_u16(),
                    message: format!("failed to download {}", ctx.file_name),
                });
            }

            let mut file = File::create(partial).await?;
            let mut written = 0;
            let streamed =
                stream_body(response, &mut file, known_size, ctx, known_size.is_none(), &mut written).await;
            if known_size.is_none() {
                chunk_reserved.fetch_add(written, Ordering::AcqRel);
            }
            file.flush().await?;
            file.sync_all().await?;
            streamed?;

            if let Some(size) = known_size {
                if written < size {
                    return Err(FetchError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("stream ended after {} of {} bytes", written, size),
                    )));
                }
            }
            Ok(written)
        }
    })
    .await;

    let reserved = known_size.unwrap_or_else(|| chunk_reserved.load(Ordering::Acquire));
    let written = match result {
        Ok(written) => written,
        Err(e) => {
            return_reservation(&ctx.disk, &partial, reserved).await;
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&partial, dest).await {
        ctx.disk.release(reserved);
        return Err(e.into());
    }

    info!("{} complete ({} bytes)", what, written);
    Ok(PartResult {
        range: RangeSpec::whole(written),
        path: dest.to_path_buf(),
        len: written,
        fetched: written,
    })
}

/// Send a request, bounded by the request timeout and the cancel token
async fn send(ctx: &TransferContext, request: RequestBuilder) -> Result<Response, FetchError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(FetchError::Cancelled),
        result = tokio::time::timeout(ctx.request_timeout, request.send()) => match result {
            Err(_) => Err(FetchError::Timeout),
            Ok(response) => Ok(response?),
        },
    }
}

/// Copy the response body into `file`, never writing more than `limit` bytes
async fn stream_body(
    response: Response,
    file: &mut File,
    limit: Option<u64>,
    ctx: &TransferContext,
    reserve_per_chunk: bool,
    written: &mut u64,
) -> Result<(), FetchError> {
    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(FetchError::Cancelled),
            next = tokio::time::timeout(ctx.stall_timeout, stream.next()) => next,
        };
        let chunk = match next {
            Err(_) => return Err(FetchError::Timeout),
            Ok(None) => return Ok(()),
            Ok(Some(chunk)) => chunk?,
        };

        let mut data = &chunk[..];
        let mut overflow = false;
        if let Some(limit) = limit {
            let remaining = limit - *written;
            if data.len() as u64 > remaining {
                data = &data[..remaining as usize];
                overflow = true;
            }
        }
        let len = data.len() as u64;
        if reserve_per_chunk {
            ctx.disk.try_reserve(len)?;
        }

        if let Err(e) = file.write_all(data).await {
            if reserve_per_chunk {
                ctx.disk.forfeit(len);
            }
            return Err(e.into());
        }
        ctx.disk.mark_written(len);
        *written += len;
        ctx.progress.add(len);

        if overflow {
            return Err(FetchError::Protocol(format!(
                "server sent more than the {} bytes requested",
                limit.unwrap_or_default()
            )));
        }
    }
}

/// Ensure a 206 response starts where we asked it to
fn check_content_range(headers: &HeaderMap, expected_start: u64) -> Result<(), FetchError> {
    let value = headers
        .get(CONTENT_RANGE)
        .ok_or_else(|| FetchError::Protocol("206 response without Content-Range".to_string()))?;
    let text = value
        .to_str()
        .map_err(|_| FetchError::Protocol("non-ASCII Content-Range".to_string()))?;
    let start = text
        .strip_prefix("bytes ")
        .and_then(|rest| rest.split('-').next())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| FetchError::Protocol(format!("malformed Content-Range: {}", text)))?;
    if start != expected_start {
        return Err(FetchError::Protocol(format!(
            "Content-Range starts at {} but {} was requested",
            start, expected_start
        )));
    }
    Ok(())
}

/// Give back a failed transfer's reservation of `reserved` bytes
///
/// Whatever made it into `path` is on disk; the rest was never written.
async fn return_reservation(disk: &DiskBudgetGuard, path: &Path, reserved: u64) {
    let on_disk = match file_len(path).await {
        Ok(len) => len.unwrap_or(0).min(reserved),
        Err(_) => 0,
    };
    disk.forfeit(reserved - on_disk);
    disk.release(on_disk);
}

/// Length of a file, or None if it does not exist
pub(crate) async fn file_len(path: &Path) -> Result<Option<u64>, FetchError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
