//! Download task - coordinates the part workers of one file
//!
//! This is the orchestrator for a single file. It probes the link, plans the
//! parts, runs them on a bounded pool and hands each finished part to the
//! [`PartReadyHandler`] as soon as it is on disk.

use crate::engine::part_worker::{fetch_whole, file_len, PartResult, PartWorker, TransferContext};
use crate::engine::plan::{part_path, partial_path, partition};
use crate::engine::progress::spawn_progress_reporter;
use crate::engine::remove_quietly;
use crate::engine::retry::with_retry;
use crate::error::FetchError;
use async_trait::async_trait;
use partfetch_types::{CoreEvent, RangeSpec, ReadyPart, RemoteFile};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, COOKIE};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives each part as soon as it is complete on disk
#[async_trait]
pub trait PartReadyHandler: Send + Sync {
    async fn on_part_ready(&self, part: ReadyPart) -> Result<(), FetchError>;

    /// Whether a delivered part now belongs to the handler
    ///
    /// When false the task still treats delivered parts as its own during
    /// cleanup.
    fn takes_ownership(&self) -> bool {
        true
    }
}

/// Leaves parts where they are, for callers that merge afterwards
pub struct HoldParts;

#[async_trait]
impl PartReadyHandler for HoldParts {
    async fn on_part_ready(&self, part: ReadyPart) -> Result<(), FetchError> {
        debug!("Holding part {} of {}", part.part_index, part.file_name);
        Ok(())
    }

    fn takes_ownership(&self) -> bool {
        false
    }
}

/// How a file was transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Everything was already on disk
    Cached,
    /// One range request for the whole file
    Single,
    /// Several range requests in parallel
    Split,
    /// Plain GET, the server does not do ranges
    Sequential,
}

/// A part of a finished download
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub range: RangeSpec,
    pub path: PathBuf,
}

/// Result of a successful download
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub task_id: Uuid,
    pub file_name: String,
    pub mode: TransferMode,
    /// In part index order
    pub parts: Vec<CompletedPart>,
    pub total_bytes: u64,
    /// Bytes transferred over the network in this run
    pub fetched_bytes: u64,
}

/// What the HEAD probe learned about the link
#[derive(Debug, Clone, Copy)]
struct Probe {
    size: Option<u64>,
    ranges: bool,
}

/// Bookkeeping for one part, whatever happened to it
struct PartRun {
    range: RangeSpec,
    finished: Option<PartResult>,
    delivered: bool,
    error: Option<FetchError>,
}

impl PartRun {
    fn new(range: RangeSpec) -> Self {
        Self {
            range,
            finished: None,
            delivered: false,
            error: None,
        }
    }
}

/// Hands finished parts to the handler and reports them
#[derive(Clone)]
struct Notifier {
    task_id: Uuid,
    file_name: String,
    handler: Arc<dyn PartReadyHandler>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl Notifier {
    async fn deliver(&self, part: &PartResult) -> Result<(), FetchError> {
        let ready = ReadyPart {
            task_id: self.task_id,
            file_name: self.file_name.clone(),
            path: part.path.clone(),
            part_index: part.range.part_index,
            total_parts: part.range.total_parts,
            len: part.len,
        };
        self.handler.on_part_ready(ready).await?;
        let _ = self.event_tx.send(CoreEvent::PartReady {
            id: self.task_id,
            part_index: part.range.part_index,
            total_parts: part.range.total_parts,
            len: part.len,
        });
        Ok(())
    }
}

/// A download of one remote file
pub struct RangeDownloadTask {
    id: Uuid,
    file: RemoteFile,
    part_size: u64,
    worker_count: usize,
    ctx: Arc<TransferContext>,
    user_cancel: CancellationToken,
    notifier: Notifier,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl RangeDownloadTask {
    /// `ctx.cancel` must be a child of `user_cancel`; the task cancels it to
    /// stop sibling parts after a fatal failure.
    pub(crate) fn new(
        id: Uuid,
        file: RemoteFile,
        part_size: u64,
        worker_count: usize,
        ctx: Arc<TransferContext>,
        user_cancel: CancellationToken,
        handler: Arc<dyn PartReadyHandler>,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        let notifier = Notifier {
            task_id: id,
            file_name: file.name.clone(),
            handler,
            event_tx: event_tx.clone(),
        };
        Self {
            id,
            file,
            part_size,
            worker_count: worker_count.max(1),
            ctx,
            user_cancel,
            notifier,
            event_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the download task
    pub async fn run(self) -> Result<DownloadOutcome, FetchError> {
        info!(
            "Starting download task {} for {} ({} bytes, {} workers)",
            self.id, self.file.name, self.file.size, self.worker_count
        );

        if self.user_cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        if let Some(outcome) = self.deliver_cached().await? {
            return Ok(outcome);
        }

        let probe = self.probe().await?;
        if self.user_cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let stop_reporter = CancellationToken::new();
        let reporter = spawn_progress_reporter(
            self.id,
            self.ctx.progress.clone(),
            self.event_tx.clone(),
            stop_reporter.clone(),
        );

        let result = match probe {
            Probe {
                size: Some(size),
                ranges: true,
            } if size > 0 => self.download_ranges(size).await,
            Probe { size, .. } => self.download_sequential(size).await,
        };

        stop_reporter.cancel();
        let _ = reporter.await;
        result
    }

    /// Deliver without any request when every artifact is already complete
    async fn deliver_cached(&self) -> Result<Option<DownloadOutcome>, FetchError> {
        if self.file.size == 0 {
            return Ok(None);
        }
        let ranges = partition(self.file.size, self.part_size);
        for range in &ranges {
            let path = part_path(&self.file.dest_path, range);
            if file_len(&path).await? != Some(range.len()) {
                return Ok(None);
            }
        }

        info!("{} is already complete on disk", self.file.name);
        let total_parts = ranges.len() as u32;
        self.emit_started(self.file.size, total_parts);
        self.ctx.disk.adopt(self.file.size);
        self.ctx.progress.set_total(self.file.size);
        self.ctx.progress.add(self.file.size);

        let mut parts = Vec::with_capacity(ranges.len());
        for (i, range) in ranges.iter().enumerate() {
            let part = PartResult {
                range: *range,
                path: part_path(&self.file.dest_path, range),
                len: range.len(),
                fetched: 0,
            };
            if let Err(e) = self.notifier.deliver(&part).await {
                let undelivered: u64 = ranges[i..].iter().map(|r| r.len()).sum();
                self.ctx.disk.release(undelivered);
                return Err(e.in_part(&self.file.name, range.part_index));
            }
            parts.push(CompletedPart {
                range: part.range,
                path: part.path,
            });
        }

        Ok(Some(DownloadOutcome {
            task_id: self.id,
            file_name: self.file.name.clone(),
            mode: TransferMode::Cached,
            parts,
            total_bytes: self.file.size,
            fetched_bytes: 0,
        }))
    }

    /// HEAD the link for its size and range support
    async fn probe(&self) -> Result<Probe, FetchError> {
        let what = format!("Probe of {}", self.file.name);
        with_retry(&self.ctx.retry, &self.ctx.cancel, &what, |_| async move {
            let credential = self.ctx.tokens.acquire().await?;
            let request = self
                .ctx
                .client
                .head(&self.ctx.link)
                .header(COOKIE, format!("accountToken={}", credential.as_str()))
                .timeout(self.ctx.request_timeout);
            let response = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(FetchError::Cancelled),
                response = request.send() => response?,
            };

            let status = response.status();
            if status == StatusCode::METHOD_NOT_ALLOWED {
                warn!("HEAD not allowed for {}, downloading sequentially", self.file.name);
                return Ok(Probe {
                    size: None,
                    ranges: false,
                });
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                self.ctx.tokens.invalidate(&credential).await;
            }
            if !status.is_success() {
                return Err(FetchError::Server {
                    status: status.as_u16(),
                    message: format!("probe of {} failed", self.file.name),
                });
            }

            let ranges = response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false);
            let size = match response.headers().get(CONTENT_LENGTH) {
                None => None,
                Some(value) => Some(
                    value
                        .to_str()
                        .ok()
                        .and_then(|s| s.trim().parse::<u64>().ok())
                        .ok_or_else(|| {
                            FetchError::Protocol(format!("malformed Content-Length: {:?}", value))
                        })?,
                ),
            };

            if let Some(size) = size {
                if self.file.size > 0 && size != self.file.size {
                    warn!(
                        "{} reports {} bytes, listing said {}; using the server's value",
                        self.file.name, size, self.file.size
                    );
                }
            }
            debug!("Probe of {}: size={:?} ranges={}", self.file.name, size, ranges);
            Ok(Probe { size, ranges })
        })
        .await
        .map_err(|e| e.in_part(&self.file.name, 0))
    }

    /// Parts in parallel, bounded by the worker count
    async fn download_ranges(&self, size: u64) -> Result<DownloadOutcome, FetchError> {
        let ranges = partition(size, self.part_size);
        let total_parts = ranges.len() as u32;
        let mode = if total_parts == 1 {
            TransferMode::Single
        } else {
            TransferMode::Split
        };
        info!(
            "Downloading {} in {} part(s) with up to {} workers",
            self.file.name, total_parts, self.worker_count
        );
        self.emit_started(size, total_parts);
        self.ctx.progress.set_total(size);

        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut join_set = JoinSet::new();

        for range in ranges.iter().copied() {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&semaphore);
            let notifier = self.notifier.clone();
            let dest = self.file.dest_path.clone();

            join_set.spawn(async move {
                let mut run = PartRun::new(range);
                let _permit = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        run.error = Some(FetchError::Cancelled);
                        return run;
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            run.error = Some(FetchError::Cancelled);
                            return run;
                        }
                    },
                };
                if ctx.cancel.is_cancelled() {
                    run.error = Some(FetchError::Cancelled);
                    return run;
                }

                match PartWorker::new(ctx, range, &dest).run().await {
                    Ok(part) => {
                        // The permit stays held while the handler applies backpressure
                        match notifier.deliver(&part).await {
                            Ok(()) => run.delivered = true,
                            Err(e) => run.error = Some(e),
                        }
                        run.finished = Some(part);
                    }
                    Err(e) => run.error = Some(e),
                }
                run
            });
        }

        let mut runs = Vec::with_capacity(ranges.len());
        let mut failure: Option<(u32, FetchError)> = None;

        while let Some(joined) = join_set.join_next().await {
            let mut run = match joined {
                Ok(run) => run,
                Err(e) => {
                    error!("Part worker for {} panicked: {}", self.file.name, e);
                    if failure.is_none() {
                        failure = Some((0, FetchError::Io(std::io::Error::other(e.to_string()))));
                        self.ctx.cancel.cancel();
                    }
                    continue;
                }
            };

            match run.error.take() {
                None => {}
                Some(FetchError::Cancelled) => {
                    debug!("Part {} of {} stopped", run.range.part_index, self.file.name);
                    if failure.is_none() && self.user_cancel.is_cancelled() {
                        failure = Some((run.range.part_index, FetchError::Cancelled));
                    }
                }
                Some(e) => {
                    error!("Part {} of {} failed: {}", run.range.part_index, self.file.name, e);
                    if failure.is_none() {
                        failure = Some((run.range.part_index, e));
                        // Stop the siblings; the file cannot complete
                        self.ctx.cancel.cancel();
                    }
                }
            }
            runs.push(run);
        }

        if self.user_cancel.is_cancelled() {
            failure = Some((0, FetchError::Cancelled));
        }

        if let Some((part, e)) = failure {
            let partials: Vec<PathBuf> = ranges
                .iter()
                .map(|r| partial_path(&part_path(&self.file.dest_path, r)))
                .collect();
            self.clean_up(&runs, &partials, &e).await;
            return Err(e.in_part(&self.file.name, part));
        }

        runs.sort_by_key(|r| r.range.part_index);
        let fetched_bytes = runs
            .iter()
            .filter_map(|r| r.finished.as_ref())
            .map(|p| p.fetched)
            .sum();
        let parts = runs
            .into_iter()
            .filter_map(|r| r.finished)
            .map(|p| CompletedPart {
                range: p.range,
                path: p.path,
            })
            .collect();

        info!("Download completed: {}", self.file.name);
        Ok(DownloadOutcome {
            task_id: self.id,
            file_name: self.file.name.clone(),
            mode,
            parts,
            total_bytes: size,
            fetched_bytes,
        })
    }

    /// One plain GET of the whole file
    async fn download_sequential(&self, size: Option<u64>) -> Result<DownloadOutcome, FetchError> {
        info!(
            "Downloading {} sequentially ({})",
            self.file.name,
            size.map(|s| format!("{} bytes", s))
                .unwrap_or_else(|| "unknown size".to_string())
        );
        self.emit_started(size.unwrap_or(0), 1);
        if let Some(size) = size {
            self.ctx.progress.set_total(size);
        }

        let whole = RangeSpec::whole(size.unwrap_or(0));
        let mut run = PartRun::new(whole);
        match fetch_whole(Arc::clone(&self.ctx), &self.file.dest_path, size).await {
            Ok(part) => {
                match self.notifier.deliver(&part).await {
                    Ok(()) => run.delivered = true,
                    Err(e) => run.error = Some(e),
                }
                run.finished = Some(part);
            }
            Err(e) => run.error = Some(e),
        }

        let error = if self.user_cancel.is_cancelled() {
            Some(FetchError::Cancelled)
        } else {
            run.error.take()
        };
        if let Some(e) = error {
            let partials = [partial_path(&self.file.dest_path)];
            self.clean_up(std::slice::from_ref(&run), &partials, &e).await;
            return Err(e.in_part(&self.file.name, 0));
        }

        let Some(part) = run.finished else {
            return Err(FetchError::Protocol("sequential download produced no file".to_string()));
        };
        info!("Download completed: {}", self.file.name);
        Ok(DownloadOutcome {
            task_id: self.id,
            file_name: self.file.name.clone(),
            mode: TransferMode::Sequential,
            total_bytes: part.len,
            fetched_bytes: part.fetched,
            parts: vec![CompletedPart {
                range: part.range,
                path: part.path,
            }],
        })
    }

    /// Release what the failed task still holds and remove what cannot be resumed
    async fn clean_up(&self, runs: &[PartRun], partials: &[PathBuf], cause: &FetchError) {
        let cancelled = matches!(cause, FetchError::Cancelled);
        let keep_partials = !cancelled
            && (cause.is_retryable() || matches!(cause, FetchError::DiskFull { .. }));

        for run in runs {
            let Some(part) = &run.finished else { continue };
            if run.delivered && self.notifier.handler.takes_ownership() {
                continue;
            }
            self.ctx.disk.release(part.len);
            if cancelled {
                remove_quietly(&part.path).await;
            }
        }

        if keep_partials {
            info!("Keeping partial files of {} for a later resume", self.file.name);
            return;
        }
        for path in partials {
            remove_quietly(path).await;
        }
    }

    fn emit_started(&self, size: u64, total_parts: u32) {
        let _ = self.event_tx.send(CoreEvent::FileStarted {
            id: self.id,
            name: self.file.name.clone(),
            size,
            total_parts,
        });
    }
}
