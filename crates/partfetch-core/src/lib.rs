//! partfetch core - resumable range downloads with streaming hand-off
//!
//! This crate resolves remote content trees, downloads each file as
//! independently resumable byte ranges, and hands every finished part to a
//! sink while the rest of the file is still downloading.

mod api;
mod auth;
mod disk;
mod engine;
mod error;
mod filter;
mod pipeline;
mod resolver;

pub use api::*;
pub use auth::*;
pub use disk::*;
pub use engine::*;
pub use error::*;
pub use filter::*;
pub use pipeline::*;
pub use resolver::*;

use chrono::Utc;
use partfetch_types::{CoreEvent, FileStatus, RangeSpec, ReadyPart, RemoteFile, Settings};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What to fetch from a root
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Glob patterns; empty means everything
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub password: Option<String>,
}

/// Outcome of one file in a batch
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub name: String,
    pub status: FileStatus,
    pub error: Option<String>,
    pub parts: usize,
    pub total_bytes: u64,
    pub fetched_bytes: u64,
}

/// Outcome of a whole batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
    pub sink: ConsumerReport,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.count(FileStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(FileStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(FileStatus::Cancelled)
    }

    /// Every file downloaded and every part accepted by the sink
    pub fn is_success(&self) -> bool {
        self.files.iter().all(|f| f.status == FileStatus::Completed) && self.sink.failed.is_empty()
    }

    fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }
}

/// The main partfetch instance
///
/// Holds one HTTP client, one token cache and one disk budget shared by
/// every file fetched through it.
pub struct FetchSession {
    settings: Settings,
    resolver: ContentResolver,
    tokens: Arc<TokenManager>,
    disk: Arc<DiskBudgetGuard>,
    engine: RangeDownloadEngine,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
    cancel: CancellationToken,
}

impl FetchSession {
    /// Create a session from validated settings
    pub fn new(settings: Settings) -> Result<Self, FetchError> {
        settings.validate().map_err(FetchError::Config)?;

        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(|e| FetchError::Config(format!("failed to build HTTP client: {}", e)))?;

        let api = ContentApi::new(
            client.clone(),
            settings.api_base.clone(),
            settings.website_token.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        );
        let tokens = Arc::new(match &settings.account_token {
            Some(token) => TokenManager::with_static(api.clone(), token),
            None => TokenManager::new(api.clone()),
        });
        let resolver = ContentResolver::new(api, Arc::clone(&tokens));
        let disk = Arc::new(
            DiskBudgetGuard::new(settings.max_disk_bytes)
                .with_fs_probe(&settings.download_dir, settings.min_free_space),
        );

        let (event_tx, _) = broadcast::channel(1000);
        let engine = RangeDownloadEngine::new(
            client,
            Arc::clone(&tokens),
            Arc::clone(&disk),
            EngineConfig::from_settings(&settings),
            event_tx.clone(),
        );

        Ok(Self {
            settings,
            resolver,
            tokens,
            disk,
            engine,
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn disk(&self) -> &Arc<DiskBudgetGuard> {
        &self.disk
    }

    pub fn engine(&self) -> &RangeDownloadEngine {
        &self.engine
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Stop everything; running downloads clean up their partial files
    pub fn cancel(&self) {
        info!("Cancelling session");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve `root` (id or share URL) into the files that would be fetched
    pub async fn resolve(
        &self,
        root: &str,
        request: &FetchRequest,
    ) -> Result<Vec<RemoteFile>, FetchError> {
        let options = ResolveOptions {
            dest_dir: self.settings.download_dir.clone(),
            include: request.include.clone(),
            exclude: request.exclude.clone(),
            password: request.password.clone(),
        };
        let files = self.resolver.resolve(root, &options).await?;
        self.emit(CoreEvent::Resolved {
            root: root.to_string(),
            files: files.len(),
            total_bytes: files.iter().map(|f| f.size).sum(),
        });
        Ok(files)
    }

    /// Resolve `root` and fetch everything in it into `sink`
    pub async fn fetch<S: PartSink + 'static>(
        &self,
        root: &str,
        request: &FetchRequest,
        sink: S,
    ) -> Result<(BatchReport, S), FetchError> {
        let files = self.resolve(root, request).await?;
        self.fetch_files(&files, sink).await
    }

    /// Fetch `files` one after another, streaming parts into `sink`
    ///
    /// A failing file is reported and the batch moves on. The sink keeps
    /// receiving parts while later files download.
    pub async fn fetch_files<S: PartSink + 'static>(
        &self,
        files: &[RemoteFile],
        sink: S,
    ) -> Result<(BatchReport, S), FetchError> {
        let (producer, done, consumer) = part_channel(
            self.settings.channel_capacity,
            self.settings.delete_after_sink,
            Arc::clone(&self.disk),
            self.event_tx.clone(),
            self.cancel.clone(),
        );
        let consumer = tokio::spawn(consumer.run(sink));

        let mut reports = Vec::with_capacity(files.len());
        for (i, file) in files.iter().enumerate() {
            info!("File {}/{}: {}", i + 1, files.len(), file.name);
            let task_id = Uuid::new_v4();

            let (status, error, outcome) = if self.cancel.is_cancelled() {
                (FileStatus::Cancelled, Some("not started".to_string()), None)
            } else {
                match self.fetch_one(task_id, file, &producer).await {
                    Ok(outcome) => (FileStatus::Completed, None, Some(outcome)),
                    Err(FetchError::Cancelled) => {
                        warn!("{} cancelled", file.name);
                        (FileStatus::Cancelled, None, None)
                    }
                    Err(e) => {
                        error!("{} failed: {}", file.name, e);
                        (FileStatus::Failed, Some(e.to_string()), None)
                    }
                }
            };

            self.emit(CoreEvent::FileFinished {
                id: task_id,
                name: file.name.clone(),
                status,
                error: error.clone(),
                finished_at: Utc::now(),
            });
            reports.push(FileReport {
                name: file.name.clone(),
                status,
                error,
                parts: outcome.as_ref().map(|o| o.parts.len()).unwrap_or(0),
                total_bytes: outcome.as_ref().map(|o| o.total_bytes).unwrap_or(0),
                fetched_bytes: outcome.as_ref().map(|o| o.fetched_bytes).unwrap_or(0),
            });
        }

        done.finish();
        drop(producer);
        let (sink_report, sink) = consumer
            .await
            .map_err(|e| FetchError::Sink(format!("part consumer panicked: {}", e)))?;

        let report = BatchReport {
            files: reports,
            sink: sink_report,
        };
        info!(
            "Batch finished: {} completed, {} failed, {} cancelled",
            report.completed(),
            report.failed(),
            report.cancelled()
        );
        Ok((report, sink))
    }

    async fn fetch_one(
        &self,
        task_id: Uuid,
        file: &RemoteFile,
        producer: &PartProducer,
    ) -> Result<DownloadOutcome, FetchError> {
        let workers = self.settings.workers as usize;
        if !self.settings.merge_parts {
            let handler = Arc::new(producer.clone());
            return self
                .engine
                .download_as(task_id, file, workers, handler, self.cancel.clone())
                .await;
        }

        let outcome = match self.merged_on_disk(task_id, file).await? {
            Some(outcome) => outcome,
            None => {
                let outcome = self
                    .engine
                    .download_as(task_id, file, workers, Arc::new(HoldParts), self.cancel.clone())
                    .await?;
                if let Err(e) = merge_parts(&outcome.parts, &file.dest_path, &self.disk).await {
                    // The parts stay on disk for the next run but nobody holds them now
                    self.disk.release(outcome.total_bytes);
                    return Err(e);
                }
                outcome
            }
        };

        producer
            .send(ReadyPart {
                task_id,
                file_name: file.name.clone(),
                path: file.dest_path.clone(),
                part_index: 0,
                total_parts: 1,
                len: outcome.total_bytes,
            })
            .await?;
        Ok(DownloadOutcome {
            parts: vec![CompletedPart {
                range: RangeSpec::whole(outcome.total_bytes),
                path: file.dest_path.clone(),
            }],
            ..outcome
        })
    }

    /// A merged file from an earlier run counts as done
    async fn merged_on_disk(
        &self,
        task_id: Uuid,
        file: &RemoteFile,
    ) -> Result<Option<DownloadOutcome>, FetchError> {
        if file.size == 0 {
            return Ok(None);
        }
        match tokio::fs::metadata(&file.dest_path).await {
            Ok(meta) if meta.len() == file.size => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        info!("{} is already merged on disk", file.name);
        self.disk.adopt(file.size);
        self.emit(CoreEvent::FileStarted {
            id: task_id,
            name: file.name.clone(),
            size: file.size,
            total_parts: 1,
        });
        Ok(Some(DownloadOutcome {
            task_id,
            file_name: file.name.clone(),
            mode: TransferMode::Cached,
            parts: Vec::new(),
            total_bytes: file.size,
            fetched_bytes: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: FileStatus) -> FileReport {
        FileReport {
            name: "f".into(),
            status,
            error: None,
            parts: 1,
            total_bytes: 1,
            fetched_bytes: 1,
        }
    }

    #[test]
    fn test_batch_report_counts() {
        let batch = BatchReport {
            files: vec![
                report(FileStatus::Completed),
                report(FileStatus::Failed),
                report(FileStatus::Completed),
                report(FileStatus::Cancelled),
            ],
            sink: ConsumerReport::default(),
        };
        assert_eq!(batch.completed(), 2);
        assert_eq!(batch.failed(), 1);
        assert_eq!(batch.cancelled(), 1);
        assert!(!batch.is_success());
    }

    #[test]
    fn test_session_rejects_invalid_settings() {
        let settings = Settings {
            workers: 0,
            ..Settings::default()
        };
        assert!(matches!(FetchSession::new(settings), Err(FetchError::Config(_))));
    }

    #[tokio::test]
    async fn test_cancel_is_shared() {
        let session = FetchSession::new(Settings::default()).unwrap();
        let token = session.cancel_token();
        session.cancel();
        assert!(token.is_cancelled());
    }
}
