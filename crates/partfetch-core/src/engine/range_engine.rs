//! Range download engine - entry point for downloading one file
//!
//! Owns what is shared across files (HTTP client, token cache, disk guard,
//! destination locks) and builds a [`RangeDownloadTask`] per download.

use crate::auth::TokenManager;
use crate::disk::DiskBudgetGuard;
use crate::engine::download_task::{DownloadOutcome, PartReadyHandler, RangeDownloadTask};
use crate::engine::locks::DestinationLocks;
use crate::engine::part_worker::TransferContext;
use crate::engine::progress::ProgressCounter;
use crate::error::FetchError;
use partfetch_types::{CoreEvent, RemoteFile, RetryPolicy, Settings};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Transfer tuning for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-part ceiling in bytes
    pub part_size: u64,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// Longest wait for the next body chunk
    pub stall_timeout: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            part_size: settings.part_size,
            retry: settings.retry.clone(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            stall_timeout: Duration::from_secs(settings.stall_timeout_secs),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Downloads files as independently resumable byte ranges
pub struct RangeDownloadEngine {
    client: Client,
    tokens: Arc<TokenManager>,
    disk: Arc<DiskBudgetGuard>,
    config: EngineConfig,
    locks: DestinationLocks,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl RangeDownloadEngine {
    pub fn new(
        client: Client,
        tokens: Arc<TokenManager>,
        disk: Arc<DiskBudgetGuard>,
        config: EngineConfig,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            client,
            tokens,
            disk,
            config,
            locks: DestinationLocks::new(),
            event_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn disk(&self) -> &Arc<DiskBudgetGuard> {
        &self.disk
    }

    /// Download `file`, handing each part to `handler` as it completes
    ///
    /// Returns once every range is on disk and delivered. `cancel` stops
    /// new parts from starting, interrupts running ones and removes their
    /// partial files.
    pub async fn download(
        &self,
        file: &RemoteFile,
        worker_count: usize,
        handler: Arc<dyn PartReadyHandler>,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        self.download_as(Uuid::new_v4(), file, worker_count, handler, cancel)
            .await
    }

    /// Like [`download`](Self::download), with events tagged `task_id`
    pub async fn download_as(
        &self,
        task_id: Uuid,
        file: &RemoteFile,
        worker_count: usize,
        handler: Arc<dyn PartReadyHandler>,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        let _lock = self.locks.acquire(&file.dest_path)?;
        tokio::fs::create_dir_all(file.dest_dir()).await?;

        let ctx = Arc::new(TransferContext {
            client: self.client.clone(),
            tokens: Arc::clone(&self.tokens),
            disk: Arc::clone(&self.disk),
            progress: ProgressCounter::new(file.size),
            cancel: cancel.child_token(),
            retry: self.config.retry.clone(),
            request_timeout: self.config.request_timeout,
            stall_timeout: self.config.stall_timeout,
            link: file.link.clone(),
            file_name: file.name.clone(),
        });

        let task = RangeDownloadTask::new(
            task_id,
            file.clone(),
            self.config.part_size,
            worker_count,
            ctx,
            cancel,
            handler,
            self.event_tx.clone(),
        );
        info!("Queued {} as task {}", file.name, task.id());
        task.run().await
    }
}
