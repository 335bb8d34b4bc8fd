//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use partfetch_core::{
    ContentApi, DiskBudgetGuard, EngineConfig, FetchError, PartReadyHandler, RangeDownloadEngine,
    TokenManager,
};
use partfetch_types::{CoreEvent, ReadyPart, RemoteFile, RetryPolicy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating-looking payload
pub fn test_body(len: usize) -> Arc<Vec<u8>> {
    Arc::new((0..len).map(|i| (i * 7 % 251) as u8).collect())
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn engine_config(part_size: u64) -> EngineConfig {
    EngineConfig {
        part_size,
        retry: fast_retry(),
        request_timeout: Duration::from_secs(5),
        stall_timeout: Duration::from_secs(5),
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Serves a byte slice, honoring `Range` headers like a real file host
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    delay: Duration,
}

impl RangeResponder {
    pub fn new(body: Arc<Vec<u8>>) -> Self {
        Self {
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(body: Arc<Vec<u8>>, delay: Duration) -> Self {
        Self { body, delay }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let template = match range {
            Some((start, _)) if start >= len => ResponseTemplate::new(416),
            Some((start, end)) => {
                let end = end.min(len - 1);
                ResponseTemplate::new(206)
                    .insert_header("content-range", format!("bytes {}-{}/{}", start, end, len).as_str())
                    .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.to_vec()),
        };
        template.set_delay(self.delay)
    }
}

/// Mount HEAD and GET for `/download/<name>`
pub async fn mount_file(server: &MockServer, name: &str, body: Arc<Vec<u8>>, ranges: bool) {
    mount_head(server, name, &body, ranges).await;
    Mock::given(method("GET"))
        .and(path(format!("/download/{}", name)))
        .respond_with(RangeResponder::new(body))
        .mount(server)
        .await;
}

pub async fn mount_head(server: &MockServer, name: &str, body: &[u8], ranges: bool) {
    // The full body makes the server report its length; HEAD never sends it
    let mut head = ResponseTemplate::new(200).set_body_bytes(body.to_vec());
    if ranges {
        head = head.insert_header("accept-ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .and(path(format!("/download/{}", name)))
        .respond_with(head)
        .mount(server)
        .await;
}

/// Requests the server received for `/download/<name>` with `verb`
pub async fn requests(server: &MockServer, verb: &str, name: &str) -> Vec<Request> {
    let wanted = format!("/download/{}", name);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == verb && r.url.path() == wanted)
        .collect()
}

pub fn range_header(request: &Request) -> Option<String> {
    request
        .headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Records every part it is handed
#[derive(Default)]
pub struct CollectParts {
    pub parts: Mutex<Vec<ReadyPart>>,
}

#[async_trait]
impl PartReadyHandler for CollectParts {
    async fn on_part_ready(&self, part: ReadyPart) -> Result<(), FetchError> {
        self.parts.lock().push(part);
        Ok(())
    }
}

impl CollectParts {
    pub fn indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.parts.lock().iter().map(|p| p.part_index).collect();
        indices.sort_unstable();
        indices
    }
}

/// An engine wired to a mock server and a temp directory
pub struct Harness {
    pub server: MockServer,
    pub dir: TempDir,
    pub disk: Arc<DiskBudgetGuard>,
    pub tokens: Arc<TokenManager>,
    pub engine: RangeDownloadEngine,
    pub events: broadcast::Sender<CoreEvent>,
}

impl Harness {
    pub async fn new(part_size: u64) -> Self {
        Self::with_budget(part_size, u64::MAX).await
    }

    pub async fn with_budget(part_size: u64, max_disk: u64) -> Self {
        Self::with_disk(part_size, |_| DiskBudgetGuard::new(max_disk)).await
    }

    /// Build the disk guard once the download directory exists
    pub async fn with_disk(part_size: u64, disk: impl FnOnce(&Path) -> DiskBudgetGuard) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let server = MockServer::start().await;
        let client = reqwest::Client::new();
        let api = ContentApi::new(client.clone(), server.uri(), None, Duration::from_secs(5));
        let tokens = Arc::new(TokenManager::with_static(api, "test-token"));
        let disk = Arc::new(disk(dir.path()));
        let (events, _) = broadcast::channel(1000);
        let engine = RangeDownloadEngine::new(
            client,
            Arc::clone(&tokens),
            Arc::clone(&disk),
            engine_config(part_size),
            events.clone(),
        );
        Self {
            server,
            dir,
            disk,
            tokens,
            engine,
            events,
        }
    }

    pub fn remote_file(&self, name: &str, size: u64) -> RemoteFile {
        RemoteFile {
            id: format!("id-{}", name),
            name: name.to_string(),
            link: format!("{}/download/{}", self.server.uri(), name),
            size,
            dest_path: self.dir.path().join(name),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Every file left in `dir`, by name
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
