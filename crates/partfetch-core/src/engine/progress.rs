//! Aggregate progress shared by the workers of one download

use parking_lot::Mutex;
use partfetch_types::CoreEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Default)]
struct ProgressState {
    downloaded: u64,
    total: u64,
}

/// Lock-protected byte counter; the only state workers share
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter {
    state: Arc<Mutex<ProgressState>>,
}

impl ProgressCounter {
    pub fn new(total: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProgressState {
                downloaded: 0,
                total,
            })),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.state.lock().downloaded += bytes;
    }

    /// Take back bytes that were discarded (restarted transfer)
    pub fn rewind(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.downloaded = state.downloaded.saturating_sub(bytes);
    }

    pub fn set_total(&self, total: u64) {
        self.state.lock().total = total;
    }

    /// (downloaded, total)
    pub fn snapshot(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.downloaded, state.total)
    }
}

/// Spawn a task emitting `DownloadProgress` events until `stop` fires
pub fn spawn_progress_reporter(
    id: Uuid,
    progress: ProgressCounter,
    event_tx: broadcast::Sender<CoreEvent>,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let alpha = 0.3;
        let mut smoothed_speed = 0.0f64;
        let (mut last_downloaded, _) = progress.snapshot();
        let mut last_time = Instant::now();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            if event_tx.receiver_count() == 0 {
                continue;
            }

            let now = Instant::now();
            let (downloaded, total) = progress.snapshot();
            let elapsed = now.duration_since(last_time).as_secs_f64();
            let instant_speed = if elapsed > 0.0 {
                downloaded.saturating_sub(last_downloaded) as f64 / elapsed
            } else {
                0.0
            };
            smoothed_speed = alpha * instant_speed + (1.0 - alpha) * smoothed_speed;
            let speed = smoothed_speed as u64;
            let eta = (speed > 0 && total > 0).then(|| total.saturating_sub(downloaded) / speed);

            let _ = event_tx.send(CoreEvent::DownloadProgress {
                id,
                downloaded,
                total,
                speed,
                eta,
            });

            last_downloaded = downloaded;
            last_time = now;
        }
    })
}
