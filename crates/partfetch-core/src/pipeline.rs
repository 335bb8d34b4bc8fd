//! Part-ready pipeline
//!
//! Connects the engine's per-part completion callback to a single consumer
//! task through a bounded channel. Workers block on a full channel, which
//! keeps the number of finished-but-unprocessed parts on disk bounded.
//!
//! The consumer keeps draining after the producer signals completion, so a
//! part enqueued just before the signal is still delivered.

use crate::disk::DiskBudgetGuard;
use crate::engine::{remove_quietly, PartReadyHandler};
use crate::error::FetchError;
use async_trait::async_trait;
use partfetch_types::{CoreEvent, ReadyPart};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where finished parts go: an uploader, a mover, a transcoder
#[async_trait]
pub trait PartSink: Send {
    async fn consume(&mut self, part: &ReadyPart) -> Result<(), FetchError>;
}

/// Create a pipeline with room for `capacity` waiting parts
pub fn part_channel(
    capacity: usize,
    delete_after_sink: bool,
    disk: Arc<DiskBudgetGuard>,
    event_tx: broadcast::Sender<CoreEvent>,
    cancel: CancellationToken,
) -> (PartProducer, CompletionSignal, PartConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (done_tx, done_rx) = oneshot::channel();
    (
        PartProducer { tx },
        CompletionSignal(done_tx),
        PartConsumer {
            rx,
            done: done_rx,
            delete_after_sink,
            disk,
            event_tx,
            cancel,
        },
    )
}

/// Producer side, handed to the engine as its part handler
#[derive(Clone)]
pub struct PartProducer {
    tx: mpsc::Sender<ReadyPart>,
}

impl PartProducer {
    /// Enqueue a part, waiting while the channel is full
    pub async fn send(&self, part: ReadyPart) -> Result<(), FetchError> {
        self.tx
            .send(part)
            .await
            .map_err(|_| FetchError::Sink("part consumer has stopped".to_string()))
    }
}

#[async_trait]
impl PartReadyHandler for PartProducer {
    async fn on_part_ready(&self, part: ReadyPart) -> Result<(), FetchError> {
        self.send(part).await
    }
}

/// One-shot "no more parts will be produced"
pub struct CompletionSignal(oneshot::Sender<()>);

impl CompletionSignal {
    pub fn finish(self) {
        let _ = self.0.send(());
    }
}

/// A part the sink rejected; its file is left in place
#[derive(Debug, Clone, Serialize)]
pub struct FailedPart {
    pub part: ReadyPart,
    pub error: String,
}

/// What the consumer did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerReport {
    pub consumed: usize,
    pub failed: Vec<FailedPart>,
    /// Parts deleted unconsumed because of cancellation
    pub discarded: usize,
}

/// The single consumer loop
pub struct PartConsumer {
    rx: mpsc::Receiver<ReadyPart>,
    done: oneshot::Receiver<()>,
    delete_after_sink: bool,
    disk: Arc<DiskBudgetGuard>,
    event_tx: broadcast::Sender<CoreEvent>,
    cancel: CancellationToken,
}

impl PartConsumer {
    /// Feed parts to `sink` until the producer finishes, then drain
    ///
    /// Returns the sink so callers can inspect it afterwards.
    pub async fn run<S: PartSink>(mut self, mut sink: S) -> (ConsumerReport, S) {
        let mut report = ConsumerReport::default();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.discard_remaining(&mut report).await;
                    break;
                }
                part = self.rx.recv() => match part {
                    Some(part) => self.handle(&mut sink, part, &mut report).await,
                    None => break,
                },
                _ = &mut self.done => {
                    debug!("Producer finished, draining remaining parts");
                    self.rx.close();
                    while let Some(part) = self.rx.recv().await {
                        if self.cancel.is_cancelled() {
                            self.discard(part, &mut report).await;
                        } else {
                            self.handle(&mut sink, part, &mut report).await;
                        }
                    }
                    break;
                }
            }
        }

        info!(
            "Part consumer finished: {} consumed, {} failed, {} discarded",
            report.consumed,
            report.failed.len(),
            report.discarded
        );
        (report, sink)
    }

    async fn handle<S: PartSink>(&self, sink: &mut S, part: ReadyPart, report: &mut ConsumerReport) {
        debug!(
            "Consuming part {}/{} of {}",
            part.part_index + 1,
            part.total_parts,
            part.file_name
        );
        match sink.consume(&part).await {
            Ok(()) => {
                if self.delete_after_sink {
                    remove_quietly(&part.path).await;
                }
                self.disk.release(part.len);
                let _ = self.event_tx.send(CoreEvent::PartConsumed {
                    id: part.task_id,
                    part_index: part.part_index,
                });
                report.consumed += 1;
            }
            Err(e) => {
                error!(
                    "Sink failed on part {} of {}: {}",
                    part.part_index, part.file_name, e
                );
                report.failed.push(FailedPart {
                    part,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn discard_remaining(&mut self, report: &mut ConsumerReport) {
        self.rx.close();
        while let Some(part) = self.rx.recv().await {
            self.discard(part, report).await;
        }
    }

    async fn discard(&self, part: ReadyPart, report: &mut ConsumerReport) {
        warn!(
            "Discarding part {} of {} after cancellation",
            part.part_index, part.file_name
        );
        remove_quietly(&part.path).await;
        self.disk.release(part.len);
        report.discarded += 1;
    }
}
