//! Progress bar utilities for CLI downloads

use crate::output::{format_bytes, format_eta, format_speed};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use partfetch_types::{CoreEvent, FileStatus};
use std::collections::HashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Manages progress bars for the files of one batch
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
}

impl DownloadProgress {
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            bars: HashMap::new(),
        }
    }

    /// Handle used to print lines without tearing the bars
    pub fn multi(&self) -> MultiProgress {
        self.multi.clone()
    }

    fn add_file(&mut self, id: Uuid, name: &str, size: u64, total_parts: u32) {
        let pb = self.multi.add(ProgressBar::new(size));
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
        {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }
        pb.set_prefix(name.to_string());
        pb.set_message(format!("0/{} parts", total_parts));
        self.bars.insert(id, pb);
    }

    /// Update the bars from a core event
    pub fn handle_event(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::Resolved {
                root,
                files,
                total_bytes,
            } => {
                let _ = self.multi.println(format!(
                    "{} {} resolved to {} file(s), {}",
                    style("→").cyan(),
                    root,
                    files,
                    format_bytes(*total_bytes)
                ));
            }

            CoreEvent::FileStarted {
                id,
                name,
                size,
                total_parts,
            } => self.add_file(*id, name, *size, *total_parts),

            CoreEvent::DownloadProgress {
                id,
                downloaded,
                total,
                speed,
                eta,
            } => {
                if let Some(pb) = self.bars.get(id) {
                    if *total > 0 {
                        pb.set_length(*total);
                    }
                    pb.set_position(*downloaded);
                    pb.set_message(format!(
                        "{} eta {}",
                        format_speed(*speed),
                        format_eta(eta.unwrap_or(0))
                    ));
                }
            }

            CoreEvent::PartReady {
                id,
                part_index,
                total_parts,
                ..
            } => {
                if let Some(pb) = self.bars.get(id) {
                    pb.set_message(format!("{}/{} parts", part_index + 1, total_parts));
                }
            }

            CoreEvent::FileFinished {
                id, status, error, ..
            } => {
                if let Some(pb) = self.bars.remove(id) {
                    match status {
                        FileStatus::Completed => pb.finish_with_message(format!(
                            "{} done",
                            style("✓").green().bold()
                        )),
                        FileStatus::Failed => pb.abandon_with_message(format!(
                            "{} {}",
                            style("✗").red().bold(),
                            error.as_deref().unwrap_or("failed")
                        )),
                        FileStatus::Cancelled => {
                            pb.abandon_with_message(format!("{} cancelled", style("○").dim()))
                        }
                    }
                }
            }

            CoreEvent::PartConsumed { .. } => {}
        }
    }

    /// Clear all bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }

    /// Drive the bars from `events` until `stop` fires
    pub fn spawn(
        mut self,
        mut events: broadcast::Receiver<CoreEvent>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = events.recv() => match event {
                        Ok(event) => self.handle_event(&event),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    _ = stop.cancelled() => {
                        // Pick up whatever was emitted before the stop
                        while let Ok(event) = events.try_recv() {
                            self.handle_event(&event);
                        }
                        break;
                    }
                }
            }
            self.clear();
        })
    }
}
