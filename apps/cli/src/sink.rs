//! Part sink used by `partfetch get`
//!
//! Prints every ready part, and optionally moves it into an output
//! directory and/or runs a shell command on it.

use crate::output::format_bytes;
use async_trait::async_trait;
use console::style;
use indicatif::MultiProgress;
use partfetch_core::{FetchError, PartSink};
use partfetch_types::ReadyPart;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

pub struct CliSink {
    download_dir: PathBuf,
    move_to: Option<PathBuf>,
    exec: Option<String>,
    multi: MultiProgress,
    /// Print a line per part
    announce: bool,
    /// Where each consumed part ended up
    pub delivered: Vec<PathBuf>,
}

impl CliSink {
    pub fn new(
        download_dir: PathBuf,
        move_to: Option<PathBuf>,
        exec: Option<String>,
        multi: MultiProgress,
        announce: bool,
    ) -> Self {
        Self {
            download_dir,
            move_to,
            exec,
            multi,
            announce,
            delivered: Vec::new(),
        }
    }

    async fn move_part(&self, part: &ReadyPart, out_dir: &Path) -> Result<PathBuf, FetchError> {
        let relative = part
            .path
            .strip_prefix(&self.download_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(part.path.file_name().unwrap_or_default()));
        let target = out_dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::rename(&part.path, &target).await.is_err() {
            // Cross-device; the pipeline removes the original afterwards
            debug!("Rename failed, copying {:?} to {:?}", part.path, target);
            tokio::fs::copy(&part.path, &target).await?;
        }
        Ok(target)
    }

    async fn run_command(&self, command: &str, part: &ReadyPart, path: &Path) -> Result<(), FetchError> {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };

        let status = cmd
            .env("PART_PATH", path)
            .env("PART_INDEX", part.part_index.to_string())
            .env("PART_TOTAL", part.total_parts.to_string())
            .env("FILE_NAME", &part.file_name)
            .status()
            .await
            .map_err(|e| FetchError::Sink(format!("failed to run {:?}: {}", command, e)))?;

        if status.success() {
            Ok(())
        } else {
            warn!(command = %command, code = ?status.code(), part = ?path, "part command failed");
            Err(FetchError::Sink(format!("command exited with {}", status)))
        }
    }
}

#[async_trait]
impl PartSink for CliSink {
    async fn consume(&mut self, part: &ReadyPart) -> Result<(), FetchError> {
        let path = match &self.move_to {
            Some(dir) => self.move_part(part, dir).await?,
            None => part.path.clone(),
        };

        if let Some(command) = &self.exec {
            self.run_command(command, part, &path).await?;
        }

        if self.announce {
            let _ = self.multi.println(format!(
                "{} {} part {}/{} ({}) {}",
                style("✓").green().bold(),
                style(&part.file_name).cyan(),
                part.part_index + 1,
                part.total_parts,
                format_bytes(part.len),
                style(path.display()).dim()
            ));
        }
        self.delivered.push(path);
        Ok(())
    }
}
