//! CLI command implementations

use crate::output::{format_bytes, print_json};
use crate::progress::DownloadProgress;
use crate::sink::CliSink;
use crate::{load_settings, ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Result};
use console::style;
use partfetch_core::{BatchReport, FetchRequest, FetchSession};
use partfetch_types::{FileStatus, RemoteFile, Settings};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::warn;

// ============================================================================
// Download Commands
// ============================================================================

/// What happens to a part after it is ready
pub struct GetOptions {
    pub move_to: Option<PathBuf>,
    pub exec: Option<String>,
    pub keep: bool,
}

impl GetOptions {
    /// Whether the download directory copy of a part is removed once handed over
    fn deletes_parts(&self) -> bool {
        self.move_to.is_some() || (self.exec.is_some() && !self.keep)
    }
}

pub async fn get(
    mut settings: Settings,
    url: &str,
    request: FetchRequest,
    options: GetOptions,
    format: OutputFormat,
) -> Result<()> {
    let human = format != OutputFormat::Json;
    settings.delete_after_sink = options.deletes_parts();
    let download_dir = settings.download_dir.clone();
    let move_to = options.move_to.clone();

    let session = FetchSession::new(settings)?;
    let progress = DownloadProgress::new(human);
    let sink = CliSink::new(
        download_dir.clone(),
        options.move_to,
        options.exec,
        progress.multi(),
        human,
    );

    let stop = CancellationToken::new();
    let progress_task = progress.spawn(session.subscribe(), stop.clone());

    let cancel = session.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling downloads");
            cancel.cancel();
        }
    });

    let result = session.fetch(url, &request, sink).await;
    stop.cancel();
    let _ = progress_task.await;
    interrupt.abort();

    let (report, sink) = result?;
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => print_report_table(&report),
        OutputFormat::Human => {
            print_report(&report);
            match move_to {
                Some(dir) => println!(
                    "  {} part(s) moved to {}",
                    sink.delivered.len(),
                    style(dir.display()).cyan()
                ),
                None if !sink.delivered.is_empty() => {
                    println!("  Files in {}", style(download_dir.display()).cyan())
                }
                None => {}
            }
        }
    }

    if !report.is_success() {
        bail!(
            "{} file(s) failed, {} cancelled, {} part(s) rejected by the sink",
            report.failed(),
            report.cancelled(),
            report.sink.failed.len()
        );
    }
    Ok(())
}

fn status_icon(status: FileStatus) -> console::StyledObject<&'static str> {
    match status {
        FileStatus::Completed => style("✓").green().bold(),
        FileStatus::Failed => style("✗").red().bold(),
        FileStatus::Cancelled => style("○").dim(),
    }
}

fn print_report(report: &BatchReport) {
    if report.files.is_empty() {
        println!("{}", style("Nothing to download").dim());
        return;
    }

    for file in &report.files {
        let mut line = format!(
            "{} {} {}",
            status_icon(file.status),
            style(&file.name).cyan(),
            style(format_bytes(file.total_bytes)).dim()
        );
        if file.status == FileStatus::Completed && file.fetched_bytes < file.total_bytes {
            line.push_str(&format!(" ({} fetched)", format_bytes(file.fetched_bytes)));
        }
        if let Some(error) = &file.error {
            line.push_str(&format!(" - {}", style(error).red()));
        }
        println!("{}", line);
    }

    for failed in &report.sink.failed {
        println!(
            "{} part {}/{} of {} kept at {}: {}",
            style("!").yellow().bold(),
            failed.part.part_index + 1,
            failed.part.total_parts,
            failed.part.file_name,
            failed.part.path.display(),
            failed.error
        );
    }

    println!();
    println!(
        "{} completed, {} failed, {} cancelled, {} part(s) handed over",
        style(report.completed()).bold(),
        report.failed(),
        report.cancelled(),
        report.sink.consumed
    );
}

fn print_report_table(report: &BatchReport) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct FileRow {
        name: String,
        status: String,
        parts: usize,
        size: String,
        fetched: String,
        error: String,
    }

    let rows: Vec<FileRow> = report
        .files
        .iter()
        .map(|f| FileRow {
            name: f.name.clone(),
            status: format!("{:?}", f.status),
            parts: f.parts,
            size: format_bytes(f.total_bytes),
            fetched: format_bytes(f.fetched_bytes),
            error: f.error.clone().unwrap_or_default(),
        })
        .collect();

    println!("{}", Table::new(rows));
}

// ============================================================================
// Listing
// ============================================================================

pub async fn list(
    settings: Settings,
    url: &str,
    request: FetchRequest,
    format: OutputFormat,
) -> Result<()> {
    let download_dir = settings.download_dir.clone();
    let session = FetchSession::new(settings)?;
    let files = session.resolve(url, &request).await?;

    match format {
        OutputFormat::Json => print_json(&files)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct RemoteRow {
                id: String,
                path: String,
                size: String,
            }

            let rows: Vec<RemoteRow> = files
                .iter()
                .map(|f| RemoteRow {
                    id: f.id.clone(),
                    path: relative_path(f, &download_dir),
                    size: format_bytes(f.size),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if files.is_empty() {
                println!("{}", style("No files found").dim());
                return Ok(());
            }

            for file in &files {
                println!(
                    "  {} {}",
                    relative_path(file, &download_dir),
                    style(format_bytes(file.size)).dim()
                );
            }
            println!();
            println!(
                "{} file(s), {} total",
                style(files.len()).bold(),
                format_bytes(files.iter().map(|f| f.size).sum())
            );
        }
    }

    Ok(())
}

fn relative_path(file: &RemoteFile, download_dir: &Path) -> String {
    file.dest_path
        .strip_prefix(download_dir)
        .unwrap_or(&file.dest_path)
        .display()
        .to_string()
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    explicit: Option<&Path>,
    path: &Path,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = load_settings(explicit)?;

            match format {
                OutputFormat::Json => print_json(&settings)?,
                _ => {
                    let source = if path.exists() {
                        path.display().to_string()
                    } else {
                        "defaults".to_string()
                    };
                    println!("partfetch configuration ({}):", source);
                    println!();
                    println!("  Download dir: {}", settings.download_dir.display());
                    println!("  Part size: {}", format_bytes(settings.part_size));
                    println!("  Workers per file: {}", settings.workers);
                    println!("  Disk budget: {}", format_bytes(settings.max_disk_bytes));
                    println!("  Min free space: {}", format_bytes(settings.min_free_space));
                    println!("  Channel capacity: {}", settings.channel_capacity);
                    println!("  Delete after sink: {}", settings.delete_after_sink);
                    println!("  Merge parts: {}", settings.merge_parts);
                    println!("  API base: {}", settings.api_base);
                    println!(
                        "  Account token: {}",
                        if settings.account_token.is_some() {
                            "set"
                        } else {
                            "issued on demand"
                        }
                    );
                    println!(
                        "  Timeouts: connect {}s, request {}s, stall {}s",
                        settings.connect_timeout_secs,
                        settings.request_timeout_secs,
                        settings.stall_timeout_secs
                    );
                    println!("  Retry attempts: {}", settings.retry.max_attempts);
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = load_settings(explicit)?;
            let settings_value = serde_json::to_value(&settings)?;
            let value = lookup(&settings_value, &key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            match value {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", other),
            }
        }

        Some(ConfigAction::Path) => println!("{}", path.display()),

        Some(ConfigAction::Init { force }) => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let json = serde_json::to_string_pretty(&Settings::default())?;
            tokio::fs::write(path, json).await?;
            println!(
                "{} Wrote default settings to {}",
                style("✓").green().bold(),
                path.display()
            );
        }
    }

    Ok(())
}

/// Walk a dotted key such as `retry.max_attempts`
fn lookup<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    key.split('.').try_fold(value, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_dotted_keys() {
        let value = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(lookup(&value, "workers"), Some(&serde_json::json!(2)));
        assert_eq!(
            lookup(&value, "retry.max_attempts"),
            Some(&serde_json::json!(5))
        );
        assert!(lookup(&value, "retry.nope").is_none());
    }

    #[test]
    fn test_part_deletion_follows_hand_off() {
        let opts = |move_to: Option<&str>, exec: Option<&str>, keep| GetOptions {
            move_to: move_to.map(PathBuf::from),
            exec: exec.map(String::from),
            keep,
        };
        assert!(!opts(None, None, false).deletes_parts());
        assert!(opts(Some("/out"), None, false).deletes_parts());
        assert!(opts(None, Some("true"), false).deletes_parts());
        assert!(!opts(None, Some("true"), true).deletes_parts());
    }

    #[tokio::test]
    async fn test_config_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        config_action(None, &path, Some(ConfigAction::Init { force: false }), OutputFormat::Human)
            .await
            .unwrap();
        let written = Settings::load(&path).unwrap();
        assert_eq!(written.workers, Settings::default().workers);

        let again =
            config_action(None, &path, Some(ConfigAction::Init { force: false }), OutputFormat::Human)
                .await;
        assert!(again.is_err());
        config_action(None, &path, Some(ConfigAction::Init { force: true }), OutputFormat::Human)
            .await
            .unwrap();
    }
}
