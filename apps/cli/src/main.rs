//! partfetch CLI - resumable range downloads with per-part hand-off
//!
//! Downloads a shared file or folder as byte-range parts and hands every
//! part over as soon as it is complete.

mod commands;
mod output;
mod progress;
mod sink;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use partfetch_core::FetchRequest;
use partfetch_types::Settings;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// partfetch - resumable part-by-part downloads
#[derive(Parser)]
#[command(name = "partfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, global = true, env = "PARTFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

/// Credentials for the content API
#[derive(Args, Debug, Clone, Default)]
struct AuthArgs {
    /// Pre-issued account token
    #[arg(long, env = "PARTFETCH_ACCOUNT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Website token sent with content lookups
    #[arg(long, env = "PARTFETCH_WEBSITE_TOKEN", hide_env_values = true)]
    website_token: Option<String>,

    /// Password of a protected share
    #[arg(long)]
    password: Option<String>,
}

/// Which files of the share to take
#[derive(Args, Debug, Clone, Default)]
struct SelectArgs {
    /// Only files matching this glob (repeatable)
    #[arg(short, long)]
    include: Vec<String>,

    /// Skip files matching this glob (repeatable)
    #[arg(short = 'x', long)]
    exclude: Vec<String>,
}

/// Transfer tuning
#[derive(Args, Debug, Clone, Default)]
struct TransferArgs {
    /// Download directory
    #[arg(short, long, env = "PARTFETCH_DOWNLOAD_DIR")]
    dir: Option<PathBuf>,

    /// Concurrent range requests per file
    #[arg(short, long)]
    workers: Option<u32>,

    /// Part size ceiling, e.g. 512M or 2G
    #[arg(long, value_parser = output::parse_size)]
    part_size: Option<u64>,

    /// Disk budget for parts on disk, e.g. 10G
    #[arg(long, value_parser = output::parse_size)]
    max_disk: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a share, handing over each part as it completes
    Get {
        /// Share URL or content id
        url: String,

        #[command(flatten)]
        auth: AuthArgs,

        #[command(flatten)]
        select: SelectArgs,

        #[command(flatten)]
        transfer: TransferArgs,

        /// Concatenate the parts of each file before handing it over
        #[arg(long)]
        merge: bool,

        /// Move every finished part into this directory
        #[arg(long)]
        move_to: Option<PathBuf>,

        /// Run a shell command per part (PART_PATH, PART_INDEX, PART_TOTAL, FILE_NAME)
        #[arg(long)]
        exec: Option<String>,

        /// Keep parts in the download directory after --exec succeeds
        #[arg(long)]
        keep: bool,
    },

    /// List the files a share resolves to
    Ls {
        /// Share URL or content id
        url: String,

        #[command(flatten)]
        auth: AuthArgs,

        #[command(flatten)]
        select: SelectArgs,
    },

    /// Show or create the settings file
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective settings
    Show,

    /// Get a single value (dotted keys reach nested values, e.g. retry.max_attempts)
    Get {
        /// Config key
        key: String,
    },

    /// Print the settings file location
    Path,

    /// Write a settings file with the defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl AuthArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(token) = &self.token {
            settings.account_token = Some(token.clone());
        }
        if let Some(token) = &self.website_token {
            settings.website_token = Some(token.clone());
        }
    }
}

impl TransferArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(dir) = &self.dir {
            settings.download_dir = dir.clone();
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(part_size) = self.part_size {
            settings.part_size = part_size;
        }
        if let Some(max_disk) = self.max_disk {
            settings.max_disk_bytes = max_disk;
        }
    }
}

fn request(auth: &AuthArgs, select: &SelectArgs) -> FetchRequest {
    FetchRequest {
        include: select.include.clone(),
        exclude: select.exclude.clone(),
        password: auth.password.clone(),
    }
}

/// Default settings file location
fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("partfetch"))
        .unwrap_or_else(|| PathBuf::from(".partfetch"))
        .join("config.json")
}

/// Settings from `--config`, else the default file if present, else defaults
fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    match explicit {
        Some(path) => Ok(Settings::load(path)?),
        None => {
            let path = default_config_path();
            if path.exists() {
                Ok(Settings::load(&path)?)
            } else {
                Ok(Settings::default())
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "partfetch_core=debug,partfetch_cli=debug,warn"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Get {
            url,
            auth,
            select,
            transfer,
            merge,
            move_to,
            exec,
            keep,
        } => {
            let mut settings = load_settings(cli.config.as_deref())?;
            auth.apply(&mut settings);
            transfer.apply(&mut settings);
            if merge {
                settings.merge_parts = true;
            }

            let options = commands::GetOptions {
                move_to,
                exec,
                keep,
            };
            commands::get(settings, &url, request(&auth, &select), options, cli.output).await?
        }

        Commands::Ls { url, auth, select } => {
            let mut settings = load_settings(cli.config.as_deref())?;
            auth.apply(&mut settings);
            commands::list(settings, &url, request(&auth, &select), cli.output).await?
        }

        Commands::Config { action } => {
            let path = cli.config.clone().unwrap_or_else(default_config_path);
            commands::config_action(cli.config.as_deref(), &path, action, cli.output).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "partfetch", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "partfetch",
            "get",
            "https://gofile.io/d/abc123",
            "--workers",
            "4",
            "--part-size",
            "64M",
            "--token",
            "tok",
            "-i",
            "*.mkv",
            "--move-to",
            "/tmp/out",
        ])
        .unwrap();

        let Commands::Get {
            auth,
            select,
            transfer,
            move_to,
            ..
        } = cli.command
        else {
            panic!("expected get");
        };

        let mut settings = Settings::default();
        auth.apply(&mut settings);
        transfer.apply(&mut settings);
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.part_size, 64 * 1024 * 1024);
        assert_eq!(settings.account_token.as_deref(), Some("tok"));
        assert_eq!(request(&auth, &select).include, vec!["*.mkv".to_string()]);
        assert_eq!(move_to, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn test_explicit_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"workers": 7, "merge_parts": true}"#).unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.workers, 7);
        assert!(settings.merge_parts);
        assert!(load_settings(Some(&dir.path().join("missing.json"))).is_err());
    }
}
