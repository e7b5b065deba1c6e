//! segdl CLI - Command-line segmented downloader
//!
//! Adds downloads, runs them with progress bars and manages the ones
//! left over from earlier runs.

mod commands;
mod config;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// segdl - Resumable segmented downloader
#[derive(Parser)]
#[command(name = "segdl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding the database and settings
    #[arg(long, env = "SEGDL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new download and run it
    Add {
        /// URL to download
        url: String,

        /// Destination directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// File name; discovered from the server when omitted
        #[arg(short = 'o', long)]
        name: Option<String>,

        /// Number of pieces downloaded in parallel
        #[arg(short, long)]
        pieces: Option<u32>,

        /// Only download on unmetered networks
        #[arg(long)]
        unmetered: bool,

        /// Extra request header, as "Name: value"
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Free-form description
        #[arg(long)]
        description: Option<String>,

        /// Only store the download; `segdl run` starts it later
        #[arg(long)]
        no_wait: bool,
    },

    /// Run every unfinished download until it settles
    Run,

    /// List downloads
    List {
        /// Filter by status (e.g. running, paused, upstream_503)
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show download info
    Info {
        /// Download ID or unique ID prefix
        id: String,
    },

    /// Pause a download
    Pause {
        /// Download ID or unique ID prefix
        #[arg(required_unless_present = "all")]
        id: Option<String>,

        /// Pause every download
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Resume a download and run it
    Resume {
        /// Download ID or unique ID prefix
        #[arg(required_unless_present = "all")]
        id: Option<String>,

        /// Resume every unfinished download
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Stop a download
    Stop {
        /// Download ID or unique ID prefix
        id: String,
    },

    /// Delete a download
    Delete {
        /// Download ID or unique ID prefix
        id: String,

        /// Also delete the downloaded file
        #[arg(long)]
        with_file: bool,
    },

    /// Change parameters of a download
    Change {
        /// Download ID or unique ID prefix
        id: String,

        /// New URL; the download starts over
        #[arg(long)]
        url: Option<String>,

        /// New file name; the file is renamed
        #[arg(long)]
        name: Option<String>,

        /// New directory; the file is moved
        #[arg(long)]
        dir: Option<PathBuf>,

        /// New piece count; progress is reset
        #[arg(long)]
        pieces: Option<u32>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        unmetered: Option<bool>,

        #[arg(long)]
        retry: Option<bool>,
    },

    /// Show/update settings
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
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "segdl=debug,segdl_core=debug" } else { "segdl=info,segdl_core=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("segdl"))
            .unwrap_or_else(|| PathBuf::from(".segdl"))
    });

    match cli.command {
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "segdl", &mut std::io::stdout());
        }

        Commands::Config { action } => commands::config_action(&data_dir, action, cli.output)?,

        command => {
            let settings = config::load_settings(&data_dir)?;
            let app = commands::App::open(&data_dir, settings).await?;
            let result = commands::execute(&app, command, cli.output).await;
            app.engine.shutdown().await;
            result?;
        }
    }

    Ok(())
}
