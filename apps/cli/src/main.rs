//! fetchd CLI - command-line front end for the fetchd engine
//!
//! Management commands edit the persisted records. `fetchd run` is the
//! process that actually transfers them.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fetchd_types::{DownloadStatus, Priority};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// fetchd - persistent, resumable download manager
#[derive(Parser)]
#[command(name = "fetchd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for fetchd
    #[arg(long, env = "FETCHD_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
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

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum NetworkArg {
    Unmetered,
    Cellular,
    Offline,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new download
    Add {
        /// URL to download
        url: String,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Group to add to
        #[arg(short, long)]
        group: Option<u32>,

        /// low, normal or high
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Only transfer on unmetered networks
        #[arg(long)]
        unmetered_only: bool,

        /// Extra request header, `Name: value`
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// List downloads
    List {
        /// Filter by status (repeatable)
        #[arg(short, long)]
        status: Vec<DownloadStatus>,

        /// Filter by group
        #[arg(short, long)]
        group: Option<u32>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show download info
    Info {
        /// Download ID or unique prefix
        id: String,
    },

    /// Pause a download
    Pause { id: String },

    /// Resume a paused download
    Resume { id: String },

    /// Retry a failed or cancelled download
    Retry { id: String },

    /// Cancel a download
    Cancel { id: String },

    /// Forget a download, keeping its file
    Remove { id: String },

    /// Forget a download and delete its file
    Delete { id: String },

    /// Pause every download
    PauseAll,

    /// Resume every paused download
    ResumeAll,

    /// Retry every failed or cancelled download
    RetryAll,

    /// Cancel every download
    CancelAll,

    /// Forget every download
    RemoveAll,

    /// Apply a command to one group
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Run queued downloads until idle
    Run {
        /// Connectivity to assume at start
        #[arg(long, default_value = "unmetered")]
        network: NetworkArg,

        /// Check connectivity by connecting to host:port every few seconds
        #[arg(long)]
        probe: Option<String>,

        /// Keep running when there is nothing left to do
        #[arg(long)]
        stay: bool,
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
enum GroupAction {
    Pause { group: u32 },
    Resume { group: u32 },
    Retry { group: u32 },
    Cancel { group: u32 },
    Remove { group: u32 },
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
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "fetchd=debug,fetchd_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "fetchd", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("fetchd"))
            .unwrap_or_else(|| PathBuf::from(".fetchd"))
    });
    let ctx = commands::Context::open(data_dir, cli.output).await?;

    match cli.command {
        Commands::Add {
            url,
            output,
            name,
            group,
            priority,
            unmetered_only,
            headers,
        } => {
            let options = commands::AddOptions {
                name,
                group,
                priority,
                unmetered_only,
                headers,
            };
            commands::add_download(&ctx, url, output, options).await
        }

        Commands::List { status, group, all } => {
            commands::list_downloads(&ctx, status, group, all).await
        }

        Commands::Info { id } => commands::show_info(&ctx, &id).await,

        Commands::Pause { id } => commands::single(&ctx, commands::Op::Pause, &id).await,
        Commands::Resume { id } => commands::single(&ctx, commands::Op::Resume, &id).await,
        Commands::Retry { id } => commands::single(&ctx, commands::Op::Retry, &id).await,
        Commands::Cancel { id } => commands::single(&ctx, commands::Op::Cancel, &id).await,
        Commands::Remove { id } => commands::single(&ctx, commands::Op::Remove, &id).await,
        Commands::Delete { id } => commands::delete_download(&ctx, &id).await,

        Commands::PauseAll => commands::all(&ctx, commands::Op::Pause).await,
        Commands::ResumeAll => commands::all(&ctx, commands::Op::Resume).await,
        Commands::RetryAll => commands::all(&ctx, commands::Op::Retry).await,
        Commands::CancelAll => commands::all(&ctx, commands::Op::Cancel).await,
        Commands::RemoveAll => commands::all(&ctx, commands::Op::Remove).await,

        Commands::Group { action } => {
            let (op, group) = match action {
                GroupAction::Pause { group } => (commands::Op::Pause, group),
                GroupAction::Resume { group } => (commands::Op::Resume, group),
                GroupAction::Retry { group } => (commands::Op::Retry, group),
                GroupAction::Cancel { group } => (commands::Op::Cancel, group),
                GroupAction::Remove { group } => (commands::Op::Remove, group),
            };
            commands::group(&ctx, op, group).await
        }

        Commands::Run {
            network,
            probe,
            stay,
        } => commands::run(&ctx, network, probe, stay).await,

        Commands::Config { action } => commands::config_action(&ctx, action).await,

        Commands::Completions { .. } => Ok(()),
    }
}
