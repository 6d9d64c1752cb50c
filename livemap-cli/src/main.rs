//! livemap: live position tracking daemon and client.
//!
//! # Usage
//!
//! ```text
//! livemap daemon start|stop|status
//! livemap watch --user-id <id> --job <job> --grade <n> [--superuser] [--json] [--limit <n>]
//! livemap marker put --user-id <id> --job <job> --grade <n> --name <name> --x <x> --y <y> (--radius <r> | --icon <icon>)
//! livemap marker delete <id> --user-id <id> --job <job> --grade <n>
//! livemap marker list [--job <job>]...
//! livemap config show
//! ```

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use commands::{config::ConfigCommand, daemon::DaemonCommand, marker::MarkerCommand, watch::WatchArgs};
use livemap_core::types::{UserId, UserInfo};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "livemap",
    version,
    about = "Track live positions and distribute them to connected clients",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or query the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Open a live stream and print every message.
    Watch(WatchArgs),

    /// Create, update, delete and list map markers.
    Marker {
        #[command(subcommand)]
        command: MarkerCommand,
    },

    /// Inspect the configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared caller identity
// ---------------------------------------------------------------------------

/// Identity the daemon acts on behalf of.
#[derive(Args, Debug, Clone)]
pub struct CallerArgs {
    #[arg(long = "user-id")]
    pub user_id: i32,

    #[arg(long)]
    pub job: String,

    #[arg(long, default_value_t = 0)]
    pub grade: i32,

    #[arg(long)]
    pub superuser: bool,
}

impl From<CallerArgs> for UserInfo {
    fn from(args: CallerArgs) -> Self {
        UserInfo {
            user_id: UserId(args.user_id),
            job: args.job,
            job_grade: args.grade,
            superuser: args.superuser,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Watch(args) => args.run(),
        Commands::Marker { command } => commands::marker::run(command),
        Commands::Config { command } => commands::config::run(command),
    }
}
