//! tab-hook: CLI bridge between the browser and the tabtime daemon.
//!
//! The browser extension (or a shell) calls this binary for every tab, focus
//! and visibility change; it wraps the event and forwards it to the daemon.
//!
//! ## Subcommands
//!
//! - `handle`: Forward one JSON payload read from stdin
//! - `activate`, `focus-gained`, `focus-lost`, `deactivate`, `visibility`,
//!   `unload`: Browser signals
//! - `start`, `stop`: Explicit tracking control
//! - `report`, `sync`, `register`, `state`, `health`: Queries and commands

mod daemon_client;
mod handle;
mod logging;
mod report;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use daemon_client::SignalFields;
use tabtime_daemon_protocol::{Command, Message, RegisterDomainParams, SignalType, Visibility};
use tracker_core::DailyDomainRecord;

#[derive(Parser)]
#[command(name = "tab-hook")]
#[command(about = "tabtime browsing-time tracker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a signal, message or command (reads JSON from stdin)
    Handle,

    /// A tab became the active tab
    Activate {
        #[arg(long)]
        tab_id: i64,
        #[arg(long)]
        url: String,
    },

    /// The browser window gained focus
    FocusGained {
        #[arg(long)]
        tab_id: i64,
        #[arg(long)]
        url: String,
    },

    /// The browser window lost focus
    FocusLost,

    /// A tab stopped being the active tab
    Deactivate {
        #[arg(long)]
        tab_id: i64,
    },

    /// The page became visible or hidden
    Visibility {
        #[arg(value_enum)]
        state: VisibilityArg,
        #[arg(long)]
        tab_id: Option<i64>,
        #[arg(long)]
        url: Option<String>,
    },

    /// A page is being unloaded
    Unload {
        #[arg(long)]
        tab_id: Option<i64>,
    },

    /// Start tracking an explicit category/domain pair
    Start {
        /// Category label (e.g. "News")
        category: String,
        /// Domain id, formatted as <domain>-<category>
        domain_id: String,
    },

    /// Stop the current session
    Stop,

    /// Print recorded browsing time
    Report {
        /// Day to show (YYYY-MM-DD); every day when omitted
        #[arg(long)]
        date: Option<String>,
        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Export an encrypted daily snapshot to the drive folder
    Sync {
        /// Day to export (YYYY-MM-DD); today when omitted
        #[arg(long)]
        date: Option<String>,
    },

    /// Set or replace the category of a domain
    Register {
        domain: String,
        category: String,
        #[arg(long = "subcategory")]
        subcategories: Vec<String>,
    },

    /// Print the open session, if any
    State,

    /// Check that the daemon is reachable
    Health,
}

#[derive(Clone, Copy, ValueEnum)]
enum VisibilityArg {
    Visible,
    Hidden,
}

impl From<VisibilityArg> for Visibility {
    fn from(value: VisibilityArg) -> Self {
        match value {
            VisibilityArg::Visible => Visibility::Visible,
            VisibilityArg::Hidden => Visibility::Hidden,
        }
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Handle => {
            if let Err(e) = handle::run() {
                tracing::error!(error = %e, "tab-hook handle failed");
                std::process::exit(1);
            }
        }
        command => {
            if let Err(e) = run(command) {
                tracing::warn!(error = %e, "tab-hook command failed");
                eprintln!("tab-hook: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run(command: Commands) -> Result<(), String> {
    match command {
        Commands::Handle => handle::run(),
        Commands::Activate { tab_id, url } => daemon_client::send_signal(
            SignalType::TabActivated,
            SignalFields {
                tab_id: Some(tab_id),
                url: Some(url),
                state: None,
            },
        ),
        Commands::FocusGained { tab_id, url } => daemon_client::send_signal(
            SignalType::FocusGained,
            SignalFields {
                tab_id: Some(tab_id),
                url: Some(url),
                state: None,
            },
        ),
        Commands::FocusLost => {
            daemon_client::send_signal(SignalType::FocusLost, SignalFields::default())
        }
        Commands::Deactivate { tab_id } => daemon_client::send_signal(
            SignalType::TabDeactivated,
            SignalFields {
                tab_id: Some(tab_id),
                ..SignalFields::default()
            },
        ),
        Commands::Visibility { state, tab_id, url } => daemon_client::send_signal(
            SignalType::VisibilityChanged,
            SignalFields {
                tab_id,
                url,
                state: Some(state.into()),
            },
        ),
        Commands::Unload { tab_id } => daemon_client::send_signal(
            SignalType::Unload,
            SignalFields {
                tab_id,
                ..SignalFields::default()
            },
        ),
        Commands::Start {
            category,
            domain_id,
        } => {
            let message = Message::StartTracking {
                category,
                domain_id,
            };
            message
                .validate()
                .map_err(|e| format!("{}: {}", e.code, e.message))?;
            daemon_client::send_message(&message).map(|_| ())
        }
        Commands::Stop => daemon_client::send_message(&Message::StopTracking).map(|_| ()),
        Commands::Report { date, json } => {
            let data = daemon_client::send_message(&Message::GetBrowsingData { date })?;
            if json {
                print_json(&data)
            } else {
                let records: Vec<DailyDomainRecord> = serde_json::from_value(data)
                    .map_err(|e| format!("Failed to parse browsing data: {}", e))?;
                print!("{}", report::render_records(&records));
                Ok(())
            }
        }
        Commands::Sync { date } => {
            let status = daemon_client::send_command(&Command::SyncToDrive { date })?;
            println!("{}", report::describe_sync(&status));
            Ok(())
        }
        Commands::Register {
            domain,
            category,
            subcategories,
        } => {
            let info = daemon_client::register_domain(&RegisterDomainParams {
                domain,
                category,
                subcategories,
            })?;
            print_json(&info)
        }
        Commands::State => print_json(&daemon_client::tracking_state()?),
        Commands::Health => print_json(&daemon_client::daemon_health()?),
    }
}

fn print_json(value: &Value) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to render JSON: {}", e))?;
    println!("{}", rendered);
    Ok(())
}
