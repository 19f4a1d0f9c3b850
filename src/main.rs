//! agentdeck - Know which of your coding agents is waiting for you
//!
//! Usage:
//!   agentdeck run                 # Run the agent in the current directory
//!   agentdeck run ~/api ~/web     # Run a group, stdin is broadcast to all
//!   agentdeck scan                # List agents running in other terminals
//!   agentdeck transcript <FILE>   # Classify a transcript file
//!   agentdeck hook                # Append a hook event read from stdin
//!   agentdeck --help              # Show help

use agentdeck::config::{Config, ConfigError};
use agentdeck::correlator::{ProcessCorrelator, WorkingDirectory};
use agentdeck::session::Layout;
use agentdeck::transcript::TranscriptTailClassifier;
use agentdeck::{daemon, hooks};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "agentdeck")]
#[command(author = "bigphoot")]
#[command(version)]
#[command(about = "Track idle, working and waiting coding-agent sessions", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.agentdeck/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the agent in each directory and track it until exit
    Run {
        /// Working directories (defaults to the current directory)
        dirs: Vec<PathBuf>,

        /// Layout hint for a multi-directory group
        #[arg(long, default_value = "grid")]
        layout: Layout,

        /// Don't fan stdin out to every session of the group
        #[arg(long)]
        no_broadcast: bool,
    },
    /// List agent processes running outside agentdeck
    Scan {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Classify a transcript file
    Transcript {
        file: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Append the hook payload on stdin to the hook file
    Hook,
}

fn init_tracing(default_directive: &str) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = default_directive.parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Hooks run inside the agent; keep them quiet
    match cli.command {
        Commands::Hook => init_tracing("agentdeck=warn"),
        _ => init_tracing("agentdeck=info"),
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run {
            dirs,
            layout,
            no_broadcast,
        } => {
            let dirs = match resolve_dirs(dirs) {
                Ok(dirs) => dirs,
                Err(e) => {
                    eprintln!("{}: {}", "Invalid directory".red().bold(), e);
                    return ExitCode::FAILURE;
                }
            };
            match daemon::run(config, dirs, layout, !no_broadcast).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}: {}", "Error".red().bold(), e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Scan { json } => show_scan(&config, json).await,
        Commands::Transcript { file, json } => show_transcript(&config, &file, json),
        Commands::Hook => append_hook(&config),
    }
}

fn resolve_dirs(dirs: Vec<PathBuf>) -> std::io::Result<Vec<PathBuf>> {
    dirs.into_iter()
        .map(|dir| {
            std::fs::canonicalize(&dir).map_err(|e| {
                std::io::Error::new(e.kind(), format!("{}: {}", dir.display(), e))
            })
        })
        .collect()
}

async fn show_scan(config: &Config, json: bool) -> ExitCode {
    let agent = Path::new(&config.agent_command)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| config.agent_command.clone());
    let correlator = ProcessCorrelator::new(agent);
    let processes = match tokio::task::spawn_blocking(move || correlator.scan_agent_processes()).await {
        Ok(processes) => processes,
        Err(e) => {
            eprintln!("{}: {}", "Scan failed".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    if json {
        return match serde_json::to_string_pretty(&processes) {
            Ok(out) => {
                println!("{}", out);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red().bold(), e);
                ExitCode::FAILURE
            }
        };
    }

    if processes.is_empty() {
        println!("{}", "No agent processes found".dimmed());
        return ExitCode::SUCCESS;
    }
    println!("{}", "Agent processes".bold());
    for p in &processes {
        let dir = match &p.working_directory {
            WorkingDirectory::Known(dir) => dir.display().to_string(),
            WorkingDirectory::Unknown => "unknown".dimmed().to_string(),
        };
        let started = p
            .started_at
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {:>7}  {:<16} {:<14} {} {}",
            p.pid.to_string().cyan(),
            p.display_name().bold(),
            p.parent_app.display_name(),
            started.dimmed(),
            dir
        );
    }
    ExitCode::SUCCESS
}

fn show_transcript(config: &Config, file: &Path, json: bool) -> ExitCode {
    let snapshot = TranscriptTailClassifier::from_config(config).classify(file, None);
    if json {
        return match serde_json::to_string_pretty(&snapshot) {
            Ok(out) => {
                println!("{}", out);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red().bold(), e);
                ExitCode::FAILURE
            }
        };
    }

    let status = format!("{:?}", snapshot.status).to_lowercase();
    println!("{}: {}", "Status".bold(), status.cyan());
    if let Some(kind) = snapshot.last_kind {
        println!("{}: {:?}", "Last record".bold(), kind);
    }
    if let Some(reason) = snapshot.last_completion_reason {
        println!("{}: {:?}", "Completion".bold(), reason);
    }
    ExitCode::SUCCESS
}

fn append_hook(config: &Config) -> ExitCode {
    let mut payload = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut payload) {
        eprintln!("{}: {}", "Failed to read hook payload".red(), e);
        return ExitCode::FAILURE;
    }
    match hooks::append_hook_event(&config.hook_file_path(), &payload) {
        Ok(event) => {
            tracing::debug!("Recorded hook {:?}", event.event);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Hook not recorded".red(), e);
            ExitCode::FAILURE
        }
    }
}
