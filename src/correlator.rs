//! External agent process discovery
//!
//! Periodically walks the process table, keeps the agent processes this
//! application did not launch, and resolves where each one runs and which
//! GUI application owns it. Every OS query is blocking; callers run
//! [`ProcessCorrelator::snapshot`] on a blocking worker.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::platform;
use crate::session::ManagedSet;

/// Parent chain walk limit
const MAX_PARENT_HOPS: usize = 10;

/// Executables that mention the agent on their command line without being it
const HELPER_BINARIES: &[&str] = &["ps", "lsof", "grep", "pgrep", "rg", "sh", "bash", "zsh"];

/// Agent invocations that are short-lived helpers, not sessions
const HELPER_ARGS: &[&str] = &["mcp", "--version", "-v", "--help", "-h", "update", "doctor"];

/// Interpreters the agent may run under (`node /usr/local/bin/claude`)
const INTERPRETERS: &[&str] = &["node", "bun", "deno"];

/// One row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "state", content = "path", rename_all = "snake_case")]
pub enum WorkingDirectory {
    Known(PathBuf),
    Unknown,
}

impl WorkingDirectory {
    pub fn path(&self) -> Option<&Path> {
        match self {
            WorkingDirectory::Known(p) => Some(p),
            WorkingDirectory::Unknown => None,
        }
    }
}

/// GUI application an external agent was launched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentApp {
    Terminal,
    AppleTerminal,
    ITerm,
    VsCode,
    Cursor,
    Warp,
    Ghostty,
    Kitty,
    Alacritty,
    WezTerm,
    GnomeTerminal,
    Konsole,
    Tmux,
    Zed,
}

impl ParentApp {
    pub fn display_name(&self) -> &'static str {
        match self {
            ParentApp::Terminal => "Terminal",
            ParentApp::AppleTerminal => "Apple Terminal",
            ParentApp::ITerm => "iTerm2",
            ParentApp::VsCode => "VS Code",
            ParentApp::Cursor => "Cursor",
            ParentApp::Warp => "Warp",
            ParentApp::Ghostty => "Ghostty",
            ParentApp::Kitty => "kitty",
            ParentApp::Alacritty => "Alacritty",
            ParentApp::WezTerm => "WezTerm",
            ParentApp::GnomeTerminal => "GNOME Terminal",
            ParentApp::Konsole => "Konsole",
            ParentApp::Tmux => "tmux",
            ParentApp::Zed => "Zed",
        }
    }
}

/// macOS app bundles, matched anywhere in the command line
const BUNDLE_TABLE: &[(&str, ParentApp)] = &[
    ("/Terminal.app/", ParentApp::AppleTerminal),
    ("/iTerm.app/", ParentApp::ITerm),
    ("/Visual Studio Code.app/", ParentApp::VsCode),
    ("/Cursor.app/", ParentApp::Cursor),
    ("/Warp.app/", ParentApp::Warp),
    ("/Ghostty.app/", ParentApp::Ghostty),
    ("/kitty.app/", ParentApp::Kitty),
    ("/Alacritty.app/", ParentApp::Alacritty),
    ("/WezTerm.app/", ParentApp::WezTerm),
    ("/Zed.app/", ParentApp::Zed),
];

/// Executable basenames
const BINARY_TABLE: &[(&str, ParentApp)] = &[
    ("iTerm2", ParentApp::ITerm),
    ("code", ParentApp::VsCode),
    ("cursor", ParentApp::Cursor),
    ("warp-terminal", ParentApp::Warp),
    ("ghostty", ParentApp::Ghostty),
    ("kitty", ParentApp::Kitty),
    ("alacritty", ParentApp::Alacritty),
    ("wezterm-gui", ParentApp::WezTerm),
    ("gnome-terminal-server", ParentApp::GnomeTerminal),
    ("konsole", ParentApp::Konsole),
    ("tmux", ParentApp::Tmux),
    ("zed", ParentApp::Zed),
    ("zed-editor", ParentApp::Zed),
];

/// An agent process running outside this application's management
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalProcess {
    pub pid: u32,
    pub working_directory: WorkingDirectory,
    pub started_at: Option<DateTime<Utc>>,
    pub parent_app: ParentApp,
    pub command: String,
}

impl ExternalProcess {
    pub fn display_name(&self) -> String {
        match &self.working_directory {
            WorkingDirectory::Known(dir) => platform::display_name_for(dir),
            WorkingDirectory::Unknown => "Unknown".to_string(),
        }
    }
}

// ============================================================================
// OS access
// ============================================================================

/// Read access to the host's process table
pub trait ProcessSource: Send + Sync {
    fn list_processes(&self) -> io::Result<Vec<ProcessEntry>>;
    fn is_alive(&self, pid: u32) -> bool;
    fn working_directory(&self, pid: u32) -> Option<PathBuf>;
    /// SIGTERM `pid`; true when it is gone or the signal was delivered
    fn terminate(&self, pid: u32) -> bool;
}

/// `ps` / `/proc` / `lsof` backed source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessSource;

/// Run a command and capture stdout.
///
/// stdout is read to EOF *before* waiting on the child: waiting first can
/// deadlock once the pipe buffer fills. stderr goes to /dev/null so there is
/// never a second pipe left undrained.
pub fn run_captured(program: &str, args: &[&str]) -> io::Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let mut bytes = Vec::new();
    let read_result = match child.stdout.take() {
        Some(mut stdout) => stdout.read_to_end(&mut bytes).map(|_| ()),
        None => Ok(()),
    };
    let status = child.wait()?;
    read_result?;

    if !status.success() {
        tracing::debug!("{} {:?} exited with {}", program, args, status);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Split off `n` whitespace-separated fields, returning them and the rest of
/// the line with its inner spacing intact.
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

/// Parse `pid ppid lstart(5 fields) command...`
pub fn parse_ps_line(line: &str) -> Option<ProcessEntry> {
    let (fields, command) = split_fields(line, 7)?;
    let pid = fields[0].parse().ok()?;
    let ppid = fields[1].parse().ok()?;
    let lstart = fields[2..7].join(" ");
    let started_at = NaiveDateTime::parse_from_str(&lstart, "%a %b %e %H:%M:%S %Y")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .map(|local| local.with_timezone(&Utc));

    let command = command.trim();
    if command.is_empty() {
        return None;
    }
    Some(ProcessEntry {
        pid,
        ppid,
        started_at,
        command: command.to_string(),
    })
}

fn parse_lsof_cwd(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .find_map(|line| line.strip_prefix('n'))
        .filter(|path| path.starts_with('/'))
        .map(PathBuf::from)
}

impl ProcessSource for SystemProcessSource {
    fn list_processes(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = run_captured("ps", &["-axww", "-o", "pid=,ppid=,lstart=,command="])?;
        Ok(output.lines().filter_map(parse_ps_line).collect())
    }

    fn is_alive(&self, pid: u32) -> bool {
        platform::is_process_alive(pid)
    }

    fn working_directory(&self, pid: u32) -> Option<PathBuf> {
        let proc_cwd = PathBuf::from(format!("/proc/{}/cwd", pid));
        if let Ok(path) = std::fs::read_link(&proc_cwd) {
            return Some(path);
        }
        let pid_arg = pid.to_string();
        match run_captured("lsof", &["-a", "-p", &pid_arg, "-d", "cwd", "-Fn"]) {
            Ok(output) => parse_lsof_cwd(&output),
            Err(e) => {
                tracing::debug!("lsof unavailable for pid {}: {}", pid, e);
                None
            }
        }
    }

    fn terminate(&self, pid: u32) -> bool {
        platform::terminate_process(pid)
    }
}

// ============================================================================
// Correlation
// ============================================================================

fn basename(token: &str) -> &str {
    Path::new(token)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(token)
}

pub struct ProcessCorrelator {
    source: Arc<dyn ProcessSource>,
    agent_binary: String,
    self_pid: u32,
    self_binary: Option<String>,
}

impl ProcessCorrelator {
    pub fn new(agent_binary: impl Into<String>) -> Self {
        Self::with_source(agent_binary, Arc::new(SystemProcessSource))
    }

    pub fn with_source(agent_binary: impl Into<String>, source: Arc<dyn ProcessSource>) -> Self {
        let self_binary = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));
        Self {
            source,
            agent_binary: agent_binary.into(),
            self_pid: std::process::id(),
            self_binary,
        }
    }

    /// Does `command` launch the agent itself (not a helper around it)?
    pub fn is_agent_command(&self, command: &str) -> bool {
        let mut tokens = command.split_whitespace();
        let Some(first) = tokens.next() else {
            return false;
        };
        let first_base = basename(first);

        if HELPER_BINARIES.contains(&first_base)
            || self.self_binary.as_deref() == Some(first_base)
        {
            return false;
        }

        let next = if first_base == self.agent_binary {
            tokens.next()
        } else if INTERPRETERS.contains(&first_base) {
            match tokens.next() {
                Some(script) if basename(script) == self.agent_binary => tokens.next(),
                _ => return false,
            }
        } else {
            return false;
        };

        !matches!(next, Some(arg) if HELPER_ARGS.contains(&arg))
    }

    pub fn terminate(&self, pid: u32) -> bool {
        self.source.terminate(pid)
    }

    /// Walk up the parent chain looking for a known terminal or editor.
    pub fn resolve_parent_app(pid: u32, table: &HashMap<u32, &ProcessEntry>) -> ParentApp {
        let mut current = table.get(&pid).map(|entry| entry.ppid);
        for _ in 0..MAX_PARENT_HOPS {
            let Some(ppid) = current else { break };
            if ppid <= 1 {
                break;
            }
            let Some(entry) = table.get(&ppid) else { break };

            if let Some((_, app)) = BUNDLE_TABLE
                .iter()
                .find(|(needle, _)| entry.command.contains(needle))
            {
                return *app;
            }
            let exe = entry.command.split_whitespace().next().map(basename);
            if let Some((_, app)) = BINARY_TABLE.iter().find(|(name, _)| Some(*name) == exe) {
                return *app;
            }
            current = Some(entry.ppid);
        }
        ParentApp::Terminal
    }

    /// Every live agent process on the host, managed or not. Blocking.
    pub fn scan_agent_processes(&self) -> Vec<ExternalProcess> {
        self.scan(&ManagedSet::default())
    }

    /// Live agent processes not in `managed`. Blocking.
    pub fn snapshot(&self, managed: &ManagedSet) -> Vec<ExternalProcess> {
        self.scan(managed)
    }

    fn scan(&self, managed: &ManagedSet) -> Vec<ExternalProcess> {
        let entries = match self.source.list_processes() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Process enumeration failed: {}", e);
                return Vec::new();
            }
        };
        let table: HashMap<u32, &ProcessEntry> = entries.iter().map(|e| (e.pid, e)).collect();

        let mut found: Vec<ExternalProcess> = entries
            .iter()
            .filter(|e| e.pid != self.self_pid && !managed.contains_pid(e.pid))
            .filter(|e| self.is_agent_command(&e.command))
            .filter(|e| self.source.is_alive(e.pid))
            .filter_map(|e| {
                let working_directory = match self.source.working_directory(e.pid) {
                    Some(dir) if managed.contains_dir(&dir) => return None,
                    Some(dir) => WorkingDirectory::Known(dir),
                    None => WorkingDirectory::Unknown,
                };
                Some(ExternalProcess {
                    pid: e.pid,
                    working_directory,
                    started_at: e.started_at,
                    parent_app: Self::resolve_parent_app(e.pid, &table),
                    command: e.command.clone(),
                })
            })
            .collect();

        found.sort_by_key(|p| p.pid);
        found
    }

    /// Poll forever, publishing each snapshot. The managed set is re-read on
    /// every cycle, never cached. Runs until the task is aborted, whether or
    /// not anyone holds a receiver.
    pub async fn run(
        self: Arc<Self>,
        managed: watch::Receiver<ManagedSet>,
        snapshots: watch::Sender<Arc<Vec<ExternalProcess>>>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let managed_now = managed.borrow().clone();
            let this = Arc::clone(&self);
            let result = tokio::task::spawn_blocking(move || this.snapshot(&managed_now)).await;

            match result {
                Ok(list) => {
                    let previous = snapshots.borrow().len();
                    if list.len() != previous {
                        tracing::info!("External agent processes: {} -> {}", previous, list.len());
                    }
                    snapshots.send_replace(Arc::new(list));
                }
                Err(e) => tracing::warn!("Process scan task failed: {}", e),
            }
        }
    }
}
