//! Hook channel
//!
//! The agent's hook configuration runs `agentdeck hook`, which appends one
//! JSON line per event to a shared file. The daemon tail-follows that file
//! and hands parsed events to the registry. Hook events are authoritative:
//! once one arrives for a session, output heuristics stop deciding its state.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid hook payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEventKind {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    Notification,
    PermissionRequest,
    Stop,
    SubagentStop,
    SessionEnd,
    #[serde(other)]
    Other,
}

impl HookEventKind {
    /// The waiting state this event implies, or `None` when it only proves
    /// the session emits hooks.
    pub fn waiting(&self) -> Option<bool> {
        match self {
            HookEventKind::SessionStart
            | HookEventKind::Stop
            | HookEventKind::Notification
            | HookEventKind::PermissionRequest => Some(true),
            HookEventKind::UserPromptSubmit
            | HookEventKind::PreToolUse
            | HookEventKind::PostToolUse
            | HookEventKind::SessionEnd => Some(false),
            HookEventKind::SubagentStop | HookEventKind::Other => None,
        }
    }
}

/// One line of the hook file. Extra fields in the agent's payload are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEvent {
    #[serde(alias = "hook_event_name")]
    pub event: HookEventKind,
    #[serde(alias = "working_directory")]
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

pub fn parse_hook_line(line: &[u8]) -> Result<HookEvent, serde_json::Error> {
    serde_json::from_slice(line)
}

/// Validate a hook payload and append it to `path` as one compact line.
pub fn append_hook_event(path: &Path, payload: &str) -> Result<HookEvent, HookError> {
    let event: HookEvent = serde_json::from_str(payload.trim())?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut line = serde_json::to_vec(&event)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    Ok(event)
}

/// Incremental reader over the hook file
#[derive(Debug)]
pub struct HookTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl HookTail {
    /// Start reading from the beginning of the file
    pub fn from_start(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// Start reading after whatever the file holds right now
    pub fn at_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            path,
            offset,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the complete lines appended since the last call.
    pub fn read_new(&mut self) -> Vec<HookEvent> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Cannot open hook file {:?}: {}", self.path, e);
                }
                self.offset = 0;
                self.partial.clear();
                return Vec::new();
            }
        };

        let len = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!("Cannot stat hook file {:?}: {}", self.path, e);
                return Vec::new();
            }
        };
        if len < self.offset {
            tracing::info!("Hook file {:?} was truncated, rereading", self.path);
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Vec::new();
        }

        let mut buf = Vec::new();
        let read = file
            .seek(SeekFrom::Start(self.offset))
            .and_then(|_| file.read_to_end(&mut buf));
        if let Err(e) = read {
            tracing::warn!("Failed to read hook file {:?}: {}", self.path, e);
            return Vec::new();
        }
        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        let Some(last_newline) = self.partial.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();

        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .filter_map(|line| match parse_hook_line(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(
                        "Skipping malformed hook line {:?}: {}",
                        String::from_utf8_lossy(line),
                        e
                    );
                    None
                }
            })
            .collect()
    }
}

/// Tail-follows the hook file on a background thread
pub struct HookWatcher {
    stop_flag: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl HookWatcher {
    /// Start following `path` from its current end. File notifications
    /// trigger reads; `fallback` bounds how long a missed notification can
    /// delay an event.
    pub fn spawn(
        path: PathBuf,
        fallback: Duration,
        events: mpsc::UnboundedSender<HookEvent>,
    ) -> Result<Self, HookError> {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        let tail = HookTail::at_end(&path);
        tracing::info!("Following hook file {:?} from offset {}", path, tail.offset);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_flag);
        let handle = std::thread::Builder::new()
            .name("hook-watcher".to_string())
            .spawn(move || Self::run(watcher, rx, tail, fallback, events, stop))?;

        Ok(Self {
            stop_flag,
            handle: Some(handle),
        })
    }

    fn run(
        _watcher: RecommendedWatcher,
        rx: std::sync::mpsc::Receiver<Event>,
        mut tail: HookTail,
        fallback: Duration,
        events: mpsc::UnboundedSender<HookEvent>,
        stop: Arc<AtomicBool>,
    ) {
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let should_read = match rx.recv_timeout(fallback) {
                Ok(event) => {
                    matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event.paths.iter().any(|p| p.file_name() == tail.path().file_name())
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => true,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Hook file watcher disconnected");
                    break;
                }
            };
            if !should_read {
                continue;
            }

            for event in tail.read_new() {
                tracing::debug!("Hook {:?} in {:?}", event.event, event.cwd);
                if events.send(event).is_err() {
                    tracing::debug!("Hook receiver dropped, stopping watcher");
                    return;
                }
            }
        }
        tracing::info!("Hook watcher stopped");
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HookWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
