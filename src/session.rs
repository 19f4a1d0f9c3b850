//! Session data model
//!
//! Identifiers, lifecycle status, groups and the read-only views handed out
//! by the registry. The mutable records themselves live in `registry`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use crate::correlator::ExternalProcess;
use crate::transcript::{CompletionReason, RecordKind};

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Fresh random identifier (12 hex chars)
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string()[..12].to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(SessionId);
opaque_id!(GroupId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Waiting,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    /// Rank used for a group's aggregate status: running > waiting > failed >
    /// idle/completed.
    pub fn priority(&self) -> u8 {
        match self {
            SessionStatus::Running => 3,
            SessionStatus::Waiting => 2,
            SessionStatus::Failed => 1,
            SessionStatus::Idle | SessionStatus::Completed => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest-priority status among `statuses`; an empty group is idle.
pub fn aggregate_status<I>(statuses: I) -> SessionStatus
where
    I: IntoIterator<Item = SessionStatus>,
{
    statuses
        .into_iter()
        .max_by_key(|s| s.priority())
        .unwrap_or(SessionStatus::Idle)
}

/// How the sessions of a group are laid out by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Grid,
    Columns,
    Rows,
    Tabs,
}

impl std::str::FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grid" => Ok(Layout::Grid),
            "columns" => Ok(Layout::Columns),
            "rows" => Ok(Layout::Rows),
            "tabs" => Ok(Layout::Tabs),
            other => Err(format!("unknown layout: {}", other)),
        }
    }
}

/// Point-in-time copy of a managed session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub working_directory: PathBuf,
    pub display_name: String,
    pub status: SessionStatus,
    pub is_running: bool,
    pub is_waiting: bool,
    pub group_id: Option<GroupId>,
    pub pid: Option<u32>,
    pub hook_managed: bool,
    pub transcript_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<u32>,
    pub last_record_kind: Option<RecordKind>,
    pub last_completion_reason: Option<CompletionReason>,
}

/// Point-in-time copy of a session group
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub working_directories: Vec<PathBuf>,
    pub layout: Layout,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub broadcast_enabled: bool,
}

/// Running/waiting totals for badges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub running: usize,
    pub waiting: usize,
}

/// Pids and working directories this application manages. Written only by
/// the registry; the correlator reads a fresh copy every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedSet {
    pub pids: HashSet<u32>,
    pub directories: HashSet<PathBuf>,
}

impl ManagedSet {
    pub fn contains_pid(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    pub fn contains_dir(&self, dir: &std::path::Path) -> bool {
        self.directories.contains(dir)
    }
}

/// Everything a menu or badge renders, managed or not
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionView {
    Managed(SessionSnapshot),
    External(ExternalProcess),
}

impl SessionView {
    pub fn display_name(&self) -> String {
        match self {
            SessionView::Managed(s) => s.display_name.clone(),
            SessionView::External(p) => p.display_name(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            SessionView::Managed(s) => s.pid,
            SessionView::External(p) => Some(p.pid),
        }
    }
}
