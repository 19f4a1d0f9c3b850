//! Transcript tail classifier
//!
//! The agent appends one JSON object per line to its transcript at
//! `~/.claude/projects/{encoded-project-path}/{conversation-id}.jsonl`.
//! Only the newest well-formed record matters, so the file is read from the
//! end in growing windows instead of being parsed front to back.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::Config;

/// First tail window; doubled until a record is found or the file is exhausted.
const INITIAL_WINDOW: u64 = 64 * 1024;

/// Largest tail read per poll. A file with no record this close to its end
/// counts as having none.
const MAX_WINDOW: u64 = 4 * 1024 * 1024;

// ============================================================================
// Path Encoding
// ============================================================================

/// Convert a project path to the agent's encoded directory name
/// `/home/bigphoot/my.app` → `-home-bigphoot-my-app`
pub fn encode_project_path(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Full path to the transcript for a conversation started in `project_path`
pub fn get_transcript_path(project_path: &Path, conversation_id: &str) -> PathBuf {
    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/home"));
    let encoded = encode_project_path(&project_path.to_string_lossy());
    home.join(".claude")
        .join("projects")
        .join(encoded)
        .join(format!("{}.jsonl", conversation_id))
}

// ============================================================================
// Record Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    UserSubmitted,
    Assistant,
    Progress,
    ToolResult,
    FinalResult,
    SessionSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    TurnComplete,
    ToolUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStatus {
    Idle,
    Running,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptRecord {
    pub kind: RecordKind,
    pub completion_reason: Option<CompletionReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TranscriptSnapshot {
    pub status: TranscriptStatus,
    pub last_kind: Option<RecordKind>,
    pub last_completion_reason: Option<CompletionReason>,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "type", alias = "kind")]
    entry_type: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    content: Option<serde_json::Value>,
}

/// A user entry made only of `tool_result` blocks is the tool talking back,
/// not the human.
fn is_tool_result_content(content: &serde_json::Value) -> bool {
    match content.as_array() {
        Some(blocks) if !blocks.is_empty() => blocks
            .iter()
            .all(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result")),
        _ => false,
    }
}

/// Parse one line. Returns None for malformed JSON and for record kinds that
/// carry no state (system notes, file snapshots, ...).
pub fn parse_record(line: &str) -> Option<TranscriptRecord> {
    let entry: RawEntry = serde_json::from_str(line).ok()?;
    let kind = match entry.entry_type.as_deref()? {
        "user" => {
            let tool_result = entry
                .message
                .as_ref()
                .and_then(|m| m.content.as_ref())
                .is_some_and(is_tool_result_content);
            if tool_result {
                RecordKind::ToolResult
            } else {
                RecordKind::UserSubmitted
            }
        }
        "assistant" => RecordKind::Assistant,
        "progress" => RecordKind::Progress,
        "tool_result" => RecordKind::ToolResult,
        "result" => RecordKind::FinalResult,
        "summary" => RecordKind::SessionSummary,
        _ => return None,
    };

    let completion_reason = if kind == RecordKind::Assistant {
        let reason = entry
            .message
            .as_ref()
            .and_then(|m| m.stop_reason.as_deref())
            .or(entry.stop_reason.as_deref());
        match reason {
            Some("end_turn") => Some(CompletionReason::TurnComplete),
            Some("tool_use") => Some(CompletionReason::ToolUse),
            _ => None,
        }
    } else {
        None
    };

    Some(TranscriptRecord {
        kind,
        completion_reason,
    })
}

/// Newest parsable record in `data`, scanning lines from the end.
pub fn last_record(data: &[u8]) -> Option<TranscriptRecord> {
    data.split(|b| *b == b'\n')
        .rev()
        .filter_map(|line| std::str::from_utf8(line).ok())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(parse_record)
}

fn last_record_in_file(
    file: &mut File,
    len: u64,
    max_window: u64,
) -> io::Result<Option<TranscriptRecord>> {
    let limit = max_window.min(len);
    let mut window = INITIAL_WINDOW.min(limit);
    loop {
        let start = len - window;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity(window as usize);
        file.by_ref().take(window).read_to_end(&mut buf)?;

        // A window that starts mid-file almost always starts mid-line
        let slice: &[u8] = if start > 0 {
            match buf.iter().position(|b| *b == b'\n') {
                Some(i) => &buf[i + 1..],
                None => &[],
            }
        } else {
            &buf
        };

        if let Some(record) = last_record(slice) {
            return Ok(Some(record));
        }
        if start == 0 || window >= limit {
            return Ok(None);
        }
        window = (window * 2).min(limit);
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Stateless classifier; thresholds only.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptTailClassifier {
    pub stale_after: Duration,
    pub grace: Duration,
}

impl Default for TranscriptTailClassifier {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            grace: Duration::from_secs(30),
        }
    }
}

impl TranscriptTailClassifier {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stale_after: Duration::from_secs(config.transcript_stale_secs),
            grace: Duration::from_secs(config.transcript_grace_secs),
        }
    }

    /// Status from the newest record and the file's age.
    pub fn classify_record(&self, record: Option<TranscriptRecord>, age: Duration) -> TranscriptSnapshot {
        let status = if age >= self.stale_after {
            TranscriptStatus::Idle
        } else {
            match record {
                None if age < self.grace => TranscriptStatus::Running,
                None => TranscriptStatus::Waiting,
                Some(r) => match (r.kind, r.completion_reason) {
                    (RecordKind::UserSubmitted, _) => TranscriptStatus::Running,
                    (RecordKind::Assistant, Some(CompletionReason::TurnComplete)) => {
                        TranscriptStatus::Waiting
                    }
                    (RecordKind::Assistant, Some(CompletionReason::ToolUse))
                    | (RecordKind::Progress, _)
                    | (RecordKind::ToolResult, _)
                    | (RecordKind::FinalResult, _) => TranscriptStatus::Running,
                    (RecordKind::SessionSummary, _) => TranscriptStatus::Waiting,
                    (RecordKind::Assistant, None) if age < self.grace => TranscriptStatus::Running,
                    (RecordKind::Assistant, None) => TranscriptStatus::Waiting,
                },
            }
        };

        TranscriptSnapshot {
            status,
            last_kind: record.map(|r| r.kind),
            last_completion_reason: record.and_then(|r| r.completion_reason),
        }
    }

    /// Classify the transcript at `path` as of now.
    ///
    /// A file that does not exist yet is aged from `started_at` (the session
    /// launch); without it the file is treated as brand new.
    pub fn classify(&self, path: &Path, started_at: Option<SystemTime>) -> TranscriptSnapshot {
        self.classify_at(path, SystemTime::now(), started_at)
    }

    pub fn classify_at(
        &self,
        path: &Path,
        now: SystemTime,
        started_at: Option<SystemTime>,
    ) -> TranscriptSnapshot {
        let age_since = |t: SystemTime| now.duration_since(t).unwrap_or(Duration::ZERO);

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to open transcript {:?}: {}", path, e);
                }
                let age = started_at.map(age_since).unwrap_or(Duration::ZERO);
                return self.classify_record(None, age);
            }
        };

        let (len, age) = match file.metadata() {
            Ok(meta) => (
                meta.len(),
                meta.modified().map(age_since).unwrap_or(Duration::ZERO),
            ),
            Err(e) => {
                tracing::warn!("Failed to stat transcript {:?}: {}", path, e);
                (0, Duration::ZERO)
            }
        };

        let record = match last_record_in_file(&mut file, len, MAX_WINDOW) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to read transcript {:?}: {}", path, e);
                None
            }
        };
        self.classify_record(record, age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TURN_COMPLETE: &str =
        r#"{"type":"assistant","message":{"role":"assistant","stop_reason":"end_turn","content":[]}}"#;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn record(kind: RecordKind, reason: Option<CompletionReason>) -> Option<TranscriptRecord> {
        Some(TranscriptRecord {
            kind,
            completion_reason: reason,
        })
    }

    fn write_transcript(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_encode_project_path() {
        assert_eq!(encode_project_path("/home/bigphoot/Desktop"), "-home-bigphoot-Desktop");
        assert_eq!(encode_project_path("/srv/my.app"), "-srv-my-app");
    }

    #[test]
    fn test_transcript_path_construction() {
        let path = get_transcript_path(Path::new("/home/user/project"), "abc-123");
        assert!(path.to_string_lossy().contains(".claude/projects/-home-user-project"));
        assert!(path.to_string_lossy().ends_with("abc-123.jsonl"));
    }

    #[test]
    fn test_parse_record_kinds() {
        assert_eq!(
            parse_record(TURN_COMPLETE),
            record(RecordKind::Assistant, Some(CompletionReason::TurnComplete))
        );
        assert_eq!(
            parse_record(r#"{"type":"assistant","message":{"stop_reason":"tool_use"}}"#),
            record(RecordKind::Assistant, Some(CompletionReason::ToolUse))
        );
        assert_eq!(
            parse_record(r#"{"type":"user","message":{"role":"user","content":"fix it"}}"#),
            record(RecordKind::UserSubmitted, None)
        );
        assert_eq!(
            parse_record(
                r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#
            ),
            record(RecordKind::ToolResult, None)
        );
        assert_eq!(
            parse_record(r#"{"type":"summary","summary":"Refactor"}"#),
            record(RecordKind::SessionSummary, None)
        );
        assert_eq!(parse_record(r#"{"type":"file-history-snapshot"}"#), None);
        assert_eq!(parse_record("{\"type\":\"assist"), None);
    }

    #[test]
    fn test_last_record_skips_partial_trailing_line() {
        let data = format!(
            "{}\n{}\n{{\"type\":\"user\",\"mess",
            r#"{"type":"user","message":{"content":"hi"}}"#,
            TURN_COMPLETE
        );
        assert_eq!(
            last_record(data.as_bytes()),
            record(RecordKind::Assistant, Some(CompletionReason::TurnComplete))
        );
    }

    #[test]
    fn test_classification_rules() {
        let c = TranscriptTailClassifier::default();
        let status = |r, age| c.classify_record(r, age).status;

        assert_eq!(status(record(RecordKind::UserSubmitted, None), secs(1)), TranscriptStatus::Running);
        assert_eq!(
            status(record(RecordKind::Assistant, Some(CompletionReason::TurnComplete)), secs(1)),
            TranscriptStatus::Waiting
        );
        assert_eq!(
            status(record(RecordKind::Assistant, Some(CompletionReason::ToolUse)), secs(100)),
            TranscriptStatus::Running
        );
        assert_eq!(status(record(RecordKind::Progress, None), secs(1)), TranscriptStatus::Running);
        assert_eq!(status(record(RecordKind::ToolResult, None), secs(1)), TranscriptStatus::Running);
        assert_eq!(status(record(RecordKind::FinalResult, None), secs(1)), TranscriptStatus::Running);
        assert_eq!(status(record(RecordKind::SessionSummary, None), secs(1)), TranscriptStatus::Waiting);
        assert_eq!(status(record(RecordKind::Assistant, None), secs(10)), TranscriptStatus::Running);
        assert_eq!(status(record(RecordKind::Assistant, None), secs(45)), TranscriptStatus::Waiting);
    }

    #[test]
    fn test_staleness_wins_over_content() {
        let c = TranscriptTailClassifier::default();
        let snap = c.classify_record(record(RecordKind::UserSubmitted, None), secs(301));
        assert_eq!(snap.status, TranscriptStatus::Idle);
        assert_eq!(snap.last_kind, Some(RecordKind::UserSubmitted));
    }

    #[test]
    fn test_empty_file_uses_time_fallback() {
        let c = TranscriptTailClassifier::default();
        let file = write_transcript(&[]);
        let modified = std::fs::metadata(file.path()).unwrap().modified().unwrap();

        let fresh = c.classify_at(file.path(), modified + secs(10), None);
        assert_eq!(fresh.status, TranscriptStatus::Running);
        assert_eq!(fresh.last_kind, None);

        let older = c.classify_at(file.path(), modified + secs(45), None);
        assert_eq!(older.status, TranscriptStatus::Waiting);
    }

    #[test]
    fn test_turn_complete_file_recent_and_stale() {
        let c = TranscriptTailClassifier::default();
        let file = write_transcript(&[r#"{"type":"user","message":{"content":"go"}}"#, TURN_COMPLETE]);

        let recent = c.classify(file.path(), None);
        assert_eq!(recent.status, TranscriptStatus::Waiting);
        assert_eq!(recent.last_completion_reason, Some(CompletionReason::TurnComplete));

        let old = SystemTime::now() - secs(6 * 60);
        file.as_file().set_modified(old).unwrap();
        assert_eq!(c.classify(file.path(), None).status, TranscriptStatus::Idle);
    }

    #[test]
    fn test_missing_file_ages_from_session_start() {
        let c = TranscriptTailClassifier::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.jsonl");
        let now = SystemTime::now();

        assert_eq!(c.classify_at(&path, now, None).status, TranscriptStatus::Running);
        assert_eq!(
            c.classify_at(&path, now, Some(now - secs(40))).status,
            TranscriptStatus::Waiting
        );
    }

    #[test]
    fn test_large_file_reads_past_first_window() {
        let c = TranscriptTailClassifier::default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", TURN_COMPLETE).unwrap();
        // One enormous malformed line larger than the initial window
        let junk = "x".repeat((INITIAL_WINDOW as usize) * 3);
        writeln!(file, "{}", junk).unwrap();
        file.flush().unwrap();

        let snap = c.classify(file.path(), None);
        assert_eq!(snap.last_kind, Some(RecordKind::Assistant));
        assert_eq!(snap.status, TranscriptStatus::Waiting);
    }

    #[test]
    fn test_tail_read_stops_at_window_cap() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", TURN_COMPLETE).unwrap();
        let junk = "x".repeat((INITIAL_WINDOW as usize) * 3);
        writeln!(file, "{}", junk).unwrap();
        file.flush().unwrap();
        let len = file.as_file().metadata().unwrap().len();

        let mut f = File::open(file.path()).unwrap();
        let capped = last_record_in_file(&mut f, len, INITIAL_WINDOW * 2).unwrap();
        assert_eq!(capped, None);

        let uncapped = last_record_in_file(&mut f, len, len).unwrap();
        assert_eq!(uncapped.map(|r| r.kind), Some(RecordKind::Assistant));
    }
}
