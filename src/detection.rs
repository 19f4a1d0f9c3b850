//! Ready-for-input detection on raw terminal output
//!
//! This module provides:
//! - ANSI-stripped normalization of PTY bytes
//! - Tail extraction focused on the last few non-empty lines
//! - An ordered ready-marker matcher

use regex::Regex;
use strip_ansi_escapes::strip;

use crate::config::ConfigError;

/// How many non-empty trailing lines are inspected for a ready marker.
/// Stale prompts further up the screen must not count.
const TAIL_LINES: usize = 6;

/// Strip escape sequences and decode lossily. Carriage returns are treated as
/// line breaks so redraws of the same row don't glue together.
pub fn strip_ansi_and_normalize(input: &[u8]) -> String {
    let stripped = strip(input);
    String::from_utf8_lossy(&stripped)
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

/// The last `count` non-empty lines of `text`, oldest first.
pub fn tail_lines(text: &str, count: usize) -> Vec<&str> {
    let mut lines: Vec<&str> = text
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(count)
        .collect();
    lines.reverse();
    lines
}

/// Ordered set of "ready for input" markers.
#[derive(Debug, Clone)]
pub struct ReadyMatcher {
    markers: Vec<Regex>,
}

impl ReadyMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let markers = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|source| ConfigError::Marker {
                    pattern: p.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { markers })
    }

    /// Index of the first marker (in configured order) found in the tail of
    /// `raw`, after control sequences are stripped.
    pub fn find(&self, raw: &[u8]) -> Option<usize> {
        let normalized = strip_ansi_and_normalize(raw);
        let tail = tail_lines(&normalized, TAIL_LINES);

        self.markers
            .iter()
            .position(|marker| tail.iter().any(|line| marker.is_match(line)))
    }

    pub fn is_ready(&self, raw: &[u8]) -> bool {
        self.find(raw).is_some()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
