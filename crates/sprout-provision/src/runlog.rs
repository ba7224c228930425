//! Structured step markers in the run log
//!
//! Every step transition is logged as one line carrying a marker:
//!
//! ```text
//! SPROUT_STEP|START|prepare-disks|pre-cluster|2025-06-01T12:00:00Z|Format, mount and persist the selected disks
//! ```
//!
//! The marker may be preceded by anything the log formatter adds (timestamp,
//! level, colour codes). Readers find it with [`parse_marker`].

use std::fmt;

use chrono::{DateTime, Utc};

use crate::catalogue::Phase;

pub const MARKER_PREFIX: &str = "SPROUT_STEP";

/// Kind of step transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Step will be considered in this run
    Plan,
    Start,
    Done,
    Skip,
    Fail,
    /// Never attempted because an earlier step failed
    NotRun,
    /// Run finished; step and phase are empty
    Complete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "PLAN",
            Self::Start => "START",
            Self::Done => "DONE",
            Self::Skip => "SKIP",
            Self::Fail => "FAIL",
            Self::NotRun => "NOTRUN",
            Self::Complete => "COMPLETE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PLAN" => Self::Plan,
            "START" => Self::Start,
            "DONE" => Self::Done,
            "SKIP" => Self::Skip,
            "FAIL" => Self::Fail,
            "NOTRUN" => Self::NotRun,
            "COMPLETE" => Self::Complete,
            _ => return None,
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEvent {
    pub kind: EventKind,
    pub step: String,
    pub phase: Option<Phase>,
    pub at: DateTime<Utc>,
    /// Description, message, skip reason or error text
    pub detail: String,
}

impl StepEvent {
    pub fn new(kind: EventKind, step: &str, phase: Phase, detail: impl Into<String>) -> Self {
        Self {
            kind,
            step: step.to_string(),
            phase: Some(phase),
            at: Utc::now(),
            detail: detail.into(),
        }
    }

    /// End-of-run event
    pub fn complete(detail: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Complete,
            step: String::new(),
            phase: None,
            at: Utc::now(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for StepEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Detail is the last field and may contain '|'; newlines would split the marker
        let detail = self.detail.replace(['\r', '\n'], " ");
        let phase = self.phase.map(|p| p.to_string()).unwrap_or_default();
        write!(
            f,
            "{MARKER_PREFIX}|{}|{}|{}|{}|{}",
            self.kind,
            self.step,
            phase,
            self.at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            detail
        )
    }
}

/// Find and parse a step marker anywhere on a log line
pub fn parse_marker(line: &str) -> Option<StepEvent> {
    let clean = strip_ansi_codes(line.trim_end());
    let start = clean.find(MARKER_PREFIX)?;
    let parts: Vec<&str> = clean[start..].splitn(6, '|').collect();
    if parts.len() < 5 || parts[0] != MARKER_PREFIX {
        return None;
    }

    let kind = EventKind::parse(parts[1])?;
    let phase = match parts[3] {
        "" => None,
        p => Some(p.parse().ok()?),
    };
    if kind != EventKind::Complete && (parts[2].is_empty() || phase.is_none()) {
        return None;
    }
    let at = DateTime::parse_from_rfc3339(parts[4]).ok()?.with_timezone(&Utc);

    Some(StepEvent {
        kind,
        step: parts[2].to_string(),
        phase,
        at,
        detail: parts.get(5).unwrap_or(&"").to_string(),
    })
}

/// Strip ANSI escape codes from a string
pub fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // Skip until the final letter of the sequence
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_found_after_log_prefix() {
        let line = "2025-06-01T12:00:00.123Z  INFO sprout_provision::orchestrator: SPROUT_STEP|FAIL|prepare-disks|pre-cluster|2025-06-01T12:00:00Z|PrepareDisks.Mount./dev/sdb: `mount` failed: busy";
        let event = parse_marker(line).unwrap();
        assert_eq!(event.kind, EventKind::Fail);
        assert_eq!(event.step, "prepare-disks");
        assert_eq!(event.phase, Some(Phase::PreCluster));
        assert!(event.detail.contains("mount` failed"));
    }

    #[test]
    fn test_marker_with_ansi_codes() {
        let line = "\x1b[32m INFO\x1b[0m SPROUT_STEP|DONE|open-ports|pre-cluster|2025-06-01T12:00:00Z|";
        let event = parse_marker(line).unwrap();
        assert_eq!(event.kind, EventKind::Done);
        assert_eq!(event.detail, "");
    }

    #[test]
    fn test_display_parses_back() {
        let event = StepEvent::new(
            EventKind::Skip,
            "setup-rocm",
            Phase::PreCluster,
            "not a GPU node\nsecond line",
        );
        let parsed = parse_marker(&event.to_string()).unwrap();
        assert_eq!(parsed.step, "setup-rocm");
        assert_eq!(parsed.detail, "not a GPU node second line");
    }

    #[test]
    fn test_complete_has_no_step() {
        let parsed = parse_marker(&StepEvent::complete("23 steps").to_string()).unwrap();
        assert_eq!(parsed.kind, EventKind::Complete);
        assert!(parsed.phase.is_none());
    }

    #[test]
    fn test_malformed_lines_ignored() {
        for line in [
            "plain log line",
            "SPROUT_STEP|START|check-os",
            "SPROUT_STEP|BOGUS|check-os|pre-cluster|2025-06-01T12:00:00Z|",
            "SPROUT_STEP|START|check-os|mid-cluster|2025-06-01T12:00:00Z|",
            "SPROUT_STEP|START|check-os|pre-cluster|yesterday|",
            "SPROUT_STEP|START||pre-cluster|2025-06-01T12:00:00Z|",
        ] {
            assert!(parse_marker(line).is_none(), "{line}");
        }
    }
}
