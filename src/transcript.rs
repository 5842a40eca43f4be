//! Append-only transcript log
//!
//! Committed utterances from both parties accumulate here in the order the
//! session observed their finalization. Commit order is render order; nothing
//! reorders, edits, or removes an entry once it is in.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The local human on the microphone
    Caller,
    /// The remote conversational agent
    Agent,
    /// The session itself (status notices, never persisted)
    System,
}

impl Speaker {
    /// Display label used in rendered transcript lines.
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::Caller => "Caller",
            Speaker::Agent => "Agent",
            Speaker::System => "System",
        }
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One finalized utterance.
#[derive(Debug, Clone, Serialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
    /// When the session observed the finalized text, not when it was spoken
    pub observed_at: DateTime<Utc>,
}

/// Ordered collection of committed utterances for one session.
#[derive(Debug, Clone, Default)]
pub struct TranscriptLog {
    entries: Vec<Utterance>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finalized utterance and return its position in the log.
    pub fn commit(&mut self, speaker: Speaker, text: impl Into<String>) -> usize {
        let text = text.into();
        let position = self.entries.len();
        log::debug!(
            "TranscriptLog: commit #{} {}: {} chars",
            position,
            speaker,
            text.len()
        );
        self.entries.push(Utterance {
            speaker,
            text,
            observed_at: Utc::now(),
        });
        position
    }

    /// All committed utterances in commit order.
    pub fn snapshot(&self) -> &[Utterance] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the log as `[<time>] <Speaker>: <text>` lines, one per
    /// utterance, in commit order. Times are local wall-clock.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|u| {
                format!(
                    "[{}] {}: {}",
                    u.observed_at.with_timezone(&Local).format("%H:%M:%S"),
                    u.speaker,
                    u.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_preserves_order() {
        let mut log = TranscriptLog::new();
        log.commit(Speaker::Agent, "Hello! How can I help?");
        log.commit(Speaker::Caller, "I need a roof inspection.");
        log.commit(Speaker::Agent, "Sure, when works for you?");

        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].speaker, Speaker::Agent);
        assert_eq!(entries[1].speaker, Speaker::Caller);
        assert_eq!(entries[2].speaker, Speaker::Agent);
        assert_eq!(entries[1].text, "I need a roof inspection.");
    }

    #[test]
    fn test_commit_returns_monotonic_positions() {
        let mut log = TranscriptLog::new();
        assert_eq!(log.commit(Speaker::Agent, "one"), 0);
        assert_eq!(log.commit(Speaker::Caller, "two"), 1);
        assert_eq!(log.commit(Speaker::Agent, "three"), 2);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_empty_log() {
        let log = TranscriptLog::new();
        assert!(log.is_empty());
        assert_eq!(log.render(), "");
    }

    #[test]
    fn test_speaker_labels() {
        assert_eq!(Speaker::Caller.label(), "Caller");
        assert_eq!(Speaker::Agent.label(), "Agent");
        assert_eq!(Speaker::System.label(), "System");
        assert_eq!(format!("{}", Speaker::Agent), "Agent");
    }

    #[test]
    fn test_render_format() {
        let mut log = TranscriptLog::new();
        log.commit(Speaker::Agent, "Receptionist here.");
        log.commit(Speaker::Caller, "Hi.");

        let rendered = log.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Agent: Receptionist here."));
        assert!(lines[1].contains("Caller: Hi."));
        // each line carries a [HH:MM:SS] prefix
        for line in &lines {
            assert!(line.starts_with('['));
            assert_eq!(line.as_bytes()[9], b']');
        }
    }

    #[test]
    fn test_interleaved_commits_render_in_commit_order() {
        let mut log = TranscriptLog::new();
        // finalization order, not speaking order, decides placement
        log.commit(Speaker::Caller, "second thing said, finalized first");
        log.commit(Speaker::Agent, "first thing said, finalized second");

        let rendered = log.render();
        let caller_pos = rendered.find("Caller").unwrap();
        let agent_pos = rendered.find("Agent").unwrap();
        assert!(caller_pos < agent_pos);
    }
}
