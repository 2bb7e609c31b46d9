//! Session data model shared by the controller and the host.

use crate::error::SessionError;
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One recognized span of speech, interim or final
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    /// Engine confidence in [0, 1]
    pub confidence: f32,
    pub is_final: bool,
}

impl Utterance {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: 1.0,
            is_final: true,
        }
    }

    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: 0.0,
            is_final: false,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    /// Recognition requested, engine not yet confirmed running
    Listening,
    AwaitingWakeWord,
    AwaitingCommand,
    Dispatching,
    Speaking,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::AwaitingWakeWord => "awaiting_wake_word",
            SessionState::AwaitingCommand => "awaiting_command",
            SessionState::Dispatching => "dispatching",
            SessionState::Speaking => "speaking",
        }
    }

    /// States in which the recognition engine should be running
    pub fn is_capturing(&self) -> bool {
        matches!(
            self,
            SessionState::Listening | SessionState::AwaitingWakeWord | SessionState::AwaitingCommand
        )
    }

    /// States that hold the single in-flight dispatch slot
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Dispatching | SessionState::Speaking)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a query reached the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySource {
    Voice,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Hash of the normalized query text and the submission timestamp
    pub id: String,
    pub query: String,
    pub answer: Option<String>,
    pub submitted_at_ms: i64,
    pub source: QuerySource,
}

impl QueryRecord {
    /// Local wall-clock time of submission, `HH:MM:SS`
    pub fn display_time(&self) -> String {
        Local
            .timestamp_millis_opt(self.submitted_at_ms)
            .single()
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

/// Read-only view of the session published to the host after every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub live_transcript: String,
    pub history: Vec<QueryRecord>,
    pub last_error: Option<SessionError>,
    pub last_query_id: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            live_transcript: String::new(),
            history: Vec::new(),
            last_error: None,
            last_query_id: None,
        }
    }
}
