use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Session-level error taxonomy. Every kind is recoverable: the controller
/// returns to `Idle` and can be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnsupportedCapability,
    PermissionDenied,
    NoSpeechDetected,
    DeviceUnavailable,
    NetworkError,
    Aborted,
    AnswerServiceFailure,
    Other,
}

impl ErrorKind {
    /// Map a recognition engine error code (Web Speech style) onto the taxonomy
    pub fn from_engine_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "not-allowed" | "service-not-allowed" | "permission-denied" => {
                ErrorKind::PermissionDenied
            }
            "no-speech" => ErrorKind::NoSpeechDetected,
            "audio-capture" | "no-device" => ErrorKind::DeviceUnavailable,
            "network" => ErrorKind::NetworkError,
            "aborted" => ErrorKind::Aborted,
            "unsupported" | "not-supported" => ErrorKind::UnsupportedCapability,
            _ => ErrorKind::Other,
        }
    }

    /// Short status line for the host to display
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedCapability => {
                "Voice input is not supported here. Type your question instead."
            }
            ErrorKind::PermissionDenied => "Microphone access denied. Allow it and try again.",
            ErrorKind::NoSpeechDetected => "No speech heard. Try again.",
            ErrorKind::DeviceUnavailable => "No microphone found. Check the connection.",
            ErrorKind::NetworkError => "Network error. Check the internet connection.",
            ErrorKind::Aborted => "Listening was cancelled.",
            ErrorKind::AnswerServiceFailure => "Bob could not get an answer.",
            ErrorKind::Other => "Something went wrong. Try again.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The most recent error surfaced to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Engine code or backend reason, when one exists
    pub detail: Option<String>,
}

impl SessionError {
    pub fn new(kind: ErrorKind, detail: Option<String>) -> Self {
        Self {
            kind,
            message: kind.user_message().to_string(),
            detail,
        }
    }
}

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("{0} is not available in this environment")]
    Unsupported(&'static str),

    #[error("engine error ({kind}): {message}")]
    Engine { kind: ErrorKind, message: String },

    #[error("voice session controller has shut down")]
    ControllerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] bob_core::BobError),
}

impl VoiceError {
    pub fn engine(kind: ErrorKind, message: impl Into<String>) -> Self {
        VoiceError::Engine {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::Unsupported(_) => ErrorKind::UnsupportedCapability,
            VoiceError::Engine { kind, .. } => *kind,
            VoiceError::ControllerClosed | VoiceError::Io(_) | VoiceError::Core(_) => {
                ErrorKind::Other
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
