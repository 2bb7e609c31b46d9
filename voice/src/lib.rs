// Bob voice session: wake phrases, recognition and synthesis seams, session controller

// Shared utilities
pub mod utils;

pub mod controller;
pub mod dedup;
pub mod error;
pub mod recognition;
pub mod sanitize;
pub mod synthesis;
pub mod types;
pub mod wake;

#[cfg(feature = "tts")]
pub mod tts;

pub use controller::{
    recognized_command, ControllerBuilder, ControllerConfig, ControllerHandle, DispatchOutcome,
    VoiceSessionController, RECOGNIZED_COMMAND,
};
pub use error::{ErrorKind, Result, SessionError, VoiceError};
pub use recognition::{
    BusRecognizer, RecognitionConfig, RecognitionEngine, RecognitionEvent, RecognitionSink,
};
pub use sanitize::{sanitize_for_speech, DEFAULT_MAX_SPEECH_CHARS};
pub use synthesis::{
    LogSynthesizer, SpeechRequest, SpeechSettings, SpeechSynthesizer, SynthesisEvent,
    SynthesisSink,
};
pub use types::{QueryRecord, QuerySource, SessionSnapshot, SessionState, Utterance};
pub use utils::{Clock, ManualClock, SystemClock};
pub use wake::{BareWakePolicy, WakeMatch, WakeWordConfig, WakeWordMatcher};

#[cfg(feature = "tts")]
pub use tts::{CliSynthesizer, CliSynthesizerConfig};
