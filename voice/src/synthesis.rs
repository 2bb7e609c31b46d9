//! Speech synthesis seam.

use crate::controller::EngineEvent;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

/// Voice parameters applied to every reply
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeechSettings {
    /// 0.5–2.0, 1.0 is the engine's normal speed
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        let env_f32 = |key: &str, default: f32| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse::<f32>().ok())
                .unwrap_or(default)
        };
        Self {
            rate: env_f32("SPEECH_RATE", 0.85).clamp(0.5, 2.0),
            pitch: env_f32("SPEECH_PITCH", 1.0).clamp(0.0, 2.0),
            volume: env_f32("SPEECH_VOLUME", 1.0).clamp(0.0, 2.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub settings: SpeechSettings,
    pub language: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SynthesisEvent {
    Started,
    Ended,
    Error(String),
}

/// Reporting handle for one spoken reply
#[derive(Clone, Debug)]
pub struct SynthesisSink {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl SynthesisSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn send(&self, event: SynthesisEvent) -> bool {
        self.tx
            .send(EngineEvent::Synthesis {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn started(&self) -> bool {
        self.send(SynthesisEvent::Started)
    }

    pub fn ended(&self) -> bool {
        self.send(SynthesisEvent::Ended)
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.send(SynthesisEvent::Error(reason.into()))
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send {
    fn name(&self) -> &str;

    /// Start speaking `request`; completion is reported through `sink`.
    /// Any utterance still playing is cancelled first.
    async fn speak(&mut self, request: SpeechRequest, sink: SynthesisSink) -> Result<()>;

    /// Halt playback, if any. Must be safe to call repeatedly.
    async fn cancel(&mut self);
}

/// Prints replies instead of speaking them; completes immediately.
#[derive(Debug, Default)]
pub struct LogSynthesizer;

#[async_trait]
impl SpeechSynthesizer for LogSynthesizer {
    fn name(&self) -> &str {
        "log"
    }

    async fn speak(&mut self, request: SpeechRequest, sink: SynthesisSink) -> Result<()> {
        sink.started();
        info!(target: "tts", text = %request.text, "🗣️  (no audio) Bob says");
        sink.ended();
        Ok(())
    }

    async fn cancel(&mut self) {}
}
