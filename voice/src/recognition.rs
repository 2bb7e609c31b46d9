//! Speech recognition seam.
//!
//! A `RecognitionEngine` runs one recognition session at a time and reports
//! through the `RecognitionSink` it was started with. Each sink is stamped with
//! the controller's recognition generation, so anything an engine reports after
//! it was stopped is recognized as stale and discarded.

use crate::controller::EngineEvent;
use crate::error::Result;
use crate::types::Utterance;
use async_trait::async_trait;
use bob_core::{EventBus, QoSLevel};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Recognition session parameters handed to the engine on every start
#[derive(Clone, Debug)]
pub struct RecognitionConfig {
    /// Keep listening across phrases instead of ending after one
    pub continuous: bool,
    pub interim_results: bool,
    /// BCP-47 language tag
    pub language: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            continuous: std::env::var("VOICE_CONTINUOUS")
                .ok()
                .map(|s| matches!(s.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
                .unwrap_or(false),
            interim_results: std::env::var("VOICE_INTERIM_RESULTS")
                .ok()
                .map(|s| !matches!(s.as_str(), "0" | "false" | "FALSE" | "no" | "off"))
                .unwrap_or(true),
            language: std::env::var("VOICE_LANGUAGE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "en-US".to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecognitionEvent {
    Started,
    Result(Vec<Utterance>),
    /// Engine error code, e.g. `not-allowed`, `no-speech`, `network`
    Error(String),
    Ended,
}

/// Reporting handle for one recognition session
#[derive(Clone, Debug)]
pub struct RecognitionSink {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl RecognitionSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; returns `false` once the controller is gone
    pub fn send(&self, event: RecognitionEvent) -> bool {
        self.tx
            .send(EngineEvent::Recognition {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn started(&self) -> bool {
        self.send(RecognitionEvent::Started)
    }

    pub fn result(&self, utterances: Vec<Utterance>) -> bool {
        self.send(RecognitionEvent::Result(utterances))
    }

    pub fn utterance(&self, utterance: Utterance) -> bool {
        self.result(vec![utterance])
    }

    pub fn error(&self, code: impl Into<String>) -> bool {
        self.send(RecognitionEvent::Error(code.into()))
    }

    pub fn ended(&self) -> bool {
        self.send(RecognitionEvent::Ended)
    }
}

#[async_trait]
pub trait RecognitionEngine: Send {
    fn name(&self) -> &str;

    /// Begin a recognition session. Errors returned here are treated like an
    /// engine error event for the session.
    async fn start(&mut self, config: &RecognitionConfig, sink: RecognitionSink) -> Result<()>;

    /// Halt the current session, if any. Must be safe to call repeatedly.
    async fn stop(&mut self);
}

/// Recognition engine fed by transcript events on the event bus.
///
/// Consumes `transcript.partial` / `transcript.final` events (text in
/// `metadata["text"]` or the payload, confidence on the event) and
/// `transcript.error` events (code in `metadata["code"]`). Events are only
/// forwarded while a session is active.
pub struct BusRecognizer {
    bus: Arc<EventBus>,
    topic: String,
    active: Option<(String, JoinHandle<()>)>,
}

impl BusRecognizer {
    pub fn new(bus: Arc<EventBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            active: None,
        }
    }
}

#[async_trait]
impl RecognitionEngine for BusRecognizer {
    fn name(&self) -> &str {
        "bus-transcripts"
    }

    async fn start(&mut self, config: &RecognitionConfig, sink: RecognitionSink) -> Result<()> {
        self.stop().await;

        let (sub_id, mut rx) = self
            .bus
            .subscribe(
                self.topic.clone(),
                vec![
                    "transcript.final".into(),
                    "transcript.partial".into(),
                    "transcript.error".into(),
                ],
                QoSLevel::QosRealtime,
            )
            .await?;

        let generation = sink.generation();
        let continuous = config.continuous;
        let interim = config.interim_results;
        let handle = tokio::spawn(async move {
            if !sink.started() {
                return;
            }
            while let Some(ev) = rx.recv().await {
                match ev.r#type.as_str() {
                    "transcript.error" => {
                        let code = ev
                            .metadata
                            .get("code")
                            .cloned()
                            .unwrap_or_else(|| "unknown".into());
                        sink.error(code);
                        return;
                    }
                    "transcript.partial" if !interim => continue,
                    _ => {}
                }

                let text = ev.text();
                if text.trim().is_empty() {
                    continue;
                }
                let is_final = ev.r#type == "transcript.final";
                let utterance = Utterance {
                    text,
                    confidence: ev.confidence.clamp(0.0, 1.0),
                    is_final,
                };
                if !sink.utterance(utterance) {
                    return;
                }
                if is_final && !continuous {
                    break;
                }
            }
            sink.ended();
        });

        info!(target: "voice_session", topic = %self.topic, generation, "Bus recognizer listening");
        self.active = Some((sub_id, handle));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some((sub_id, handle)) = self.active.take() {
            handle.abort();
            if let Err(e) = self.bus.unsubscribe(&sub_id).await {
                warn!(target: "voice_session", error = %e, "Failed to drop transcript subscription");
            }
            debug!(target: "voice_session", "Bus recognizer stopped");
        }
    }
}
