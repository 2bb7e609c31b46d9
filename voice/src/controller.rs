//! Voice Session Controller
//!
//! Owns the session and drives it as an explicit state machine:
//!
//! ```text
//! Idle -> Listening -> AwaitingWakeWord -> AwaitingCommand -> Dispatching -> Speaking -> Idle
//! ```
//!
//! Everything that can change the session arrives as a message on one queue
//! and is handled in order: host commands, recognition and synthesis engine
//! callbacks, Answer Service replies and `recognized_command` events from the
//! bus. Engine callbacks carry the generation of the session that produced
//! them; callbacks from a session that was stopped or replaced are discarded.
//! The host only sees `SessionSnapshot`s through a watch channel.

use crate::dedup::{query_id, DispatchDedup};
use crate::error::{ErrorKind, Result, SessionError, VoiceError};
use crate::recognition::{RecognitionConfig, RecognitionEngine, RecognitionEvent, RecognitionSink};
use crate::sanitize::{sanitize_for_speech, DEFAULT_MAX_SPEECH_CHARS};
use crate::synthesis::{
    LogSynthesizer, SpeechRequest, SpeechSettings, SpeechSynthesizer, SynthesisEvent,
    SynthesisSink,
};
use crate::types::{QueryRecord, QuerySource, SessionSnapshot, SessionState, Utterance};
use crate::utils::{Clock, SystemClock};
use crate::wake::{BareWakePolicy, WakeWordConfig, WakeWordMatcher};
use bob_core::{AnswerError, AnswerService, Event, EventBus, QoSLevel};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Event type consumed on the command topic
pub const RECOGNIZED_COMMAND: &str = "recognized_command";

const SOURCE: &str = "voice_session";

/// Build a `recognized_command` event for `text`
pub fn recognized_command(text: impl Into<String>) -> Event {
    Event::new(RECOGNIZED_COMMAND, "host").with_metadata("text", text)
}

/// Session controller configuration
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub wake: WakeWordConfig,
    pub recognition: RecognitionConfig,
    pub speech: SpeechSettings,
    /// Re-arm recognition after a recognition session ends or a reply was spoken
    pub auto_restart: bool,
    /// Hard limit on a single Answer Service call
    pub answer_timeout: Duration,
    pub max_speech_chars: usize,
    /// Topic carrying `recognized_command` events
    pub command_topic: String,
    /// Topic the controller reports transitions and queries on
    pub session_topic: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            wake: WakeWordConfig::default(),
            recognition: RecognitionConfig::default(),
            speech: SpeechSettings::default(),
            auto_restart: std::env::var("VOICE_AUTO_RESTART")
                .ok()
                .map(|s| matches!(s.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
                .unwrap_or(false),
            answer_timeout: Duration::from_millis(
                std::env::var("ANSWER_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(30_000),
            ),
            max_speech_chars: std::env::var("SPEECH_MAX_CHARS")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_SPEECH_CHARS),
            command_topic: std::env::var("VOICE_COMMAND_TOPIC")
                .unwrap_or_else(|_| "voice.command".into()),
            session_topic: std::env::var("VOICE_SESSION_TOPIC")
                .unwrap_or_else(|_| "voice.session".into()),
        }
    }
}

/// Result of a dispatch request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent to the Answer Service under this query id
    Dispatched { id: String },
    /// Same id was dispatched before; dropped
    Duplicate { id: String },
    /// Another query is still being answered or spoken
    Busy,
    /// Nothing but whitespace
    Empty,
}

/// Messages produced by engines and background tasks
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Recognition {
        generation: u64,
        event: RecognitionEvent,
    },
    Synthesis {
        generation: u64,
        event: SynthesisEvent,
    },
    Answer {
        generation: u64,
        record_id: String,
        result: std::result::Result<String, AnswerError>,
    },
}

enum HostCommand {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
    Dispatch {
        text: String,
        source: QuerySource,
        timestamp_ms: Option<i64>,
        reply: oneshot::Sender<DispatchOutcome>,
    },
    Shutdown,
}

/// Host-side handle: the only way to drive a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<HostCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl ControllerHandle {
    /// Start listening. Fails with `Unsupported` when no recognition engine is installed.
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Start(reply)).await?;
        rx.await.map_err(|_| VoiceError::ControllerClosed)?
    }

    /// Halt recognition and synthesis and return to `Idle`. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Stop(reply)).await?;
        rx.await.map_err(|_| VoiceError::ControllerClosed)
    }

    /// Send typed text straight to the Answer Service, bypassing the wake phrase
    pub async fn dispatch(&self, text: impl Into<String>) -> Result<DispatchOutcome> {
        self.dispatch_with(text.into(), QuerySource::Text, None).await
    }

    /// Like `dispatch`, with the submission time pinned by the caller
    pub async fn dispatch_at(
        &self,
        text: impl Into<String>,
        timestamp_ms: i64,
    ) -> Result<DispatchOutcome> {
        self.dispatch_with(text.into(), QuerySource::Text, Some(timestamp_ms))
            .await
    }

    async fn dispatch_with(
        &self,
        text: String,
        source: QuerySource,
        timestamp_ms: Option<i64>,
    ) -> Result<DispatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Dispatch {
            text,
            source,
            timestamp_ms,
            reply,
        })
        .await?;
        rx.await.map_err(|_| VoiceError::ControllerClosed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Watch every snapshot the controller publishes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a published snapshot satisfies `pred`
    pub async fn wait_until<F>(&self, mut pred: F) -> Result<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snap = rx
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| VoiceError::ControllerClosed)?;
        Ok((*snap).clone())
    }

    /// Stop the engines and end the run loop
    pub async fn shutdown(&self) -> Result<()> {
        self.send(HostCommand::Shutdown).await
    }

    async fn send(&self, cmd: HostCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| VoiceError::ControllerClosed)
    }
}

pub struct ControllerBuilder {
    answers: Arc<dyn AnswerService>,
    recognizer: Option<Box<dyn RecognitionEngine>>,
    synthesizer: Box<dyn SpeechSynthesizer>,
    bus: Option<Arc<EventBus>>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
}

impl ControllerBuilder {
    /// Without a recognizer the controller is text-only and `start()` reports
    /// `UnsupportedCapability`.
    pub fn recognizer(mut self, engine: Box<dyn RecognitionEngine>) -> Self {
        self.recognizer = Some(engine);
        self
    }

    pub fn synthesizer(mut self, engine: Box<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = engine;
        self
    }

    /// Consume `recognized_command` events and publish session events on this bus
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the run loop on the current runtime
    pub async fn spawn(self) -> Result<(ControllerHandle, JoinHandle<()>)> {
        let matcher = WakeWordMatcher::new(self.config.wake.clone())?;

        let commands = match &self.bus {
            Some(bus) => Some(
                bus.subscribe(
                    self.config.command_topic.clone(),
                    vec![RECOGNIZED_COMMAND.into()],
                    QoSLevel::QosBatched,
                )
                .await?,
            ),
            None => None,
        };

        let (host_tx, host_rx) = mpsc::channel(32);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let controller = VoiceSessionController {
            matcher,
            answers: self.answers,
            recognizer: self.recognizer,
            synthesizer: self.synthesizer,
            bus: self.bus,
            clock: self.clock,
            cfg: self.config,
            engine_tx,
            snapshot_tx,
            state: SessionState::Idle,
            armed: false,
            command_rearmed: false,
            recognizing: false,
            live_transcript: String::new(),
            history: Vec::new(),
            last_error: None,
            last_query_id: None,
            dedup: DispatchDedup::default(),
            recognition_gen: 0,
            synthesis_gen: 0,
            dispatch_gen: 0,
            in_flight: None,
        };

        let handle = tokio::spawn(controller.run(host_rx, engine_rx, commands));
        Ok((
            ControllerHandle {
                tx: host_tx,
                snapshot: snapshot_rx,
            },
            handle,
        ))
    }
}

pub struct VoiceSessionController {
    cfg: ControllerConfig,
    matcher: WakeWordMatcher,
    answers: Arc<dyn AnswerService>,
    recognizer: Option<Box<dyn RecognitionEngine>>,
    synthesizer: Box<dyn SpeechSynthesizer>,
    bus: Option<Arc<EventBus>>,
    clock: Arc<dyn Clock>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,

    state: SessionState,
    // Bare wake phrase heard; the next final utterance is the command
    armed: bool,
    // Recognition was restarted once to catch the command after `armed`
    command_rearmed: bool,
    recognizing: bool,
    live_transcript: String,
    history: Vec<QueryRecord>,
    last_error: Option<SessionError>,
    last_query_id: Option<String>,
    dedup: DispatchDedup,

    recognition_gen: u64,
    synthesis_gen: u64,
    dispatch_gen: u64,
    in_flight: Option<JoinHandle<()>>,
}

impl VoiceSessionController {
    pub fn builder(answers: Arc<dyn AnswerService>) -> ControllerBuilder {
        ControllerBuilder {
            answers,
            recognizer: None,
            synthesizer: Box::new(LogSynthesizer),
            bus: None,
            clock: Arc::new(SystemClock),
            config: ControllerConfig::default(),
        }
    }

    async fn run(
        mut self,
        mut host_rx: mpsc::Receiver<HostCommand>,
        mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
        commands: Option<(String, mpsc::Receiver<Event>)>,
    ) {
        let (command_sub, mut command_rx) = match commands {
            Some((id, rx)) => (Some(id), Some(rx)),
            None => (None, None),
        };
        info!(
            target: "voice_session",
            recognizer = %self.recognizer.as_ref().map(|r| r.name().to_string()).unwrap_or_else(|| "none".into()),
            synthesizer = self.synthesizer.name(),
            auto_restart = self.cfg.auto_restart,
            "🎙️ Voice session controller running"
        );

        loop {
            tokio::select! {
                cmd = host_rx.recv() => match cmd {
                    Some(HostCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_host(cmd).await,
                },
                Some(ev) = engine_rx.recv() => self.handle_engine(ev).await,
                ev = next_command(&mut command_rx) => self.handle_recognized_command(ev).await,
            }
            self.publish_snapshot();
        }

        self.halt().await;
        self.publish_snapshot();
        if let (Some(bus), Some(id)) = (&self.bus, command_sub) {
            if let Err(e) = bus.unsubscribe(&id).await {
                warn!(target: "voice_session", error = %e, "Failed to drop command subscription");
            }
        }
        info!(target: "voice_session", "Voice session controller stopped");
    }

    async fn handle_host(&mut self, cmd: HostCommand) {
        match cmd {
            // The snapshot must be current by the time the host sees the reply
            HostCommand::Start(reply) => {
                let res = self.start().await;
                self.publish_snapshot();
                let _ = reply.send(res);
            }
            HostCommand::Stop(reply) => {
                self.stop().await;
                self.publish_snapshot();
                let _ = reply.send(());
            }
            HostCommand::Dispatch {
                text,
                source,
                timestamp_ms,
                reply,
            } => {
                let outcome = self.dispatch(&text, source, timestamp_ms).await;
                self.publish_snapshot();
                let _ = reply.send(outcome);
            }
            HostCommand::Shutdown => {}
        }
    }

    async fn handle_engine(&mut self, ev: EngineEvent) {
        match ev {
            EngineEvent::Recognition { generation, event } => {
                if generation != self.recognition_gen || !self.recognizing {
                    debug!(target: "voice_session", generation, current = self.recognition_gen, ?event, "Dropping stale recognition callback");
                    return;
                }
                self.on_recognition(event).await;
            }
            EngineEvent::Synthesis { generation, event } => {
                if generation != self.synthesis_gen || self.state != SessionState::Speaking {
                    debug!(target: "voice_session", generation, current = self.synthesis_gen, ?event, "Dropping stale synthesis callback");
                    return;
                }
                self.on_synthesis(event).await;
            }
            EngineEvent::Answer {
                generation,
                record_id,
                result,
            } => {
                if generation != self.dispatch_gen || self.state != SessionState::Dispatching {
                    debug!(target: "voice_session", generation, %record_id, "Dropping stale answer");
                    return;
                }
                self.in_flight = None;
                self.on_answer(&record_id, result).await;
            }
        }
    }

    async fn handle_recognized_command(&mut self, ev: Event) {
        let text = ev.text();
        let timestamp_ms = ev
            .metadata
            .get("timestamp_ms")
            .and_then(|s| s.parse::<i64>().ok());
        let source = match ev.metadata.get("source").map(String::as_str) {
            Some("voice") => QuerySource::Voice,
            _ => QuerySource::Text,
        };
        debug!(target: "voice_session", event_id = %ev.id, "recognized_command received");
        self.dispatch(&text, source, timestamp_ms).await;
    }

    // ---- host operations ----

    async fn start(&mut self) -> Result<()> {
        if self.recognizer.is_none() {
            warn!(target: "voice_session", "No recognition engine; voice input unavailable");
            self.record_error(ErrorKind::UnsupportedCapability, None)
                .await;
            return Err(VoiceError::Unsupported("speech recognition"));
        }
        if self.state.is_busy() {
            info!(target: "voice_session", state = %self.state, "Start ignored while a query is in flight");
            return Ok(());
        }
        if self.state.is_capturing() {
            debug!(target: "voice_session", state = %self.state, "Already listening");
            return Ok(());
        }
        self.last_error = None;
        self.armed = false;
        self.begin_recognition().await;
        Ok(())
    }

    async fn stop(&mut self) {
        self.halt().await;
        self.armed = false;
        self.live_transcript.clear();
        self.transition(SessionState::Idle).await;
        info!(target: "voice_session", "⏹️ Session stopped");
    }

    /// Cancel everything in flight and halt both engines
    async fn halt(&mut self) {
        self.recognition_gen += 1;
        self.synthesis_gen += 1;
        self.dispatch_gen += 1;
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        if let Some(recognizer) = self.recognizer.as_mut() {
            recognizer.stop().await;
        }
        self.recognizing = false;
        self.synthesizer.cancel().await;
    }

    // ---- recognition ----

    async fn begin_recognition(&mut self) {
        if self.recognizer.is_none() {
            return;
        }
        self.recognition_gen += 1;
        let sink = RecognitionSink::new(self.recognition_gen, self.engine_tx.clone());
        self.recognizing = true;
        self.transition(SessionState::Listening).await;

        let Some(recognizer) = self.recognizer.as_mut() else {
            return;
        };
        if let Err(e) = recognizer.start(&self.cfg.recognition, sink).await {
            warn!(target: "voice_session", error = %e, "Recognition engine failed to start");
            self.fail_recognition(e.kind(), Some(e.to_string())).await;
        }
    }

    async fn end_recognition(&mut self) {
        self.recognition_gen += 1;
        if self.recognizing {
            if let Some(recognizer) = self.recognizer.as_mut() {
                recognizer.stop().await;
            }
            self.recognizing = false;
        }
    }

    fn capture_state(&self) -> SessionState {
        if self.armed || !self.matcher.config().required {
            SessionState::AwaitingCommand
        } else {
            SessionState::AwaitingWakeWord
        }
    }

    async fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Started => {
                if self.state == SessionState::Listening {
                    let next = self.capture_state();
                    self.transition(next).await;
                }
            }
            RecognitionEvent::Result(utterances) => {
                for utterance in utterances {
                    if !self.state.is_capturing() {
                        break;
                    }
                    self.on_utterance(utterance).await;
                }
            }
            RecognitionEvent::Error(code) => {
                let kind = ErrorKind::from_engine_code(&code);
                warn!(target: "voice_session", %code, %kind, "Recognition error");
                self.fail_recognition(kind, Some(code)).await;
            }
            RecognitionEvent::Ended => {
                // An ended session still holds engine resources until stopped
                self.end_recognition().await;
                if !self.state.is_capturing() {
                    return;
                }
                if self.armed && !self.cfg.auto_restart {
                    self.on_armed_session_ended().await;
                } else if self.cfg.auto_restart {
                    debug!(target: "voice_session", "Recognition ended; re-arming");
                    self.begin_recognition().await;
                } else {
                    self.armed = false;
                    self.transition(SessionState::Idle).await;
                }
            }
        }
    }

    /// A one-shot session ended after a bare wake phrase. Listen once more for
    /// the command; if that session also ends empty, send the greeting.
    async fn on_armed_session_ended(&mut self) {
        if !self.command_rearmed {
            debug!(target: "voice_session", "Session ended after bare wake phrase; listening for the command");
            self.command_rearmed = true;
            self.begin_recognition().await;
            return;
        }
        info!(target: "wake", "No command after wake phrase; greeting");
        let greeting = self.matcher.config().default_greeting.clone();
        if let DispatchOutcome::Duplicate { .. } | DispatchOutcome::Empty =
            self.dispatch(&greeting, QuerySource::Voice, None).await
        {
            self.armed = false;
            self.transition(SessionState::Idle).await;
        }
    }

    async fn on_utterance(&mut self, utterance: Utterance) {
        self.live_transcript = utterance.text.clone();
        if !utterance.is_final {
            return;
        }
        let text = utterance.text.trim().to_string();
        if text.is_empty() {
            return;
        }
        debug!(target: "voice_session", state = %self.state, %text, confidence = utterance.confidence, "Final utterance");

        match self.state {
            SessionState::AwaitingCommand => {
                self.dispatch(&text, QuerySource::Voice, None).await;
            }
            SessionState::Listening if self.armed => {
                self.dispatch(&text, QuerySource::Voice, None).await;
            }
            SessionState::Listening | SessionState::AwaitingWakeWord => {
                if !self.matcher.config().required {
                    self.dispatch(&text, QuerySource::Voice, None).await;
                    return;
                }
                let Some(wake) = self.matcher.find(&text) else {
                    debug!(target: "wake", %text, "No wake phrase; still waiting");
                    return;
                };
                info!(target: "wake", phrase = %wake.phrase, "🔔 Wake phrase detected");
                let policy = self.matcher.config().bare_wake;
                match (wake.command, policy) {
                    (Some(command), _) => {
                        self.dispatch(&command, QuerySource::Voice, None).await;
                    }
                    (None, BareWakePolicy::Greet) => {
                        let greeting = self.matcher.config().default_greeting.clone();
                        self.dispatch(&greeting, QuerySource::Voice, None).await;
                    }
                    (None, BareWakePolicy::AwaitCommand) => {
                        self.armed = true;
                        self.command_rearmed = false;
                        self.transition(SessionState::AwaitingCommand).await;
                    }
                }
            }
            SessionState::Idle | SessionState::Dispatching | SessionState::Speaking => {
                debug!(target: "voice_session", state = %self.state, "Utterance ignored");
            }
        }
    }

    async fn fail_recognition(&mut self, kind: ErrorKind, detail: Option<String>) {
        self.end_recognition().await;
        self.armed = false;
        self.transition(SessionState::Idle).await;
        self.record_error(kind, detail).await;
    }

    // ---- dispatch ----

    async fn dispatch(
        &mut self,
        text: &str,
        source: QuerySource,
        timestamp_ms: Option<i64>,
    ) -> DispatchOutcome {
        let command = text.trim();
        if command.is_empty() {
            return DispatchOutcome::Empty;
        }
        if self.state.is_busy() {
            info!(target: "voice_session", state = %self.state, %command, "Dispatch ignored; one query already in flight");
            return DispatchOutcome::Busy;
        }

        let submitted_at_ms = timestamp_ms.unwrap_or_else(|| self.clock.now_ms());
        let id = query_id(command, submitted_at_ms);
        if !self.dedup.insert(&id) {
            info!(target: "voice_session", %id, %command, "Duplicate dispatch dropped");
            self.emit(
                Event::new("query.duplicate", SOURCE)
                    .with_metadata("query_id", id.clone())
                    .with_metadata("text", command),
            )
            .await;
            return DispatchOutcome::Duplicate { id };
        }

        self.end_recognition().await;
        self.armed = false;
        self.last_error = None;
        self.last_query_id = Some(id.clone());
        self.history.push(QueryRecord {
            id: id.clone(),
            query: command.to_string(),
            answer: None,
            submitted_at_ms,
            source,
        });
        self.transition(SessionState::Dispatching).await;
        info!(target: "voice_session", %id, %command, ?source, "📨 Dispatching query");
        self.emit(
            Event::new("query.dispatched", SOURCE)
                .with_metadata("query_id", id.clone())
                .with_metadata("text", command),
        )
        .await;

        self.dispatch_gen += 1;
        let generation = self.dispatch_gen;
        let answers = Arc::clone(&self.answers);
        let tx = self.engine_tx.clone();
        let timeout = self.cfg.answer_timeout;
        let query = command.to_string();
        let record_id = id.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, answers.answer(&query)).await {
                Ok(result) => result,
                Err(_) => Err(AnswerError::Timeout(timeout.as_millis() as u64)),
            };
            let _ = tx.send(EngineEvent::Answer {
                generation,
                record_id,
                result,
            });
        }));

        DispatchOutcome::Dispatched { id }
    }

    async fn on_answer(&mut self, record_id: &str, result: std::result::Result<String, AnswerError>) {
        let reply = match result {
            Ok(answer) => {
                info!(target: "voice_session", id = %record_id, "💬 Answer received");
                answer
            }
            Err(e) => {
                warn!(target: "voice_session", id = %record_id, error = %e, "Answer Service failed");
                self.record_error(ErrorKind::AnswerServiceFailure, Some(e.to_string()))
                    .await;
                e.apology()
            }
        };

        if let Some(record) = self.history.iter_mut().find(|r| r.id == record_id) {
            record.answer = Some(reply.clone());
        }
        self.emit(
            Event::new("query.answered", SOURCE)
                .with_metadata("query_id", record_id)
                .with_metadata("text", reply.clone()),
        )
        .await;

        self.speak(&reply).await;
    }

    // ---- synthesis ----

    async fn speak(&mut self, reply: &str) {
        self.transition(SessionState::Speaking).await;
        let text = sanitize_for_speech(reply, self.cfg.max_speech_chars);
        if text.is_empty() {
            self.finish_speaking().await;
            return;
        }

        self.synthesis_gen += 1;
        let sink = SynthesisSink::new(self.synthesis_gen, self.engine_tx.clone());
        let request = SpeechRequest {
            text,
            settings: self.cfg.speech,
            language: self.cfg.recognition.language.clone(),
        };
        if let Err(e) = self.synthesizer.speak(request, sink).await {
            warn!(target: "voice_session", error = %e, "Speech synthesis failed to start");
            self.synthesis_gen += 1;
            self.transition(SessionState::Idle).await;
            self.record_error(e.kind(), Some(e.to_string())).await;
        }
    }

    async fn on_synthesis(&mut self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::Started => {
                debug!(target: "voice_session", "Speaking");
            }
            SynthesisEvent::Ended => self.finish_speaking().await,
            SynthesisEvent::Error(reason) => {
                warn!(target: "voice_session", %reason, "Speech synthesis error");
                self.synthesis_gen += 1;
                self.transition(SessionState::Idle).await;
                self.record_error(ErrorKind::Other, Some(reason)).await;
            }
        }
    }

    async fn finish_speaking(&mut self) {
        self.synthesis_gen += 1;
        self.transition(SessionState::Idle).await;
        if self.cfg.auto_restart && self.recognizer.is_some() {
            self.begin_recognition().await;
        }
    }

    // ---- bookkeeping ----

    async fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        info!(target: "voice_session", %from, %to, "State transition");
        self.emit(
            Event::new("session.transition", SOURCE)
                .with_metadata("from", from.as_str())
                .with_metadata("to", to.as_str()),
        )
        .await;
    }

    async fn record_error(&mut self, kind: ErrorKind, detail: Option<String>) {
        let error = SessionError::new(kind, detail);
        let mut event = Event::new("session.error", SOURCE)
            .with_metadata("kind", kind.to_string())
            .with_metadata("message", error.message.clone());
        if let Some(detail) = &error.detail {
            event = event.with_metadata("detail", detail.clone());
        }
        self.last_error = Some(error);
        self.emit(event).await;
    }

    fn emit(&self, event: Event) -> impl Future<Output = ()> + Send + 'static {
        let target = self
            .bus
            .clone()
            .map(|bus| (bus, self.cfg.session_topic.clone()));
        async move {
            let Some((bus, topic)) = target else {
                return;
            };
            if let Err(e) = bus.publish(&topic, event).await {
                warn!(target: "voice_session", error = %e, "Failed to publish session event");
            }
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            state: self.state,
            live_transcript: self.live_transcript.clone(),
            history: self.history.clone(),
            last_error: self.last_error.clone(),
            last_query_id: self.last_query_id.clone(),
        });
    }
}

/// Next `recognized_command`; pends forever once the subscription is gone
async fn next_command(rx: &mut Option<mpsc::Receiver<Event>>) -> Event {
    if let Some(inner) = rx.as_mut() {
        if let Some(ev) = inner.recv().await {
            return ev;
        }
        warn!(target: "voice_session", "Command subscription closed");
        *rx = None;
    }
    std::future::pending().await
}
