use async_trait::async_trait;
use bob_core::{AnswerError, AnswerService, Event, EventBus, QoSLevel};
use bob_voice::{
    recognized_command, BareWakePolicy, ControllerConfig, ControllerHandle, DispatchOutcome,
    ErrorKind, ManualClock, QuerySource, RecognitionConfig, RecognitionEngine, RecognitionSink,
    SessionSnapshot, SessionState, SpeechRequest, SpeechSettings, SpeechSynthesizer,
    SynthesisSink, Utterance, VoiceSessionController, WakeWordConfig,
};
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(2);

mock! {
    pub Answers {}

    #[async_trait]
    impl AnswerService for Answers {
        async fn answer(&self, query: &str) -> Result<String, AnswerError>;
    }
}

/// Answer Service that never replies until released
#[derive(Default)]
struct StalledAnswers {
    calls: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl AnswerService for StalledAnswers {
    async fn answer(&self, _query: &str) -> Result<String, AnswerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok("late answer".into())
    }
}

/// Recognition engine driven by the test through the captured sink
#[derive(Clone, Default)]
struct ScriptedRecognizer {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    sink: Arc<Mutex<Option<RecognitionSink>>>,
    // Stay in `Listening` by never confirming the start
    silent_start: bool,
}

impl ScriptedRecognizer {
    fn sink(&self) -> RecognitionSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("recognition was started")
    }

    fn say(&self, text: &str) {
        assert!(self.sink().utterance(Utterance::final_text(text)));
    }
}

#[async_trait]
impl RecognitionEngine for ScriptedRecognizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(
        &mut self,
        _config: &RecognitionConfig,
        sink: RecognitionSink,
    ) -> bob_voice::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.silent_start {
            sink.started();
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Synthesizer that records what it was asked to say
#[derive(Clone)]
struct ScriptedSynthesizer {
    spoken: Arc<Mutex<Vec<String>>>,
    cancels: Arc<AtomicUsize>,
    // When false the utterance never ends on its own
    finish: bool,
}

impl ScriptedSynthesizer {
    fn new(finish: bool) -> Self {
        Self {
            spoken: Arc::default(),
            cancels: Arc::default(),
            finish,
        }
    }

    fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn speak(&mut self, request: SpeechRequest, sink: SynthesisSink) -> bob_voice::Result<()> {
        self.spoken.lock().unwrap().push(request.text);
        sink.started();
        if self.finish {
            sink.ended();
        }
        Ok(())
    }

    async fn cancel(&mut self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        wake: WakeWordConfig {
            phrases: vec![
                "hey bob".into(),
                "hi bob".into(),
                "hello bob".into(),
                "ok bob".into(),
            ],
            required: true,
            default_greeting: "Hello".into(),
            bare_wake: BareWakePolicy::AwaitCommand,
            max_distance: 0,
        },
        recognition: RecognitionConfig {
            continuous: false,
            interim_results: true,
            language: "en-US".into(),
        },
        speech: SpeechSettings {
            rate: 0.85,
            pitch: 1.0,
            volume: 1.0,
        },
        auto_restart: false,
        answer_timeout: Duration::from_secs(5),
        max_speech_chars: 300,
        command_topic: "voice.command".into(),
        session_topic: "voice.session".into(),
    }
}

struct Harness {
    handle: ControllerHandle,
    task: JoinHandle<()>,
    recognizer: ScriptedRecognizer,
    synthesizer: ScriptedSynthesizer,
}

impl Harness {
    async fn wait_for(&self, what: &str, pred: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        tokio::time::timeout(WAIT, self.handle.wait_until(pred))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}: {:?}", self.handle.snapshot()))
            .expect("controller alive")
    }

    async fn wait_state(&self, state: SessionState) -> SessionSnapshot {
        self.wait_for(state.as_str(), |s| s.state == state).await
    }

    async fn shutdown(self) {
        self.handle.shutdown().await.expect("shutdown");
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("controller exits")
            .expect("no panic");
    }
}

async fn spawn_with(
    answers: Arc<dyn AnswerService>,
    config: ControllerConfig,
    recognizer: ScriptedRecognizer,
    synthesizer: ScriptedSynthesizer,
    bus: Option<Arc<EventBus>>,
) -> Harness {
    let mut builder = VoiceSessionController::builder(answers)
        .config(config)
        .recognizer(Box::new(recognizer.clone()))
        .synthesizer(Box::new(synthesizer.clone()))
        .clock(Arc::new(ManualClock::new(1_700_000_000_000)));
    if let Some(bus) = bus {
        builder = builder.bus(bus);
    }
    let (handle, task) = builder.spawn().await.expect("spawn controller");
    Harness {
        handle,
        task,
        recognizer,
        synthesizer,
    }
}

async fn spawn(answers: Arc<dyn AnswerService>) -> Harness {
    spawn_with(
        answers,
        test_config(),
        ScriptedRecognizer::default(),
        ScriptedSynthesizer::new(true),
        None,
    )
    .await
}

fn scripted_answer(expected: &'static str, reply: &'static str, times: usize) -> MockAnswers {
    let mut answers = MockAnswers::new();
    answers
        .expect_answer()
        .withf(move |q| q.to_string() == expected)
        .times(times)
        .returning(move |_| Ok(reply.to_string()));
    answers
}

#[tokio::test]
async fn spoken_question_is_answered_and_recorded() {
    let bus = Arc::new(EventBus::new().await.unwrap());
    let (_sub, mut session_events) = bus
        .subscribe(
            "voice.session".into(),
            vec!["session.transition".into()],
            QoSLevel::QosBatched,
        )
        .await
        .unwrap();

    let h = spawn_with(
        Arc::new(scripted_answer("What is 2 plus 2?", "2 + 2 is 4.", 1)),
        test_config(),
        ScriptedRecognizer::default(),
        ScriptedSynthesizer::new(true),
        Some(Arc::clone(&bus)),
    )
    .await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.say("Hey Bob What is 2 plus 2?");

    let snap = h
        .wait_for("answered and idle", |s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        })
        .await;
    assert_eq!(snap.history.len(), 1);
    let record = &snap.history[0];
    assert_eq!(record.query, "What is 2 plus 2?");
    assert_eq!(record.answer.as_deref(), Some("2 + 2 is 4."));
    assert_eq!(record.source, QuerySource::Voice);
    assert_eq!(snap.last_query_id.as_deref(), Some(record.id.as_str()));
    assert!(snap.last_error.is_none());
    assert_eq!(h.synthesizer.spoken(), vec!["2 + 2 is 4.".to_string()]);

    let mut transitions = Vec::new();
    while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(200), session_events.recv()).await {
        transitions.push(format!("{}->{}", ev.metadata["from"], ev.metadata["to"]));
    }
    assert_eq!(
        transitions,
        vec![
            "idle->listening",
            "listening->awaiting_wake_word",
            "awaiting_wake_word->dispatching",
            "dispatching->speaking",
            "speaking->idle",
        ]
    );
    // Recognition is released while the query is answered
    assert!(h.recognizer.stops.load(Ordering::SeqCst) >= 1);
    h.shutdown().await;
}

#[tokio::test]
async fn same_derived_id_reaches_the_answer_service_once() {
    let h = spawn(Arc::new(scripted_answer("what time is it", "It is noon.", 1))).await;

    let first = h.handle.dispatch_at("what time is it", 42).await.unwrap();
    let DispatchOutcome::Dispatched { id } = first else {
        panic!("expected dispatch, got {first:?}");
    };
    h.wait_for("first answer", |s| {
        s.state == SessionState::Idle && s.history.first().and_then(|r| r.answer.as_ref()).is_some()
    })
    .await;

    let second = h.handle.dispatch_at("what time is it", 42).await.unwrap();
    assert_eq!(second, DispatchOutcome::Duplicate { id: id.clone() });

    let snap = h.handle.snapshot();
    assert_eq!(snap.history.len(), 1);
    assert_eq!(snap.state, SessionState::Idle);
    assert!(snap.last_error.is_none(), "duplicates are silent");
    h.shutdown().await;
}

#[tokio::test]
async fn same_text_at_a_later_time_is_a_new_query() {
    let h = spawn(Arc::new(scripted_answer("tell me a joke", "Knock knock.", 2))).await;

    assert!(matches!(
        h.handle.dispatch_at("tell me a joke", 1_000).await.unwrap(),
        DispatchOutcome::Dispatched { .. }
    ));
    h.wait_for("first answer", |s| {
        s.state == SessionState::Idle && s.history.iter().all(|r| r.answer.is_some())
    })
    .await;
    assert!(matches!(
        h.handle.dispatch_at("tell me a joke", 2_000).await.unwrap(),
        DispatchOutcome::Dispatched { .. }
    ));
    let snap = h
        .wait_for("second answer", |s| {
            s.history.len() == 2 && s.history.iter().all(|r| r.answer.is_some())
        })
        .await;
    assert_ne!(snap.history[0].id, snap.history[1].id);
    h.shutdown().await;
}

#[tokio::test]
async fn bare_wake_phrase_arms_for_the_next_utterance() {
    let h = spawn(Arc::new(scripted_answer("turn on the lights", "Done.", 1))).await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.say("hey bob");
    h.wait_state(SessionState::AwaitingCommand).await;
    assert!(h.handle.snapshot().history.is_empty());

    h.recognizer.say("  turn on the lights ");
    let snap = h
        .wait_for("answered", |s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        })
        .await;
    assert_eq!(snap.history[0].query, "turn on the lights");
    h.shutdown().await;
}

#[tokio::test]
async fn bare_wake_phrase_can_greet_immediately() {
    let mut config = test_config();
    config.wake.bare_wake = BareWakePolicy::Greet;
    let h = spawn_with(
        Arc::new(scripted_answer("Hello", "Hi there!", 1)),
        config,
        ScriptedRecognizer::default(),
        ScriptedSynthesizer::new(true),
        None,
    )
    .await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.say("OK Bob");
    let snap = h
        .wait_for("greeting answered", |s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        })
        .await;
    assert_eq!(snap.history[0].query, "Hello");
    h.shutdown().await;
}

#[tokio::test]
async fn utterance_without_wake_phrase_is_ignored() {
    let mut answers = MockAnswers::new();
    answers.expect_answer().never();
    let h = spawn(Arc::new(answers)).await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.say("what is the weather");

    let snap = h
        .wait_for("transcript", |s| s.live_transcript == "what is the weather")
        .await;
    assert_eq!(snap.state, SessionState::AwaitingWakeWord);
    assert!(snap.history.is_empty());
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn one_shot_session_ending_after_bare_wake_listens_for_the_command() {
    let h = spawn(Arc::new(scripted_answer("what time is it", "It is noon.", 1))).await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.say("hey bob");
    h.recognizer.sink().ended();

    let starts = Arc::clone(&h.recognizer.starts);
    h.wait_for("listening for the command", move |s| {
        s.state == SessionState::AwaitingCommand && starts.load(Ordering::SeqCst) == 2
    })
    .await;
    assert!(h.recognizer.stops.load(Ordering::SeqCst) >= 1);

    h.recognizer.say("what time is it");
    let snap = h
        .wait_for("answered", |s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        })
        .await;
    assert_eq!(snap.history.len(), 1);
    assert_eq!(snap.history[0].query, "what time is it");
    h.shutdown().await;
}

#[tokio::test]
async fn bare_wake_with_no_command_falls_back_to_the_greeting() {
    let h = spawn(Arc::new(scripted_answer("Hello", "Hi, I'm Bob.", 1))).await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.say("hello bob");
    h.recognizer.sink().ended();

    let starts = Arc::clone(&h.recognizer.starts);
    h.wait_for("listening for the command", move |s| {
        s.state == SessionState::AwaitingCommand && starts.load(Ordering::SeqCst) == 2
    })
    .await;
    // Second session hears nothing
    h.recognizer.sink().ended();

    let snap = h
        .wait_for("greeting answered", |s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        })
        .await;
    assert_eq!(snap.history.len(), 1);
    assert_eq!(snap.history[0].query, "Hello");
    assert_eq!(snap.history[0].answer.as_deref(), Some("Hi, I'm Bob."));
    assert_eq!(h.synthesizer.spoken(), vec!["Hi, I'm Bob.".to_string()]);
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 2);
    h.shutdown().await;
}

#[tokio::test]
async fn interim_results_only_update_the_live_transcript() {
    let mut answers = MockAnswers::new();
    answers.expect_answer().never();
    let h = spawn(Arc::new(answers)).await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    assert!(h.recognizer.sink().utterance(Utterance::interim("hey bob what")));

    let snap = h.wait_for("interim", |s| s.live_transcript == "hey bob what").await;
    assert_eq!(snap.state, SessionState::AwaitingWakeWord);
    assert!(snap.history.is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn non_match_followed_by_end_rearms_when_auto_restart() {
    let mut answers = MockAnswers::new();
    answers.expect_answer().never();
    let mut config = test_config();
    config.auto_restart = true;
    let h = spawn_with(
        Arc::new(answers),
        config,
        ScriptedRecognizer::default(),
        ScriptedSynthesizer::new(true),
        None,
    )
    .await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.say("nothing to see here");
    h.recognizer.sink().ended();

    let starts = Arc::clone(&h.recognizer.starts);
    h.wait_for("restart", move |s| {
        s.state == SessionState::AwaitingWakeWord && starts.load(Ordering::SeqCst) == 2
    })
    .await;
    h.shutdown().await;
}

#[tokio::test]
async fn recognition_end_without_auto_restart_goes_idle() {
    let h = spawn(Arc::new(MockAnswers::new())).await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.sink().ended();
    h.wait_state(SessionState::Idle).await;
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn permission_denied_while_listening_returns_to_idle() {
    let recognizer = ScriptedRecognizer {
        silent_start: true,
        ..ScriptedRecognizer::default()
    };
    let h = spawn_with(
        Arc::new(MockAnswers::new()),
        test_config(),
        recognizer,
        ScriptedSynthesizer::new(true),
        None,
    )
    .await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::Listening).await;
    assert!(h.recognizer.sink().error("not-allowed"));

    let snap = h
        .wait_for("error", |s| s.state == SessionState::Idle && s.last_error.is_some())
        .await;
    let err = snap.last_error.expect("error surfaced");
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
    assert_eq!(err.detail.as_deref(), Some("not-allowed"));
    assert!(!err.message.is_empty());
    assert!(snap.history.is_empty());

    // Still restartable
    h.handle.start().await.unwrap();
    let snap = h.wait_state(SessionState::Listening).await;
    assert!(snap.last_error.is_none());
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 2);
    h.shutdown().await;
}

#[tokio::test]
async fn engine_codes_surface_as_error_kinds() {
    for (code, kind) in [
        ("no-speech", ErrorKind::NoSpeechDetected),
        ("audio-capture", ErrorKind::DeviceUnavailable),
        ("network", ErrorKind::NetworkError),
        ("something-odd", ErrorKind::Other),
    ] {
        let h = spawn(Arc::new(MockAnswers::new())).await;
        h.handle.start().await.unwrap();
        h.wait_state(SessionState::AwaitingWakeWord).await;
        h.recognizer.sink().error(code);
        let snap = h
            .wait_for(code, |s| s.state == SessionState::Idle && s.last_error.is_some())
            .await;
        assert_eq!(snap.last_error.map(|e| e.kind), Some(kind), "code {code}");
        h.shutdown().await;
    }
}

#[tokio::test]
async fn stop_from_any_state_halts_engines_and_is_idempotent() {
    // Idle
    let h = spawn(Arc::new(MockAnswers::new())).await;
    h.handle.stop().await.unwrap();
    h.handle.stop().await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Idle);
    h.shutdown().await;

    // Listening / AwaitingWakeWord / AwaitingCommand
    for armed in [false, true] {
        let h = spawn(Arc::new(MockAnswers::new())).await;
        h.handle.start().await.unwrap();
        h.wait_state(SessionState::AwaitingWakeWord).await;
        if armed {
            h.recognizer.say("hi bob");
            h.wait_state(SessionState::AwaitingCommand).await;
        }
        let stale = h.recognizer.sink();
        h.handle.stop().await.unwrap();
        assert_eq!(h.handle.state(), SessionState::Idle);
        assert!(h.recognizer.stops.load(Ordering::SeqCst) >= 1);

        // Callbacks from the stopped session are discarded
        stale.utterance(Utterance::final_text("hey bob what time is it"));
        // Let the run loop drain the engine queue before looking
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.handle.stop().await.unwrap();
        let snap = h.handle.snapshot();
        assert_eq!(snap.state, SessionState::Idle);
        assert!(snap.history.is_empty());
        h.shutdown().await;
    }

    // Dispatching
    let stalled = Arc::new(StalledAnswers::default());
    let h = spawn(Arc::clone(&stalled) as Arc<dyn AnswerService>).await;
    h.handle.dispatch("how far is the moon").await.unwrap();
    h.wait_state(SessionState::Dispatching).await;
    h.handle.stop().await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Idle);
    stalled.release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.synthesizer.spoken().is_empty(), "aborted answer is never spoken");
    assert_eq!(h.handle.state(), SessionState::Idle);
    h.shutdown().await;

    // Speaking
    let h = spawn_with(
        Arc::new(scripted_answer("read me a story", "Once upon a time.", 1)),
        test_config(),
        ScriptedRecognizer::default(),
        ScriptedSynthesizer::new(false),
        None,
    )
    .await;
    h.handle.dispatch("read me a story").await.unwrap();
    h.wait_state(SessionState::Speaking).await;
    let cancels_before = h.synthesizer.cancels.load(Ordering::SeqCst);
    h.handle.stop().await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Idle);
    assert!(h.synthesizer.cancels.load(Ordering::SeqCst) > cancels_before);
    h.handle.stop().await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Idle);
    h.shutdown().await;
}

#[tokio::test]
async fn only_one_dispatch_in_flight() {
    let stalled = Arc::new(StalledAnswers::default());
    let h = spawn(Arc::clone(&stalled) as Arc<dyn AnswerService>).await;

    assert!(matches!(
        h.handle.dispatch("first question").await.unwrap(),
        DispatchOutcome::Dispatched { .. }
    ));
    assert_eq!(
        h.handle.dispatch("second question").await.unwrap(),
        DispatchOutcome::Busy
    );
    assert_eq!(h.handle.dispatch("   ").await.unwrap(), DispatchOutcome::Empty);

    let snap = h.handle.snapshot();
    assert_eq!(snap.history.len(), 1);
    assert_eq!(snap.history[0].query, "first question");
    assert_eq!(snap.history[0].source, QuerySource::Text);

    stalled.release.notify_one();
    h.wait_for("late answer", |s| {
        s.state == SessionState::Idle
            && s.history.first().and_then(|r| r.answer.as_deref()) == Some("late answer")
    })
    .await;
    assert_eq!(stalled.calls.load(Ordering::SeqCst), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn answer_failure_is_spoken_as_an_apology() {
    let mut answers = MockAnswers::new();
    answers
        .expect_answer()
        .times(1)
        .returning(|_| Err(AnswerError::Backend("model unavailable".into())));
    let h = spawn(Arc::new(answers)).await;

    h.handle.dispatch("what is the capital of France").await.unwrap();
    let snap = h
        .wait_for("apology", |s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        })
        .await;

    let apology = "Sorry, I encountered an error: model unavailable";
    assert_eq!(snap.history[0].answer.as_deref(), Some(apology));
    assert_eq!(h.synthesizer.spoken(), vec![apology.to_string()]);
    let err = snap.last_error.expect("failure surfaced");
    assert_eq!(err.kind, ErrorKind::AnswerServiceFailure);
    h.shutdown().await;
}

#[tokio::test]
async fn slow_answer_service_times_out() {
    let mut config = test_config();
    config.answer_timeout = Duration::from_millis(50);
    let h = spawn_with(
        Arc::new(StalledAnswers::default()),
        config,
        ScriptedRecognizer::default(),
        ScriptedSynthesizer::new(true),
        None,
    )
    .await;

    h.handle.dispatch("are you there").await.unwrap();
    let snap = h
        .wait_for("timeout apology", |s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        })
        .await;
    assert_eq!(
        snap.history[0].answer.as_deref(),
        Some("Sorry, I encountered an error: no answer within 50 ms")
    );
    assert_eq!(
        snap.last_error.map(|e| e.kind),
        Some(ErrorKind::AnswerServiceFailure)
    );
    h.shutdown().await;
}

#[tokio::test]
async fn answers_are_sanitized_before_speaking() {
    let long = format!("**Paris** is the _capital_.\n\n{}", "word ".repeat(100));
    let reply: &'static str = Box::leak(long.into_boxed_str());
    let h = spawn(Arc::new(scripted_answer("capital of france", reply, 1))).await;

    h.handle.dispatch("capital of france").await.unwrap();
    h.wait_for("spoken", |s| {
        s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
    })
    .await;

    let spoken = h.synthesizer.spoken();
    assert_eq!(spoken.len(), 1);
    assert!(spoken[0].starts_with("Paris is the capital. word word"));
    assert!(!spoken[0].contains('*') && !spoken[0].contains('\n'));
    assert!(spoken[0].chars().count() <= 300);
    // History keeps the full answer
    assert_eq!(h.handle.snapshot().history[0].answer.as_deref(), Some(reply));
    h.shutdown().await;
}

#[tokio::test]
async fn auto_restart_listens_again_after_speaking() {
    let mut config = test_config();
    config.auto_restart = true;
    let h = spawn_with(
        Arc::new(scripted_answer("what day is it", "It is Monday.", 1)),
        config,
        ScriptedRecognizer::default(),
        ScriptedSynthesizer::new(true),
        None,
    )
    .await;

    h.handle.start().await.unwrap();
    h.wait_state(SessionState::AwaitingWakeWord).await;
    h.recognizer.say("hello bob what day is it");

    let starts = Arc::clone(&h.recognizer.starts);
    let snap = h
        .wait_for("listening again", move |s| {
            s.state == SessionState::AwaitingWakeWord && starts.load(Ordering::SeqCst) == 2
        })
        .await;
    assert_eq!(snap.history[0].answer.as_deref(), Some("It is Monday."));
    h.shutdown().await;
}

#[tokio::test]
async fn start_without_recognizer_reports_unsupported() {
    let (handle, task) = VoiceSessionController::builder(Arc::new(MockAnswers::new()))
        .config(test_config())
        .spawn()
        .await
        .unwrap();

    let err = handle.start().await.expect_err("no recognizer");
    assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);
    let snap = handle
        .wait_until(|s| s.last_error.is_some())
        .await
        .unwrap();
    assert_eq!(snap.state, SessionState::Idle);
    assert_eq!(
        snap.last_error.map(|e| e.kind),
        Some(ErrorKind::UnsupportedCapability)
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn recognized_command_events_bypass_the_wake_phrase() {
    let bus = Arc::new(EventBus::new().await.unwrap());
    let h = spawn_with(
        Arc::new(scripted_answer("set a timer for five minutes", "Timer set.", 1)),
        test_config(),
        ScriptedRecognizer::default(),
        ScriptedSynthesizer::new(true),
        Some(Arc::clone(&bus)),
    )
    .await;

    let delivered = bus
        .publish(
            "voice.command",
            recognized_command("set a timer for five minutes").with_metadata("timestamp_ms", "7"),
        )
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let snap = h
        .wait_for("answered", |s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        })
        .await;
    assert_eq!(snap.history[0].submitted_at_ms, 7);
    assert_eq!(snap.history[0].source, QuerySource::Text);

    // Replaying the same event is a duplicate
    bus.publish(
        "voice.command",
        recognized_command("set a timer for five minutes").with_metadata("timestamp_ms", "7"),
    )
    .await
    .unwrap();
    // A later host round trip proves the replay was handled
    h.handle.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.snapshot().history.len(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn bus_transcripts_drive_the_session() {
    let bus = Arc::new(EventBus::new().await.unwrap());
    let synthesizer = ScriptedSynthesizer::new(true);
    let (handle, task) = VoiceSessionController::builder(Arc::new(scripted_answer(
        "how tall is the eiffel tower",
        "About 330 metres.",
        1,
    )))
    .config(test_config())
    .recognizer(Box::new(bob_voice::BusRecognizer::new(
        Arc::clone(&bus),
        "transcript",
    )))
    .synthesizer(Box::new(synthesizer.clone()))
    .bus(Arc::clone(&bus))
    .spawn()
    .await
    .unwrap();

    handle.start().await.unwrap();
    tokio::time::timeout(WAIT, handle.wait_until(|s| s.state == SessionState::AwaitingWakeWord))
        .await
        .unwrap()
        .unwrap();

    let ev = Event::new("transcript.final", "stt")
        .with_metadata("text", "hey bob how tall is the eiffel tower")
        .with_confidence(0.92);
    bus.publish("transcript", ev).await.unwrap();

    let snap = tokio::time::timeout(
        WAIT,
        handle.wait_until(|s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(snap.history[0].query, "how tall is the eiffel tower");
    assert_eq!(synthesizer.spoken(), vec!["About 330 metres.".to_string()]);

    // The recognizer dropped its subscription once the command was dispatched
    let stats = bus.get_stats("transcript").expect("stats");
    assert_eq!(stats.active_subscriptions, 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

async fn spawn_on_bus(
    answers: Arc<dyn AnswerService>,
    bus: &Arc<EventBus>,
) -> (ControllerHandle, JoinHandle<()>) {
    VoiceSessionController::builder(answers)
        .config(test_config())
        .recognizer(Box::new(bob_voice::BusRecognizer::new(
            Arc::clone(bus),
            "transcript",
        )))
        .synthesizer(Box::new(ScriptedSynthesizer::new(true)))
        .bus(Arc::clone(bus))
        .spawn()
        .await
        .unwrap()
}

fn final_transcript(text: &str) -> Event {
    Event::new("transcript.final", "stt").with_metadata("text", text)
}

#[tokio::test]
async fn bare_wake_over_one_shot_bus_transcripts_accepts_the_next_phrase() {
    let bus = Arc::new(EventBus::new().await.unwrap());
    let (handle, task) = spawn_on_bus(
        Arc::new(scripted_answer("what time is it", "It is noon.", 1)),
        &bus,
    )
    .await;

    handle.start().await.unwrap();
    tokio::time::timeout(WAIT, handle.wait_until(|s| s.state == SessionState::AwaitingWakeWord))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bus.publish("transcript", final_transcript("hey bob")).await.unwrap(), 1);

    // Only the re-armed session can receive the command
    tokio::time::timeout(WAIT, async {
        while bus
            .publish("transcript", final_transcript("what time is it"))
            .await
            .unwrap()
            == 0
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("recognition re-armed for the command");

    let snap = tokio::time::timeout(
        WAIT,
        handle.wait_until(|s| {
            s.state == SessionState::Idle && s.history.iter().any(|r| r.answer.is_some())
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(snap.history.len(), 1);
    assert_eq!(snap.history[0].query, "what time is it");

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn ended_bus_session_releases_its_transcript_subscription() {
    let mut answers = MockAnswers::new();
    answers.expect_answer().never();
    let bus = Arc::new(EventBus::new().await.unwrap());
    let (handle, task) = spawn_on_bus(Arc::new(answers), &bus).await;

    handle.start().await.unwrap();
    tokio::time::timeout(WAIT, handle.wait_until(|s| s.state == SessionState::AwaitingWakeWord))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bus.get_stats("transcript").unwrap().active_subscriptions, 1);

    bus.publish("transcript", final_transcript("nothing to see here"))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.wait_until(|s| s.state == SessionState::Idle))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(bus.get_stats("transcript").unwrap().active_subscriptions, 0);
    let dropped_before = bus.get_stats("transcript").unwrap().dropped_events;
    assert_eq!(
        bus.publish("transcript", final_transcript("anyone there"))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        bus.get_stats("transcript").unwrap().dropped_events,
        dropped_before
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
