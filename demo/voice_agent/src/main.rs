mod config;
use bob_core::llm::LlmClient;
use bob_core::{Event, EventBus, LlmAnswerService};
use bob_voice::{
    recognized_command, BusRecognizer, CliSynthesizer, ControllerHandle, LogSynthesizer,
    SessionSnapshot, SpeechSynthesizer, VoiceSessionController,
};
use config::VoiceAgentConfig;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

const HELP: &str = "Type what the microphone would hear (\"hey bob, what's the weather\"), \
~text for an interim transcript, /ask <text> to type a question, /start, /stop, /quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,bob_core=info,bob_voice=info,voice_agent=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        target: "voice_agent",
        "Starting Bob voice agent demo: transcripts → wake phrase → LLM → TTS"
    );

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = VoiceAgentConfig::load();

    let bus = Arc::new(EventBus::new().await?);
    bus.start().await?;

    let answers = LlmAnswerService::new(LlmClient::new(cfg.llm.clone())?, cfg.answer.clone());
    let synthesizer: Box<dyn SpeechSynthesizer> = if cfg.speak_aloud {
        Box::new(CliSynthesizer::new(cfg.tts.clone()))
    } else {
        Box::new(LogSynthesizer)
    };

    let (handle, controller_task) = VoiceSessionController::builder(Arc::new(answers))
        .config(cfg.session.clone())
        .recognizer(Box::new(BusRecognizer::new(
            Arc::clone(&bus),
            cfg.transcript_topic.clone(),
        )))
        .synthesizer(synthesizer)
        .bus(Arc::clone(&bus))
        .spawn()
        .await?;

    let render_task = tokio::spawn(render_snapshots(handle.clone()));

    handle.start().await?;
    info!(target: "voice_agent", "{}", HELP);

    let mut console = tokio::spawn(console_loop(
        handle.clone(),
        Arc::clone(&bus),
        cfg.transcript_topic.clone(),
        cfg.session.command_topic.clone(),
    ));

    // Ctrl+C or /quit ends the demo
    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                error!(target: "voice_agent", error = %e, "Failed to listen for Ctrl+C");
            }
            info!(target: "voice_agent", "Shutting down...");
        }
        _ = &mut console => {
            info!(target: "voice_agent", "Console closed; shutting down...");
        }
    }

    if let Err(e) = handle.shutdown().await {
        warn!(target: "voice_agent", error = %e, "Controller already gone");
    }
    if let Err(e) = controller_task.await {
        error!(target: "voice_agent", error = %e, "Controller task failed");
    }
    console.abort();
    render_task.abort();

    bus.shutdown().await.ok();
    Ok(())
}

/// Read stdin lines and turn them into transcripts, commands and session controls
async fn console_loop(
    handle: ControllerHandle,
    bus: Arc<EventBus>,
    transcript_topic: String,
    command_topic: String,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(target: "voice_agent", error = %e, "Failed to read stdin");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/help" => info!(target: "voice_agent", "{}", HELP),
            "/start" => {
                if let Err(e) = handle.start().await {
                    warn!(target: "voice_agent", error = %e, "Cannot start listening");
                }
            }
            "/stop" => {
                if let Err(e) = handle.stop().await {
                    warn!(target: "voice_agent", error = %e, "Cannot stop");
                }
            }
            _ => {
                let (topic, event) = if let Some(question) = line.strip_prefix("/ask ") {
                    (&command_topic, recognized_command(question.trim()))
                } else if let Some(partial) = line.strip_prefix('~') {
                    (
                        &transcript_topic,
                        Event::new("transcript.partial", "console")
                            .with_metadata("text", partial.trim()),
                    )
                } else {
                    (
                        &transcript_topic,
                        Event::new("transcript.final", "console").with_metadata("text", line),
                    )
                };
                match bus.publish(topic, event).await {
                    Ok(0) => info!(target: "voice_agent", "Nobody is listening; /start first"),
                    Ok(_) => {}
                    Err(e) => error!(target: "voice_agent", error = %e, "Publish failed"),
                }
            }
        }
    }
}

/// Log every session change the way a UI would render it
async fn render_snapshots(handle: ControllerHandle) {
    let mut rx = handle.subscribe();
    let mut last = SessionSnapshot::default();
    while rx.changed().await.is_ok() {
        let snap = rx.borrow_and_update().clone();
        if snap.state != last.state {
            info!(target: "voice_agent", state = %snap.state, "● Session");
        }
        if snap.live_transcript != last.live_transcript && !snap.live_transcript.is_empty() {
            info!(target: "voice_agent", transcript = %snap.live_transcript, "… Heard");
        }
        if snap.last_error != last.last_error {
            if let Some(err) = &snap.last_error {
                warn!(target: "voice_agent", kind = %err.kind, detail = ?err.detail, "⚠️  {}", err.message);
            }
        }
        for record in &snap.history {
            let before = last.history.iter().find(|r| r.id == record.id);
            if before.is_none() {
                info!(target: "voice_agent", at = %record.display_time(), source = ?record.source, "➡️  You: {}", record.query);
            }
            if let Some(answer) = &record.answer {
                if before.and_then(|r| r.answer.as_ref()).is_none() {
                    info!(target: "voice_agent", at = %record.display_time(), "💬 Bob: {}", answer);
                }
            }
        }
        last = snap;
    }
}
