use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bob_core::llm::LlmClientConfig;
use bob_core::LlmAnswerServiceConfig;
use bob_voice::wake::parse_phrases;
use bob_voice::{BareWakePolicy, CliSynthesizerConfig, ControllerConfig};

/// High-level configuration for the Voice Agent demo
#[derive(Clone, Debug)]
pub struct VoiceAgentConfig {
    pub session: ControllerConfig,
    pub llm: LlmClientConfig,
    pub answer: LlmAnswerServiceConfig,
    pub tts: CliSynthesizerConfig,
    /// Speak through Piper / espeak-ng; when false replies are only logged
    pub speak_aloud: bool,
    /// Topic where transcript.partial / transcript.final events arrive
    pub transcript_topic: String,
}

impl Default for VoiceAgentConfig {
    fn default() -> Self {
        // Start from component defaults (which already consider env vars)
        Self {
            session: ControllerConfig::default(),
            llm: LlmClientConfig::default(),
            answer: LlmAnswerServiceConfig::default(),
            tts: CliSynthesizerConfig::default(),
            speak_aloud: std::env::var("TTS_ENGINE")
                .map(|s| s != "log")
                .unwrap_or(true),
            transcript_topic: std::env::var("STT_TRANSCRIPT_TOPIC")
                .unwrap_or_else(|_| "transcript".to_string()),
        }
    }
}

impl VoiceAgentConfig {
    /// Load configuration from a TOML file (path via VOICE_AGENT_CONFIG or ./voice_agent.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path =
            std::env::var("VOICE_AGENT_CONFIG").unwrap_or_else(|_| "voice_agent.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "voice_agent", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<VoiceAgentToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "voice_agent", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "voice_agent", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct VoiceAgentToml {
    pub transcript_topic: Option<String>,
    pub session: Option<SessionToml>,
    pub wake: Option<WakeToml>,
    pub recognition: Option<RecognitionToml>,
    pub speech: Option<SpeechToml>,
    pub llm: Option<LlmToml>,
    pub tts: Option<TtsToml>,
}

impl VoiceAgentToml {
    fn overlay(self, mut base: VoiceAgentConfig) -> VoiceAgentConfig {
        if let Some(t) = self.transcript_topic {
            base.transcript_topic = t;
        }
        if let Some(s) = self.session {
            s.apply(&mut base.session);
        }
        if let Some(w) = self.wake {
            w.apply(&mut base.session);
        }
        if let Some(r) = self.recognition {
            r.apply(&mut base.session);
        }
        if let Some(s) = self.speech {
            s.apply(&mut base.session);
        }
        if let Some(l) = self.llm {
            l.apply(&mut base.llm, &mut base.answer);
        }
        if let Some(t) = self.tts {
            t.apply(&mut base);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SessionToml {
    pub auto_restart: Option<bool>,
    pub answer_timeout_ms: Option<u64>,
    pub max_speech_chars: Option<usize>,
    pub command_topic: Option<String>,
    pub session_topic: Option<String>,
}
impl SessionToml {
    fn apply(self, c: &mut ControllerConfig) {
        if let Some(x) = self.auto_restart {
            c.auto_restart = x;
        }
        if let Some(x) = self.answer_timeout_ms {
            c.answer_timeout = Duration::from_millis(x.max(1));
        }
        if let Some(x) = self.max_speech_chars {
            c.max_speech_chars = x.max(1);
        }
        if let Some(x) = self.command_topic {
            c.command_topic = x;
        }
        if let Some(x) = self.session_topic {
            c.session_topic = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct WakeToml {
    pub phrases: Option<Vec<String>>,
    pub required: Option<bool>,
    pub default_greeting: Option<String>,
    /// "await_command" or "greet"
    pub bare_wake: Option<String>,
    pub max_distance: Option<usize>,
}
impl WakeToml {
    fn apply(self, c: &mut ControllerConfig) {
        let w = &mut c.wake;
        if let Some(x) = self.phrases {
            let phrases = parse_phrases(&x.join(","));
            if !phrases.is_empty() {
                w.phrases = phrases;
            }
        }
        if let Some(x) = self.required {
            w.required = x;
        }
        if let Some(x) = self.default_greeting.filter(|s| !s.trim().is_empty()) {
            w.default_greeting = x;
        }
        match self.bare_wake.as_deref() {
            Some("greet") => w.bare_wake = BareWakePolicy::Greet,
            Some("await_command") => w.bare_wake = BareWakePolicy::AwaitCommand,
            Some(other) => {
                tracing::warn!(target: "voice_agent", value = %other, "Unknown wake.bare_wake; keeping default")
            }
            None => {}
        }
        if let Some(x) = self.max_distance {
            w.max_distance = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RecognitionToml {
    pub language: Option<String>,
    pub continuous: Option<bool>,
    pub interim_results: Option<bool>,
}
impl RecognitionToml {
    fn apply(self, c: &mut ControllerConfig) {
        if let Some(x) = self.language {
            c.recognition.language = x;
        }
        if let Some(x) = self.continuous {
            c.recognition.continuous = x;
        }
        if let Some(x) = self.interim_results {
            c.recognition.interim_results = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SpeechToml {
    pub rate: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
}
impl SpeechToml {
    fn apply(self, c: &mut ControllerConfig) {
        if let Some(x) = self.rate {
            c.speech.rate = x.clamp(0.5, 2.0);
        }
        if let Some(x) = self.pitch {
            c.speech.pitch = x.clamp(0.0, 2.0);
        }
        if let Some(x) = self.volume {
            c.speech.volume = x.clamp(0.0, 2.0);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LlmToml {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub web_search: Option<bool>,
}
impl LlmToml {
    fn apply(self, l: &mut LlmClientConfig, a: &mut LlmAnswerServiceConfig) {
        if let Some(x) = self.base_url {
            l.base_url = x;
        }
        if let Some(x) = self.model {
            l.model = x;
        }
        if let Some(x) = self.api_key {
            l.api_key = Some(x);
        }
        if let Some(x) = self.request_timeout_ms {
            l.request_timeout_ms = x;
        }
        if let Some(x) = self.temperature {
            l.temperature = x;
        }
        if let Some(x) = self.system_prompt {
            a.system_prompt = x;
        }
        if let Some(x) = self.web_search {
            a.web_search = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TtsToml {
    /// "cli" or "log"
    pub engine: Option<String>,
    pub piper_bin: Option<PathBuf>,
    pub piper_voice: Option<PathBuf>,
    pub espeak_bin: Option<PathBuf>,
    pub espeak_voice: Option<String>,
    pub player: Option<String>,
    pub timeout_ms: Option<u64>,
    pub temp_dir: Option<PathBuf>,
}
impl TtsToml {
    fn apply(self, base: &mut VoiceAgentConfig) {
        if let Some(x) = self.engine {
            base.speak_aloud = x != "log";
        }
        let t = &mut base.tts;
        if let Some(x) = self.piper_bin {
            t.piper_bin = Some(x);
        }
        if let Some(x) = self.piper_voice {
            t.piper_voice = Some(x);
        }
        if let Some(x) = self.espeak_bin {
            t.espeak_bin = Some(x);
        }
        if let Some(x) = self.espeak_voice {
            t.espeak_voice = Some(x);
        }
        if let Some(x) = self.player {
            t.player = Some(x);
        }
        if let Some(x) = self.timeout_ms {
            t.timeout_ms = x;
        }
        if let Some(x) = self.temp_dir {
            t.temp_dir = x;
        }
    }
}
