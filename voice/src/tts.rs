//! Speech synthesis through local CLI engines.
//!
//! Prefers Piper (needs a voice model), falls back to espeak-ng, and when
//! neither is installed logs the reply and reports it as spoken. Synthesis
//! writes a temporary WAV that is played with the first available player
//! (aplay, paplay, ffplay). Every child process is killed when the utterance
//! is cancelled.
//!
//! Env overrides: PIPER_BIN, PIPER_VOICE, ESPEAK_BIN, ESPEAK_VOICE,
//! TTS_PLAYER, TTS_TIMEOUT_MS, TTS_TEMP_DIR.

use crate::error::{ErrorKind, Result, VoiceError};
use crate::synthesis::{SpeechRequest, SpeechSynthesizer, SynthesisSink};
use crate::utils::now_ms;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct CliSynthesizerConfig {
    pub temp_dir: PathBuf,
    /// Upper bound on synthesis plus playback of one reply
    pub timeout_ms: u64,
    pub sample_rate: u32,
    pub piper_bin: Option<PathBuf>,
    pub piper_voice: Option<PathBuf>,
    pub espeak_bin: Option<PathBuf>,
    pub espeak_voice: Option<String>,
    /// Preferred player binary name
    pub player: Option<String>,
}

impl Default for CliSynthesizerConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::var("TTS_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            timeout_ms: std::env::var("TTS_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60_000),
            sample_rate: 22_050,
            piper_bin: find_binary("PIPER_BIN", "piper"),
            piper_voice: std::env::var("PIPER_VOICE")
                .ok()
                .map(PathBuf::from)
                .filter(|p| p.exists()),
            espeak_bin: find_binary("ESPEAK_BIN", "espeak-ng").or_else(|| on_path("espeak")),
            espeak_voice: std::env::var("ESPEAK_VOICE").ok().filter(|s| !s.is_empty()),
            player: std::env::var("TTS_PLAYER").ok().filter(|s| !s.is_empty()),
        }
    }
}

fn find_binary(env_key: &str, default_bin: &str) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(env_key) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
    }
    on_path(default_bin)
}

fn on_path(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let p = PathBuf::from(bin);
        return p.exists().then_some(p);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.exists())
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Engine {
    Piper { bin: PathBuf, voice: PathBuf },
    Espeak { bin: PathBuf },
    None,
}

impl Engine {
    fn detect(cfg: &CliSynthesizerConfig) -> Self {
        if let (Some(bin), Some(voice)) = (&cfg.piper_bin, &cfg.piper_voice) {
            return Engine::Piper {
                bin: bin.clone(),
                voice: voice.clone(),
            };
        }
        if let Some(bin) = &cfg.espeak_bin {
            return Engine::Espeak { bin: bin.clone() };
        }
        Engine::None
    }

    fn label(&self) -> &'static str {
        match self {
            Engine::Piper { .. } => "piper",
            Engine::Espeak { .. } => "espeak-ng",
            Engine::None => "none",
        }
    }
}

pub struct CliSynthesizer {
    cfg: CliSynthesizerConfig,
    engine: Engine,
    player: Option<PathBuf>,
    current: Option<JoinHandle<()>>,
}

impl CliSynthesizer {
    pub fn new(cfg: CliSynthesizerConfig) -> Self {
        let engine = Engine::detect(&cfg);
        let player = cfg
            .player
            .as_deref()
            .and_then(on_path)
            .or_else(|| ["aplay", "paplay", "ffplay"].into_iter().find_map(on_path));
        info!(target: "tts", engine = engine.label(), player = ?player, "CLI synthesizer ready");
        Self {
            cfg,
            engine,
            player,
            current: None,
        }
    }

    /// True when a synthesis engine was found; otherwise replies are only logged
    pub fn has_engine(&self) -> bool {
        self.engine != Engine::None
    }
}

#[async_trait]
impl SpeechSynthesizer for CliSynthesizer {
    fn name(&self) -> &str {
        self.engine.label()
    }

    async fn speak(&mut self, request: SpeechRequest, sink: SynthesisSink) -> Result<()> {
        self.cancel().await;

        if self.engine == Engine::None {
            warn!(target: "tts", "No TTS engine detected. Printing only.");
            sink.started();
            info!(target: "tts", text = %request.text, "🗣️  Bob says");
            sink.ended();
            return Ok(());
        }

        let engine = self.engine.clone();
        let player = self.player.clone();
        let cfg = self.cfg.clone();
        self.current = Some(tokio::spawn(async move {
            sink.started();
            let wav_path = cfg
                .temp_dir
                .join(format!("bob_tts_{}_{}.wav", now_ms(), sink.generation()));
            let limit = Duration::from_millis(cfg.timeout_ms);
            let outcome = timeout(
                limit,
                synthesize_and_play(&engine, player.as_deref(), &cfg, &request, &wav_path),
            )
            .await;
            let _ = tokio::fs::remove_file(&wav_path).await;
            match outcome {
                Ok(Ok(())) => {
                    sink.ended();
                }
                Ok(Err(e)) => {
                    warn!(target: "tts", error = %e, "Speech synthesis failed");
                    sink.error(e.to_string());
                }
                Err(_) => {
                    warn!(target: "tts", timeout_ms = cfg.timeout_ms, "Speech synthesis timed out");
                    sink.error(format!("synthesis timed out after {} ms", cfg.timeout_ms));
                }
            }
        }));
        Ok(())
    }

    async fn cancel(&mut self) {
        if let Some(task) = self.current.take() {
            // kill_on_drop reaps the child processes with the task
            task.abort();
            debug!(target: "tts", "Speech cancelled");
        }
    }
}

async fn synthesize_and_play(
    engine: &Engine,
    player: Option<&Path>,
    cfg: &CliSynthesizerConfig,
    request: &SpeechRequest,
    wav_path: &Path,
) -> Result<()> {
    let t0 = now_ms();
    match engine {
        Engine::Piper { bin, voice } => {
            synth_with_piper(bin, voice, cfg.sample_rate, request, wav_path).await?
        }
        Engine::Espeak { bin } => {
            synth_with_espeak(bin, cfg.espeak_voice.as_deref(), request, wav_path).await?
        }
        Engine::None => return Ok(()),
    }
    debug!(target: "tts", engine = engine.label(), synthesis_ms = now_ms() - t0, "Synthesized");

    match player {
        Some(bin) => play_wav(bin, wav_path).await,
        None => {
            info!(target: "tts", path = ?wav_path, "No audio player found; skipping playback");
            Ok(())
        }
    }
}

async fn synth_with_piper(
    bin: &Path,
    voice: &Path,
    sample_rate: u32,
    request: &SpeechRequest,
    out_wav: &Path,
) -> Result<()> {
    let length_scale = (1.0f32 / request.settings.rate.max(0.1)).clamp(0.5, 2.0);
    let mut cmd = Command::new(bin);
    cmd.arg("-m")
        .arg(voice)
        .arg("-f")
        .arg(out_wav)
        .arg("--length_scale")
        .arg(format!("{:.2}", length_scale))
        .arg("--sample_rate")
        .arg(sample_rate.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(target: "tts", command = ?cmd, "Running piper");
    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(request.text.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(VoiceError::engine(
            ErrorKind::Other,
            format!("piper failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
        ));
    }
    Ok(())
}

/// espeak-ng words per minute, amplitude and pitch for the given settings
fn espeak_args(request: &SpeechRequest) -> (i32, i32, i32) {
    let s = &request.settings;
    let wpm = (175.0 * s.rate).round().clamp(80.0, 450.0) as i32;
    let amplitude = (100.0 * s.volume).round().clamp(0.0, 200.0) as i32;
    let pitch = (50.0 * s.pitch).round().clamp(0.0, 99.0) as i32;
    (wpm, amplitude, pitch)
}

async fn synth_with_espeak(
    bin: &Path,
    voice: Option<&str>,
    request: &SpeechRequest,
    out_wav: &Path,
) -> Result<()> {
    let (wpm, amplitude, pitch) = espeak_args(request);
    let voice = voice
        .map(str::to_string)
        .unwrap_or_else(|| request.language.to_lowercase());

    let mut cmd = Command::new(bin);
    cmd.arg("-v")
        .arg(&voice)
        .arg("-s")
        .arg(wpm.to_string())
        .arg("-a")
        .arg(amplitude.to_string())
        .arg("-p")
        .arg(pitch.to_string())
        .arg("-w")
        .arg(out_wav)
        .arg(&request.text)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(target: "tts", command = ?cmd, "Running espeak-ng");
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(VoiceError::engine(
            ErrorKind::Other,
            format!("espeak-ng failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
        ));
    }
    Ok(())
}

async fn play_wav(player: &Path, wav_path: &Path) -> Result<()> {
    let mut cmd = Command::new(player);
    if player.file_name().and_then(|s| s.to_str()) == Some("ffplay") {
        cmd.arg("-autoexit").arg("-nodisp").arg("-loglevel").arg("quiet");
    }
    cmd.arg(wav_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let status = cmd.status().await?;
    if !status.success() {
        return Err(VoiceError::engine(
            ErrorKind::DeviceUnavailable,
            format!("{} exited with {}", player.display(), status),
        ));
    }
    Ok(())
}
