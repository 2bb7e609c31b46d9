use crate::error::{Result, VoiceError};
use bob_core::BobError;
use regex::Regex;
use tracing::debug;

pub const DEFAULT_WAKE_PHRASES: &[&str] = &["hey bob", "hi bob", "hello bob", "ok bob"];
pub const DEFAULT_GREETING: &str = "Hello";

/// What to do when an utterance is nothing but the wake phrase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BareWakePolicy {
    /// Arm and treat the next final utterance as the command
    AwaitCommand,
    /// Dispatch the default greeting right away
    Greet,
}

/// Configuration for transcript-based wake phrase gating
#[derive(Clone, Debug)]
pub struct WakeWordConfig {
    /// Trigger phrases, matched case-insensitively anywhere in the utterance
    pub phrases: Vec<String>,
    /// When false every final utterance is a command and no phrase is needed
    pub required: bool,
    /// Command used when the wake phrase carries no remainder
    pub default_greeting: String,
    pub bare_wake: BareWakePolicy,
    /// Per-token Levenshtein tolerance; 0 keeps matching exact (needs the `fuzzy` feature)
    pub max_distance: usize,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        let phrases = std::env::var("WAKE_PHRASES")
            .ok()
            .map(|s| parse_phrases(&s))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_WAKE_PHRASES.iter().map(|s| s.to_string()).collect());

        Self {
            phrases,
            required: std::env::var("WAKE_REQUIRED")
                .ok()
                .map(|s| !matches!(s.as_str(), "0" | "false" | "FALSE" | "no" | "off"))
                .unwrap_or(true),
            default_greeting: DEFAULT_GREETING.to_string(),
            bare_wake: match std::env::var("WAKE_BARE_POLICY").as_deref() {
                Ok("greet") => BareWakePolicy::Greet,
                _ => BareWakePolicy::AwaitCommand,
            },
            max_distance: std::env::var("WAKE_FUZZY_DISTANCE")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(0),
        }
    }
}

/// Split a comma-separated phrase list, normalizing case and whitespace
pub fn parse_phrases(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(normalize)
        .filter(|s| !s.is_empty())
        .collect()
}

/// A wake phrase found in an utterance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WakeMatch {
    /// The configured phrase that matched
    pub phrase: String,
    /// Trimmed text after the phrase; `None` when nothing follows it
    pub command: Option<String>,
}

impl WakeMatch {
    pub fn command_or(&self, greeting: &str) -> String {
        self.command.clone().unwrap_or_else(|| greeting.to_string())
    }
}

pub struct WakeWordMatcher {
    cfg: WakeWordConfig,
    pattern: Option<Regex>,
}

impl WakeWordMatcher {
    pub fn new(cfg: WakeWordConfig) -> Result<Self> {
        let mut phrases: Vec<String> = cfg
            .phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();
        phrases.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        phrases.dedup();

        let pattern = if phrases.is_empty() {
            None
        } else {
            let alternation = phrases
                .iter()
                .map(|p| {
                    p.split_whitespace()
                        .map(regex::escape)
                        .collect::<Vec<_>>()
                        .join(r"\s+")
                })
                .collect::<Vec<_>>()
                .join("|");
            let re = Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).map_err(|e| {
                VoiceError::Core(BobError::ConfigError(format!("invalid wake phrase: {e}")))
            })?;
            Some(re)
        };

        Ok(Self {
            cfg: WakeWordConfig { phrases, ..cfg },
            pattern,
        })
    }

    pub fn config(&self) -> &WakeWordConfig {
        &self.cfg
    }

    /// Find the earliest wake phrase in `text` and the command that follows it
    pub fn find(&self, text: &str) -> Option<WakeMatch> {
        if let Some(found) = self.pattern.as_ref().and_then(|re| re.find(text)) {
            let matched = normalize(found.as_str());
            let phrase = self
                .cfg
                .phrases
                .iter()
                .find(|p| **p == matched)
                .cloned()
                .unwrap_or(matched);
            let command = clean_command(&text[found.end()..]);
            debug!(target: "wake", phrase = %phrase, "Wake phrase matched");
            return Some(WakeMatch { phrase, command });
        }

        self.fuzzy_find(text)
    }

    #[cfg(feature = "fuzzy")]
    fn fuzzy_find(&self, text: &str) -> Option<WakeMatch> {
        if self.cfg.max_distance == 0 {
            return None;
        }
        fuzzy::find(&self.cfg.phrases, text, self.cfg.max_distance)
    }

    #[cfg(not(feature = "fuzzy"))]
    fn fuzzy_find(&self, _text: &str) -> Option<WakeMatch> {
        None
    }

    /// Command carried by `text`: the remainder after the wake phrase, or the
    /// default greeting when the phrase stands alone. `None` when no phrase matched.
    pub fn extract_command(&self, text: &str) -> Option<String> {
        self.find(text)
            .map(|m| m.command_or(&self.cfg.default_greeting))
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim whitespace and the separator punctuation recognizers put after a name ("Hey Bob, ...")
fn clean_command(rest: &str) -> Option<String> {
    let cmd = rest
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ':' | ';' | '-'))
        .trim();
    if cmd.is_empty() || cmd.chars().all(|c| c.is_ascii_punctuation()) {
        None
    } else {
        Some(cmd.to_string())
    }
}

#[cfg(feature = "fuzzy")]
mod fuzzy {
    use super::{clean_command, WakeMatch};
    use strsim::levenshtein;

    fn strip(tok: &str) -> String {
        tok.chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase()
    }

    /// Sliding token window; earliest window where every token is within `max_distance`
    pub(super) fn find(phrases: &[String], text: &str, max_distance: usize) -> Option<WakeMatch> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut best: Option<(usize, usize, &String)> = None; // (start, len, phrase)

        for phrase in phrases {
            let p_tokens: Vec<&str> = phrase.split_whitespace().collect();
            if p_tokens.is_empty() || p_tokens.len() > tokens.len() {
                continue;
            }
            for start in 0..=tokens.len() - p_tokens.len() {
                let ok = p_tokens
                    .iter()
                    .enumerate()
                    .all(|(i, p)| levenshtein(&strip(tokens[start + i]), p) <= max_distance);
                if ok {
                    if best.map(|(s, _, _)| start < s).unwrap_or(true) {
                        best = Some((start, p_tokens.len(), phrase));
                    }
                    break;
                }
            }
        }

        best.map(|(start, len, phrase)| WakeMatch {
            phrase: phrase.clone(),
            command: clean_command(&tokens[start + len..].join(" ")),
        })
    }
}
