//! Make LLM answers safe to hand to a speech synthesizer.

pub const DEFAULT_MAX_SPEECH_CHARS: usize = 300;

/// Strip markdown emphasis, flatten whitespace and bound the length.
///
/// The result never exceeds `max_chars` characters. When the cut falls inside a
/// word and there is a space in the second half of the kept text, the cut backs
/// off to that space.
pub fn sanitize_for_speech(text: &str, max_chars: usize) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`' | '#' | '~'))
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();
    let flat = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if flat.chars().count() <= max_chars {
        return flat;
    }

    let cut: String = flat.chars().take(max_chars).collect();
    let next_is_boundary = flat
        .chars()
        .nth(max_chars)
        .map(char::is_whitespace)
        .unwrap_or(true);
    if !next_is_boundary {
        if let Some(pos) = cut.rfind(' ') {
            if cut[..pos].chars().count() >= max_chars / 2 {
                return cut[..pos].trim_end().to_string();
            }
        }
    }
    cut.trim_end().to_string()
}
