use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::AutopilotError;

/// Recognised flag shapes. Unanchored, since `strings` often glues printable
/// bytes onto the prefix; leftmost-first matching still reports `picoCTF{x}`
/// once.
pub const DEFAULT_FLAG_PATTERN: &str = r"(?:picoCTF|CTF|FLAG|flag|ctf|HTB|THM)\{[^}\r\n]{1,200}\}";

static DEFAULT_FLAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_FLAG_PATTERN).expect("flag regex"));
static PLAIN_FLAG_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]+\{[A-Za-z0-9_-]+\}$").expect("flag shape regex"));

/// Tools whose output is already decoded text.
const TEXT_TOOLS: &[&str] = &["strings", "base64", "pdftotext", "cat", "xxd"];

#[derive(Debug, Clone, Default)]
pub struct FlagDetector {
    custom: Option<Regex>,
}

impl FlagDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a challenge-specific pattern, matched case-insensitively, on top
    /// of the built-in shapes.
    pub fn with_custom_pattern(pattern: &str) -> Result<Self, AutopilotError> {
        let custom = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| AutopilotError::InvalidFlagPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            custom: Some(custom),
        })
    }

    pub fn from_optional(pattern: Option<&str>) -> Result<Self, AutopilotError> {
        match pattern.map(str::trim).filter(|p| !p.is_empty()) {
            Some(pattern) => Self::with_custom_pattern(pattern),
            None => Ok(Self::new()),
        }
    }

    /// Pattern the generated solve script should search for.
    pub fn script_pattern(&self) -> &str {
        self.custom
            .as_ref()
            .map(Regex::as_str)
            .unwrap_or(DEFAULT_FLAG_PATTERN)
    }

    /// Deduplicated matches in first-occurrence order.
    pub fn detect(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<(usize, &str)> = DEFAULT_FLAG_RE
            .find_iter(text)
            .map(|m| (m.start(), m.as_str()))
            .collect();
        if let Some(custom) = &self.custom {
            hits.extend(
                custom
                    .find_iter(text)
                    .filter(|m| !m.as_str().is_empty())
                    .map(|m| (m.start(), m.as_str())),
            );
            hits.sort_by_key(|(start, _)| *start);
        }
        let mut out: Vec<String> = Vec::new();
        for (_, hit) in hits {
            if !out.iter().any(|seen| seen == hit) {
                out.push(hit.to_string());
            }
        }
        out
    }
}

/// Built-in shapes only.
pub fn detect_flags(text: &str) -> Vec<String> {
    FlagDetector::new().detect(text)
}

/// Rough confidence in [0.1, 1.0] that `flag` is the real answer, judged from
/// the tool that printed it and the line it sits on.
pub fn score_candidate(flag: &str, tool: &str, output: &str) -> f64 {
    let mut confidence: f64 = 0.5;

    if TEXT_TOOLS.contains(&tool) {
        confidence += 0.2;
    }
    if PLAIN_FLAG_SHAPE.is_match(flag) {
        confidence += 0.2;
    }

    if let (Some(open), Some(close)) = (flag.find('{'), flag.rfind('}')) {
        let body_len = flag[open + 1..close].chars().count();
        if body_len < 5 {
            confidence -= 0.2;
        } else if body_len > 100 {
            confidence -= 0.3;
        }
    }

    if let Some(line) = output.lines().find(|line| line.contains(flag)) {
        let total = line.chars().count().max(1);
        let readable = line
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .count();
        if (readable as f64) / (total as f64) < 0.5 {
            confidence -= 0.2;
        }
    }

    confidence.clamp(0.1, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_each_shape_once_in_order() {
        let text = "x FLAG{b} y CTF{a} z CTF{a} HTB{c}";
        assert_eq!(detect_flags(text), vec!["FLAG{b}", "CTF{a}", "HTB{c}"]);
    }

    #[test]
    fn pico_prefix_is_not_reported_twice() {
        assert_eq!(detect_flags("picoCTF{nested}"), vec!["picoCTF{nested}"]);
    }

    #[test]
    fn finds_flags_glued_to_preceding_bytes() {
        assert_eq!(detect_flags("dataCTF{abc}"), vec!["CTF{abc}"]);
        assert_eq!(detect_flags("key_flag{secret}"), vec!["flag{secret}"]);
        assert_eq!(detect_flags("%sCTF{fmt}"), vec!["CTF{fmt}"]);
        assert_eq!(detect_flags("0x41FLAG{hex}"), vec!["FLAG{hex}"]);
        assert_eq!(
            detect_flags("picoCTF{x} dataCTF{y}"),
            vec!["picoCTF{x}", "CTF{y}"]
        );
    }

    #[test]
    fn scoring_returns_an_f64_in_range() {
        let score: f64 = score_candidate("CTF{a}", "cat", "");
        assert!((0.1..=1.0).contains(&score));
    }

    #[test]
    fn rejects_empty_and_multiline_bodies() {
        assert!(detect_flags("CTF{}").is_empty());
        assert!(detect_flags("CTF{abc\ndef}").is_empty());
    }

    #[test]
    fn custom_pattern_is_case_insensitive_and_merged() {
        let detector = FlagDetector::with_custom_pattern(r"secret\[[a-z]+\]").unwrap();
        let hits = detector.detect("SECRET[abc] then CTF{x}");
        assert_eq!(hits, vec!["SECRET[abc]", "CTF{x}"]);
        assert_eq!(detector.script_pattern(), r"secret\[[a-z]+\]");
    }

    #[test]
    fn invalid_custom_pattern_is_rejected() {
        let err = FlagDetector::with_custom_pattern("(unclosed").unwrap_err();
        assert!(matches!(err, AutopilotError::InvalidFlagPattern { .. }));
        assert!(FlagDetector::from_optional(Some("  ")).is_ok());
    }

    #[test]
    fn scoring_prefers_clean_text_output() {
        let clean = score_candidate("CTF{hello_world}", "strings", "CTF{hello_world}");
        let noisy = score_candidate("CTF{ab}", "xxd2", "\u{1}\u{2}\u{3}\u{4}\u{5}\u{6}\u{7}\u{8}CTF{ab}");
        assert!((clean - 0.9).abs() < 1e-9);
        assert!(noisy < clean);
        assert!(noisy >= 0.1);
    }
}
