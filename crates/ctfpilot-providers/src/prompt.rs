use std::collections::HashMap;

use ctfpilot_types::HistoryEntry;

use crate::AnalysisRequest;

const HISTORY_WINDOW: usize = 10;
const STDOUT_PREVIEW: usize = 1500;
const STDERR_PREVIEW: usize = 500;
const STRINGS_PREVIEW: usize = 1500;

pub const ANALYST_SYSTEM_PROMPT: &str = r#"You are a capture-the-flag analyst driving a sandbox of command-line tools.
Read the command outputs and choose the next commands most likely to reveal the flag.

Rules:
- Suggest concrete commands with exact arguments; one tool per command, no shell pipes.
- Ground every suggestion in something visible in the outputs.
- Decode encoded data, extract nested files, and inspect metadata before guessing.
- Report anything shaped like a flag (CTF{...}, FLAG{...}, flag{...}) in flag_candidates.
- A failing command is information; change approach instead of repeating it.

Answer with a single JSON object and nothing else:
{
  "analysis": "short reading of the outputs",
  "category": "crypto|pwn|rev|web|forensics|misc",
  "confidence": 0.0,
  "findings": ["..."],
  "next_commands": [{"tool": "name", "args": ["arg"], "reason": "why"}],
  "flag_candidates": ["..."],
  "should_continue": true
}"#;

pub const CLASSIFIER_SYSTEM_PROMPT: &str = r#"You classify capture-the-flag challenges.
Answer with a single JSON object: {"category": "crypto|pwn|rev|web|forensics|misc", "confidence": 0.0}"#;

/// Renders the newest entries first, truncated for the prompt budget.
pub fn format_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "No commands executed yet.".to_string();
    }
    history
        .iter()
        .rev()
        .take(HISTORY_WINDOW)
        .map(|entry| {
            let stdout = truncate_chars(&entry.stdout, STDOUT_PREVIEW);
            let mut section = format!(
                "### Command: {}\nExit code: {}\n\nOutput:\n```\n{}\n```",
                entry.command_line(),
                entry.exit_code,
                if stdout.trim().is_empty() {
                    "(no output)"
                } else {
                    stdout.as_str()
                }
            );
            if !entry.stderr.trim().is_empty() {
                section.push_str(&format!(
                    "\nStderr:\n```\n{}\n```",
                    truncate_chars(&entry.stderr, STDERR_PREVIEW)
                ));
            }
            section
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn build_analysis_prompt(request: &AnalysisRequest) -> String {
    let files = request
        .files
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n");
    let description = if request.description.trim().is_empty() {
        "No description provided"
    } else {
        request.description.trim()
    };
    format!(
        "Analyze these challenge outputs and suggest what to run next.\n\n\
         ## Files in workspace\n{files}\n\n\
         ## Previous commands (most recent first)\n{history}\n\n\
         ## Known so far\n\
         - Challenge description: {description}\n\
         - Expected flag format: {flag_format}\n\
         - Current category: {category}\n\
         - Attempt number: {attempt}\n\n\
         Suggest 1-3 commands. Focus on finding the flag.",
        history = format_history(&request.history),
        flag_format = request.flag_format,
        category = request.category,
        attempt = request.attempt_number,
    )
}

pub fn build_classification_prompt(
    files: &[String],
    file_outputs: &HashMap<String, String>,
    strings_outputs: &HashMap<String, String>,
) -> String {
    let mut sections = Vec::new();
    for file in files {
        let kind = file_outputs.get(file).map(String::as_str).unwrap_or("");
        let strings = strings_outputs.get(file).map(String::as_str).unwrap_or("");
        sections.push(format!(
            "## {file}\nfile: {}\nstrings:\n```\n{}\n```",
            kind.trim(),
            truncate_chars(strings, STRINGS_PREVIEW)
        ));
    }
    format!(
        "Classify this challenge from its recon output.\n\n{}",
        sections.join("\n\n")
    )
}

pub(crate) fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &input[..idx]),
        None => input.to_string(),
    }
}
