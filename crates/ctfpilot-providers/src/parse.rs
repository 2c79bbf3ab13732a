use ctfpilot_types::{AiInsight, CategoryGuess, InsightSource};

use crate::prompt::truncate_chars;

/// Slice from the first `{` to the last `}`, the way chat models tend to
/// wrap JSON in prose or code fences.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// Never fails: unparsable content becomes an insight with no commands that
/// asks for another attempt.
pub fn parse_insight(content: &str) -> AiInsight {
    let parsed = extract_json_object(content)
        .and_then(|raw| serde_json::from_str::<AiInsight>(raw).ok());
    match parsed {
        Some(mut insight) => {
            insight.source = InsightSource::Model;
            insight.confidence = clamp_confidence(insight.confidence);
            insight.flag_candidates = insight
                .flag_candidates
                .into_iter()
                .map(|candidate| candidate.trim().to_string())
                .filter(|candidate| !candidate.is_empty())
                .collect();
            insight
                .next_commands
                .retain(|command| !command.tool.trim().is_empty());
            insight
        }
        None => {
            tracing::debug!("model answer was not valid insight JSON");
            AiInsight {
                analysis: truncate_chars(content.trim(), 500),
                confidence: 0.3,
                ..AiInsight::default()
            }
        }
    }
}

pub fn parse_category_guess(content: &str) -> anyhow::Result<CategoryGuess> {
    let Some(raw) = extract_json_object(content) else {
        anyhow::bail!("classifier answer contained no JSON object");
    };
    let mut guess: CategoryGuess = serde_json::from_str(raw)?;
    if !guess.confidence.is_finite() {
        anyhow::bail!("classifier returned a non-finite confidence");
    }
    guess.confidence = clamp_confidence(guess.confidence);
    Ok(guess)
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
