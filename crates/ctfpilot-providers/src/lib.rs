use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ctfpilot_types::{AiInsight, CategoryGuess, HistoryEntry};

mod openai;
mod parse;
mod prompt;
mod rule_based;
mod signature;

pub use openai::OpenAiCompatibleAnalyst;
pub use parse::{extract_json_object, parse_category_guess, parse_insight};
pub use prompt::{build_analysis_prompt, build_classification_prompt, format_history};
pub use rule_based::RuleBasedAnalyst;
pub use signature::SignatureClassifier;

/// Everything the suggestion collaborator sees for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub files: Vec<String>,
    pub history: Vec<HistoryEntry>,
    pub description: String,
    pub flag_format: String,
    pub category: String,
    pub attempt_number: u32,
}

#[async_trait]
pub trait CategoryClassifier: Send + Sync {
    async fn detect_category(
        &self,
        files: &[String],
        file_outputs: &HashMap<String, String>,
        strings_outputs: &HashMap<String, String>,
    ) -> anyhow::Result<CategoryGuess>;
}

#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AiInsight>;
}

#[async_trait]
impl<T: CategoryClassifier + ?Sized> CategoryClassifier for Arc<T> {
    async fn detect_category(
        &self,
        files: &[String],
        file_outputs: &HashMap<String, String>,
        strings_outputs: &HashMap<String, String>,
    ) -> anyhow::Result<CategoryGuess> {
        (**self)
            .detect_category(files, file_outputs, strings_outputs)
            .await
    }
}

#[async_trait]
impl<T: SuggestionProvider + ?Sized> SuggestionProvider for Arc<T> {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AiInsight> {
        (**self).analyze(request).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
            temperature: 0.2,
            max_tokens: 1500,
        }
    }
}

impl ProviderConfig {
    /// Configured key, else `CTFPILOT_API_KEY`, else `OPENAI_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key))
            .map(|key| key.to_string())
            .or_else(|| env_api_key("CTFPILOT_API_KEY"))
            .or_else(|| env_api_key("OPENAI_API_KEY"))
    }

    pub fn model_enabled(&self) -> bool {
        self.resolved_api_key().is_some()
    }
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
        || trimmed.eq_ignore_ascii_case("changeme")
}

fn env_api_key(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !is_placeholder_api_key(v))
}

/// Tries `primary` and answers from `fallback` when it errors.
pub struct WithFallback<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> WithFallback<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P, F> SuggestionProvider for WithFallback<P, F>
where
    P: SuggestionProvider,
    F: SuggestionProvider,
{
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AiInsight> {
        match self.primary.analyze(request).await {
            Ok(insight) => Ok(insight),
            Err(err) => {
                tracing::warn!(
                    attempt = request.attempt_number,
                    error = %err,
                    "suggestion provider failed; using fallback"
                );
                let mut insight = self.fallback.analyze(request).await?;
                insight.analysis = format!("{} (model unavailable: {err})", insight.analysis);
                Ok(insight)
            }
        }
    }
}

#[async_trait]
impl<P, F> CategoryClassifier for WithFallback<P, F>
where
    P: CategoryClassifier,
    F: CategoryClassifier,
{
    async fn detect_category(
        &self,
        files: &[String],
        file_outputs: &HashMap<String, String>,
        strings_outputs: &HashMap<String, String>,
    ) -> anyhow::Result<CategoryGuess> {
        match self
            .primary
            .detect_category(files, file_outputs, strings_outputs)
            .await
        {
            Ok(guess) => Ok(guess),
            Err(err) => {
                tracing::warn!(error = %err, "category classifier failed; using fallback");
                self.fallback
                    .detect_category(files, file_outputs, strings_outputs)
                    .await
            }
        }
    }
}
