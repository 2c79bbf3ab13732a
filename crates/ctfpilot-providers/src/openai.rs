use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use ctfpilot_types::{AiInsight, CategoryGuess};

use crate::parse::{parse_category_guess, parse_insight};
use crate::prompt::{
    build_analysis_prompt, build_classification_prompt, ANALYST_SYSTEM_PROMPT,
    CLASSIFIER_SYSTEM_PROMPT,
};
use crate::{AnalysisRequest, CategoryClassifier, ProviderConfig, SuggestionProvider};

/// Chat-completions client usable against any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleAnalyst {
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: Client,
}

impl OpenAiCompatibleAnalyst {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            base_url: normalize_base(&config.url),
            api_key: config.resolved_api_key(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(&json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }
        if let Some(text) = extract_openai_text(&value) {
            return Ok(text);
        }
        anyhow::bail!(
            "provider returned no completion content for model `{}` (response: {})",
            self.model,
            truncate_for_error(&value.to_string(), 500)
        );
    }
}

#[async_trait]
impl SuggestionProvider for OpenAiCompatibleAnalyst {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AiInsight> {
        let prompt = build_analysis_prompt(request);
        let content = self.complete(ANALYST_SYSTEM_PROMPT, &prompt).await?;
        Ok(parse_insight(&content))
    }
}

#[async_trait]
impl CategoryClassifier for OpenAiCompatibleAnalyst {
    async fn detect_category(
        &self,
        files: &[String],
        file_outputs: &HashMap<String, String>,
        strings_outputs: &HashMap<String, String>,
    ) -> anyhow::Result<CategoryGuess> {
        let prompt = build_classification_prompt(files, file_outputs, strings_outputs);
        let content = self.complete(CLASSIFIER_SYSTEM_PROMPT, &prompt).await?;
        parse_category_guess(&content)
    }
}

fn normalize_base(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/chat/completions")
        .unwrap_or(trimmed)
        .to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut cut = max_len;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &input[..cut])
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let choice = value.get("choices").and_then(|v| v.get(0))?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| choice.get("text").and_then(|t| t.as_str()))
        .filter(|text| !text.trim().is_empty())
        .map(|text| text.to_string())
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message").or(Some(v)))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
