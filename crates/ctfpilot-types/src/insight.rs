use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InsightSource {
    #[default]
    Model,
    RuleBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextCommand {
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

/// One round of AI guidance. Transient: it drives a single loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiInsight {
    #[serde(default)]
    pub analysis: String,
    #[serde(default = "unknown_category")]
    pub category: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub next_commands: Vec<NextCommand>,
    #[serde(default)]
    pub flag_candidates: Vec<String>,
    #[serde(default = "default_true")]
    pub should_continue: bool,
    #[serde(default)]
    pub source: InsightSource,
}

impl Default for AiInsight {
    fn default() -> Self {
        Self {
            analysis: String::new(),
            category: unknown_category(),
            confidence: 0.0,
            findings: Vec::new(),
            next_commands: Vec::new(),
            flag_candidates: Vec::new(),
            should_continue: true,
            source: InsightSource::Model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryGuess {
    pub category: String,
    pub confidence: f64,
}

fn unknown_category() -> String {
    "unknown".to_string()
}

fn default_true() -> bool {
    true
}
