use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Reconnaissance,
    CategoryDetection,
    AiAnalysis,
    ScriptGeneration,
    ScriptExecution,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Reconnaissance => "reconnaissance",
            Phase::CategoryDetection => "category_detection",
            Phase::AiAnalysis => "ai_analysis",
            Phase::ScriptGeneration => "script_generation",
            Phase::ScriptExecution => "script_execution",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// True while a run task is driving this phase.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Phase::Idle
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Crypto,
    Pwn,
    Rev,
    Web,
    Forensics,
    #[default]
    Misc,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Crypto,
        Category::Pwn,
        Category::Rev,
        Category::Web,
        Category::Forensics,
        Category::Misc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Crypto => "crypto",
            Category::Pwn => "pwn",
            Category::Rev => "rev",
            Category::Web => "web",
            Category::Forensics => "forensics",
            Category::Misc => "misc",
        }
    }

    /// Lenient parse used for collaborator output. `unknown` and anything
    /// unrecognised map to `None` so callers keep their current category.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let category = match normalized.as_str() {
            "crypto" | "cryptography" => Category::Crypto,
            "pwn" | "binary" | "exploit" | "exploitation" => Category::Pwn,
            "rev" | "re" | "reverse" | "reversing" | "reverse_engineering" => Category::Rev,
            "web" => Category::Web,
            "forensics" | "forensic" | "stego" | "steganography" | "network" => {
                Category::Forensics
            }
            "misc" | "miscellaneous" => Category::Misc,
            _ => return None,
        };
        Some(category)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
