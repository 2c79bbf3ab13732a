use serde::{Deserialize, Serialize};

pub const DEFAULT_FLAG_FORMAT: &str = "CTF{...}";

/// The fixed input of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(default)]
    pub title: String,
    pub files: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_flag_format")]
    pub flag_format: String,
    /// Extra regex recognised as a flag in addition to the built-in shapes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_pattern: Option<String>,
}

impl Challenge {
    pub fn new(files: Vec<String>, description: impl Into<String>) -> Self {
        Self {
            title: String::new(),
            files,
            description: description.into(),
            flag_format: default_flag_format(),
            flag_pattern: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_flag_format(mut self, flag_format: impl Into<String>) -> Self {
        self.flag_format = flag_format.into();
        self
    }

    pub fn with_flag_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.flag_pattern = Some(pattern.into());
        self
    }
}

fn default_flag_format() -> String {
    DEFAULT_FLAG_FORMAT.to_string()
}
