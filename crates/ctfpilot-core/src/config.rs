use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use ctfpilot_providers::ProviderConfig;
use ctfpilot_tools::SandboxConfig;

use crate::AutopilotError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub max_attempts: u32,
    pub history_capacity: usize,
    /// Backoff between analysis iterations. Zero disables it.
    pub iteration_delay_ms: u64,
    pub recon_file_limit: usize,
    pub strings_min_len: u32,
    pub script_timeout_secs: u64,
    /// History entries quoted into the solve script.
    pub script_context_entries: usize,
    pub analysis_summary_chars: usize,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            history_capacity: 25,
            iteration_delay_ms: 300,
            recon_file_limit: 5,
            strings_min_len: 4,
            script_timeout_secs: 120,
            script_context_entries: 5,
            analysis_summary_chars: 600,
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<(), AutopilotError> {
        if self.max_attempts == 0 {
            return Err(AutopilotError::ZeroMaxAttempts);
        }
        if self.history_capacity == 0 {
            return Err(AutopilotError::ZeroHistoryCapacity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub autopilot: AutopilotConfig,
    pub provider: ProviderConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: defaults < file < `CTFPILOT_*` env < CLI.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    layers: ConfigLayers,
}

impl ConfigStore {
    pub async fn load(path: Option<&Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };
        let file = match &path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        Ok(Self {
            path,
            layers: ConfigLayers {
                file,
                env: env_layer(|key| std::env::var(key).ok()),
                cli: cli_overrides.unwrap_or_else(empty_object),
            },
        })
    }

    pub fn from_layers(file: Value, env: Value, cli: Value) -> Self {
        Self {
            path: None,
            layers: ConfigLayers { file, env, cli },
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn effective_value(&self) -> Value {
        let mut merged = serde_json::to_value(EngineConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &self.layers.file);
        deep_merge(&mut merged, &self.layers.env);
        deep_merge(&mut merged, &self.layers.cli);
        merged
    }

    pub fn layers_value(&self) -> Value {
        json!({
            "file": self.layers.file,
            "env": self.layers.env,
            "cli": self.layers.cli,
        })
    }

    pub fn config(&self) -> anyhow::Result<EngineConfig> {
        let config: EngineConfig = serde_json::from_value(self.effective_value())
            .context("configuration does not match the expected shape")?;
        config.autopilot.validate()?;
        Ok(config)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CTFPILOT_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("ctfpilot").join("config.json"))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_str::<Value>(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("CTFPILOT_MAX_ATTEMPTS").and_then(|v| v.trim().parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "autopilot": { "max_attempts": v } }));
    }
    if let Some(v) = get("CTFPILOT_HISTORY_CAPACITY").and_then(|v| v.trim().parse::<usize>().ok()) {
        deep_merge(&mut root, &json!({ "autopilot": { "history_capacity": v } }));
    }
    if let Some(v) = get("CTFPILOT_ITERATION_DELAY_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "autopilot": { "iteration_delay_ms": v } }));
    }
    if let Some(url) = get("CTFPILOT_PROVIDER_URL") {
        deep_merge(&mut root, &json!({ "provider": { "url": url } }));
    }
    if let Some(model) = get("CTFPILOT_MODEL") {
        deep_merge(&mut root, &json!({ "provider": { "model": model } }));
    }
    if let Some(dir) = get("CTFPILOT_SANDBOX_DIR") {
        deep_merge(&mut root, &json!({ "sandbox": { "working_dir": dir } }));
    }
    if let Some(v) = get("CTFPILOT_TOOL_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "sandbox": { "timeout_secs": v } }));
    }
    if let Some(v) = get("CTFPILOT_INSTALL_PACKAGES").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "sandbox": { "install_packages": v } }));
    }
    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
