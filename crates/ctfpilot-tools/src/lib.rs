use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use ctfpilot_types::{CommandOutput, ScriptOutput};

/// Issues one tool invocation. Allow-listing and isolation belong to the
/// implementation, never to the caller.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, tool: &str, args: &[String]) -> anyhow::Result<CommandOutput>;
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(
        &self,
        script: &str,
        packages: &[String],
        timeout_secs: u64,
    ) -> anyhow::Result<ScriptOutput>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    pub python: String,
    pub install_packages: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            timeout_secs: 60,
            max_output_bytes: 256 * 1024,
            python: "python3".to_string(),
            install_packages: false,
        }
    }
}

pub const ALLOWED_TOOLS: &[&str] = &[
    // binaries
    "file", "strings", "readelf", "objdump", "nm", "size", "ldd", "checksec",
    // hex
    "xxd", "hexdump", "od",
    // encoding
    "base64", "base32", "openssl",
    // media and stego
    "exiftool", "identify", "steghide", "zsteg", "stegseek", "foremost", "binwalk",
    "pngcheck", "zbarimg", "sox", "ffprobe",
    // documents
    "pdfinfo", "pdftotext", "pdfimages",
    // network captures
    "tshark", "tcpdump",
    // archives
    "unzip", "zipinfo", "tar", "gzip", "gunzip", "bzip2", "xz", "7z", "cabextract",
    // text
    "head", "tail", "cat", "wc", "grep", "egrep", "awk", "sed", "cut", "sort", "uniq",
    "tr", "rev",
    // filesystem
    "ls", "stat", "find",
    // hashing
    "sha256sum", "sha1sum", "md5sum", "sha512sum", "cksum",
    // cracking
    "john", "hashcat", "name-that-hash", "fcrackzip",
    // memory and disk
    "volatility", "volatility3", "bulk_extractor",
    // reversing and exploitation
    "radare2", "r2", "rabin2", "rafind2", "rahash2", "retdec-decompiler", "ropper",
    "ROPgadget", "one_gadget", "patchelf", "gdb", "ltrace", "strace", "objcopy",
    // misc
    "jq", "xmllint", "dd", "split",
];

pub fn is_tool_allowed(tool: &str) -> bool {
    let name = tool_base_name(tool);
    !name.is_empty() && ALLOWED_TOOLS.iter().any(|allowed| *allowed == name)
}

fn tool_base_name(tool: &str) -> &str {
    Path::new(tool.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
}

/// Options that make an allowed tool run other programs or write files.
fn denied_options(tool: &str) -> &'static [&'static str] {
    match tool {
        "find" => &[
            "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprintf", "-fls",
        ],
        "gdb" => &[
            "-ex", "-x", "-iex", "-ix", "--command", "--eval-command", "--init-command",
        ],
        "tar" => &[
            "-I", "--to-command", "--use-compress-program", "--checkpoint-action",
            "--info-script",
        ],
        "sed" => &["-i", "--in-place"],
        _ => &[],
    }
}

/// First argument that turns `tool` into a process launcher or file writer.
/// Single-letter options also match with an attached value (`-i.bak`).
pub fn denied_option<'a>(tool: &str, args: &'a [String]) -> Option<&'a str> {
    let denied = denied_options(tool_base_name(tool));
    args.iter().map(String::as_str).find(|arg| {
        denied.iter().any(|opt| match arg.strip_prefix(opt) {
            Some("") => true,
            Some(rest) => rest.starts_with('=') || opt.len() == 2,
            None => false,
        })
    })
}

/// Commands never go through a shell, so metacharacters are inert. What must
/// not survive is a path escaping the working directory or a control byte,
/// whether it stands alone or sits after `key=` or `--option=`.
pub fn sanitize_arguments(args: &[String]) -> Vec<String> {
    args.iter()
        .filter_map(|arg| sanitize_argument(arg))
        .collect()
}

fn sanitize_argument(arg: &str) -> Option<String> {
    let cleaned = arg
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();

    if cleaned.starts_with('-') {
        let (name, value) = match cleaned.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (cleaned.as_str(), None),
        };
        let name = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect::<String>();
        if name.trim_start_matches('-').is_empty() && cleaned != "-" && cleaned != "--" {
            return None;
        }
        return match value {
            None => Some(name),
            Some(value) => confine_path(value).map(|value| format!("{name}={value}")),
        };
    }

    if let Some((key, value)) = cleaned.split_once('=') {
        if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return confine_path(value).map(|value| format!("{key}={value}"));
        }
    }
    confine_path(&cleaned)
}

/// Reduces absolute paths and `..` traversals to their file name.
fn confine_path(value: &str) -> Option<String> {
    let path = Path::new(value);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    if !escapes {
        return Some(value.to_string());
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
}

pub fn truncate_output(raw: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(raw);
    if text.len() <= max_bytes {
        return text.into_owned();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated at {} bytes]", &text[..cut], max_bytes)
}

/// Runs allow-listed tools as local child processes.
pub struct LocalExecutor {
    config: SandboxConfig,
    allowed: HashSet<&'static str>,
}

impl LocalExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            allowed: ALLOWED_TOOLS.iter().copied().collect(),
        }
    }

    fn working_dir(&self) -> PathBuf {
        self.config
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, tool: &str, args: &[String]) -> anyhow::Result<CommandOutput> {
        let name = tool_base_name(tool);
        if !self.allowed.contains(name) {
            tracing::warn!(tool = %tool, "rejected tool outside allow-list");
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("Tool not allowed: {tool}"),
                exit_code: 1,
                error: Some("tool_not_allowed".to_string()),
            });
        }
        if let Some(option) = denied_option(name, args) {
            tracing::warn!(tool = %tool, option, "rejected option outside sandbox policy");
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("Option not allowed for {name}: {option}"),
                exit_code: 1,
                error: Some("option_not_allowed".to_string()),
            });
        }
        let safe_args = sanitize_arguments(args);
        let mut command = Command::new(name);
        command
            .args(&safe_args)
            .current_dir(self.working_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{name}`"))?;
        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!(
                "`{name}` timed out after {}s",
                self.config.timeout_secs.max(1)
            ),
        };
        Ok(CommandOutput {
            stdout: truncate_output(&output.stdout, self.config.max_output_bytes),
            stderr: truncate_output(&output.stderr, self.config.max_output_bytes),
            exit_code: output.status.code().unwrap_or(-1),
            error: None,
        })
    }
}

/// Runs generated python scripts from a temp file.
pub struct LocalScriptRunner {
    config: SandboxConfig,
}

impl LocalScriptRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    async fn install_packages(&self, packages: &[String], timeout: Duration) {
        if !self.config.install_packages || packages.is_empty() {
            return;
        }
        let mut command = Command::new(&self.config.python);
        command
            .args(["-m", "pip", "install", "--quiet", "--disable-pip-version-check"])
            .args(packages)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let result = match command.spawn() {
            Ok(child) => tokio::time::timeout(timeout, child.wait_with_output()).await,
            Err(err) => {
                tracing::warn!(error = %err, "pip unavailable; running script without installs");
                return;
            }
        };
        match result {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => tracing::warn!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "package install failed"
            ),
            Ok(Err(err)) => tracing::warn!(error = %err, "package install failed"),
            Err(_) => tracing::warn!("package install timed out"),
        }
    }
}

#[async_trait]
impl ScriptRunner for LocalScriptRunner {
    async fn run(
        &self,
        script: &str,
        packages: &[String],
        timeout_secs: u64,
    ) -> anyhow::Result<ScriptOutput> {
        let timeout = Duration::from_secs(timeout_secs.max(1));
        self.install_packages(packages, timeout).await;

        let file = tempfile::Builder::new()
            .prefix("ctfpilot-solve-")
            .suffix(".py")
            .tempfile()?;
        tokio::fs::write(file.path(), script).await?;

        let mut command = Command::new(&self.config.python);
        command
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.config.python))?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("solve script timed out after {}s", timeout_secs.max(1)),
        };
        Ok(ScriptOutput {
            stdout: truncate_output(&output.stdout, self.config.max_output_bytes),
            stderr: truncate_output(&output.stderr, self.config.max_output_bytes),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
