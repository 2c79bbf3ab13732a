use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_SUFFIX: &str = "jsonl";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
        }
    }

    /// Daily files are named `ctfpilot.<process>.YYYY-MM-DD.jsonl`.
    fn file_prefix(self) -> String {
        format!("ctfpilot.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Structured record of one run milestone. Fields left `None` are logged empty
/// so every line in the JSONL file carries the same keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub run_id: Option<&'a str>,
    pub phase: Option<&'a str>,
    pub attempt: Option<u32>,
    pub tool: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Replaces free text (challenge descriptions, model output) with its length
/// and a hash, so logs can correlate runs without leaking content.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

macro_rules! run_event {
    ($macro:ident, $process:expr, $event:expr) => {
        tracing::$macro!(
            target: "ctfpilot.obs",
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            run_id = $event.run_id.unwrap_or(""),
            phase = $event.phase.unwrap_or(""),
            attempt = $event.attempt.map(i64::from).unwrap_or(-1),
            tool = $event.tool.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    if level == Level::ERROR {
        run_event!(error, process, event);
    } else if level == Level::WARN {
        run_event!(warn, process, event);
    } else if level == Level::INFO {
        run_event!(info, process, event);
    } else {
        run_event!(debug, process, event);
    }
}

/// Installs the console layer (stderr) and a daily JSONL file layer, after
/// pruning this process's files older than `retention_days`.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let prefix = process.file_prefix();
    let removed = prune_expired_logs(logs_dir, &prefix, retention_days, Utc::now())?;

    let (writer, guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::Builder::new()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix(&prefix)
            .filename_suffix(LOG_SUFFIX)
            .build(logs_dir)?,
    );

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // stdout is reserved for the flag report and --json output.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    if removed > 0 {
        tracing::debug!(target: "ctfpilot.obs", removed, "pruned expired log files");
    }

    Ok((
        guard,
        LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.display().to_string(),
            prefix,
            retention_days,
            initialized_at: Utc::now(),
        },
    ))
}

/// Date stamped into `<prefix>.YYYY-MM-DD.jsonl`, or `None` for any other name.
fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let stamp = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(LOG_SUFFIX)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

fn prune_expired_logs(
    logs_dir: &Path,
    prefix: &str,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = (now - chrono::Duration::days(retention_days as i64)).date_naive();
    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| log_file_date(name, prefix))
            .is_some_and(|date| date < cutoff);
        if expired && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
