use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

use ctfpilot_core::{
    score_candidate, Autopilot, Collaborators, ConfigStore, FlagDetector, RunObserver,
    STRATEGIES,
};
use ctfpilot_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind,
};
use ctfpilot_orchestrator::{AutopilotEvent, RunOutcome};
use ctfpilot_types::{Challenge, Step, StepStatus, DEFAULT_FLAG_FORMAT};

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "ctfpilot-engine")]
#[command(about = "Autopilot for capture-the-flag challenges")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one autopilot session against a set of challenge files.
    Solve {
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value = DEFAULT_FLAG_FORMAT)]
        flag_format: String,
        #[arg(long)]
        flag_pattern: Option<String>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        provider_url: Option<String>,
        #[arg(long, env = "CTFPILOT_CONFIG")]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Scan files (or stdin) for flag-shaped strings.
    Scan {
        paths: Vec<PathBuf>,
        #[arg(long)]
        flag_pattern: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the per-category strategy table.
    Strategies {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Solve {
            files,
            description,
            title,
            flag_format,
            flag_pattern,
            max_attempts,
            api_key,
            model,
            provider_url,
            config,
            json,
        } => {
            let logs_dir = canonical_logs_dir_from_root(&resolve_state_dir());
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let (working_dir, names) = resolve_challenge_files(&files)?;
            let overrides =
                build_cli_overrides(max_attempts, api_key, model, provider_url, Some(working_dir))?;
            let store = ConfigStore::load(config.as_deref(), overrides).await?;
            if let Some(path) = store.path() {
                info!("loaded config from {}", path.display());
            }
            let engine_config = store.config()?;

            let mut challenge = Challenge::new(names, description).with_flag_format(flag_format);
            if let Some(title) = title {
                challenge = challenge.with_title(title);
            }
            if let Some(pattern) = flag_pattern {
                challenge = challenge.with_flag_pattern(pattern);
            }

            let collaborators = Collaborators::local(&engine_config)?;
            let autopilot = Autopilot::new(
                collaborators,
                engine_config.autopilot.clone(),
                Arc::new(ConsoleObserver { quiet: json }),
            );
            let outcome = solve(&autopilot, challenge, json).await?;
            Ok(if outcome.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Command::Scan {
            paths,
            flag_pattern,
            json,
        } => {
            let detector = FlagDetector::from_optional(flag_pattern.as_deref())?;
            let hits = scan_sources(&detector, &paths).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                for hit in &hits {
                    println!(
                        "{}\t{}",
                        hit["source"].as_str().unwrap_or("-"),
                        hit["flag"].as_str().unwrap_or("")
                    );
                }
            }
            Ok(if hits.is_empty() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Strategies { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&strategies_value())?);
            } else {
                for strategy in STRATEGIES.iter() {
                    println!("{} ({})", strategy.display_name, strategy.category);
                    println!("  {}", strategy.description);
                    println!("  phases:   {}", strategy.phases.join(" -> "));
                    println!("  tools:    {}", strategy.tools.join(", "));
                    if !strategy.packages.is_empty() {
                        println!("  packages: {}", strategy.packages.join(", "));
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn solve(
    autopilot: &Autopilot,
    challenge: Challenge,
    json: bool,
) -> anyhow::Result<RunOutcome> {
    // Subscribe before starting so the first phase events are not missed.
    let events = autopilot.subscribe();
    let printer = tokio::spawn(print_events(events, json));

    let handle = autopilot.start(challenge)?;
    info!(run_id = %handle.run_id(), "autopilot run started");

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    eprintln!("cancelling; waiting for the in-flight step to finish");
                    handle.cancel();
                }
                Err(err) => warn!("failed to listen for ctrl-c: {err}"),
            }
            handle.wait().await
        }
    };

    if tokio::time::timeout(Duration::from_secs(2), printer).await.is_err() {
        warn!("event printer did not drain in time");
    }

    let steps = handle.snapshot().steps;
    let ranked = rank_flags(&outcome.flags, &steps);
    if json {
        let report = json!({
            "outcome": outcome,
            "flags": ranked
                .iter()
                .map(|(flag, confidence)| json!({ "flag": flag, "confidence": confidence }))
                .collect::<Vec<_>>(),
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!("{}", outcome.message);
        println!(
            "phase: {}  attempts: {}  category: {}",
            outcome.phase,
            outcome.attempts,
            outcome
                .category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        for (flag, confidence) in &ranked {
            println!("  {flag}  (confidence {confidence:.2})");
        }
    }
    Ok(outcome)
}

async fn print_events(mut events: broadcast::Receiver<AutopilotEvent>, quiet: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event printer lagged by {skipped} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let terminal = matches!(
            event,
            AutopilotEvent::RunCompleted { .. }
                | AutopilotEvent::RunCancelled { .. }
                | AutopilotEvent::RunFailed { .. }
        );
        if !quiet {
            if let Some(line) = event_line(&event) {
                println!("{line}");
            }
        }
        if terminal {
            break;
        }
    }
}

fn event_line(event: &AutopilotEvent) -> Option<String> {
    match event {
        AutopilotEvent::PhaseChanged {
            message, progress, ..
        } => Some(format!("[{progress:>3}%] {message}")),
        AutopilotEvent::StepStarted { command, .. } => Some(format!("  $ {command}")),
        AutopilotEvent::StepFinished {
            status,
            duration_ms,
            ..
        } if *status != StepStatus::Success => {
            Some(format!("    {status:?} after {duration_ms}ms"))
        }
        AutopilotEvent::CategoryChanged {
            category,
            confidence,
            rule_based,
            ..
        } => Some(format!(
            "  category {category} ({confidence:.2}{})",
            if *rule_based { ", keyword fallback" } else { "" }
        )),
        AutopilotEvent::AnalysisFailed { attempt, error, .. } => {
            Some(format!("  analysis failed on attempt {attempt}: {error}"))
        }
        AutopilotEvent::Paused { attempts, .. } => {
            Some(format!("  paused after {attempts} attempts"))
        }
        AutopilotEvent::Resumed { .. } => Some("  resumed".to_string()),
        AutopilotEvent::RunFailed { error, .. } => Some(format!("run failed: {error}")),
        _ => None,
    }
}

/// Orders flags by how flag-like they look in the output that produced them.
fn rank_flags(flags: &[String], steps: &[Arc<Step>]) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = flags
        .iter()
        .map(|flag| {
            let source = steps
                .iter()
                .find(|step| step.flags_found.iter().any(|found| found == flag));
            let confidence = match source {
                Some(step) => {
                    let tool = if step.generated_script {
                        "python3"
                    } else {
                        step.command.split_whitespace().next().unwrap_or("")
                    };
                    score_candidate(flag, tool, &step.stdout)
                }
                None => score_candidate(flag, "", ""),
            };
            (flag.clone(), confidence)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

struct ConsoleObserver {
    quiet: bool,
}

impl RunObserver for ConsoleObserver {
    fn on_flag_found(&self, _run_id: &str, flag: &str) {
        if !self.quiet {
            println!(">>> flag: {flag}");
        }
    }

    fn on_cancelled(&self, run_id: &str, flags: &[String]) {
        info!(run_id, flags = flags.len(), "run cancelled by operator");
    }
}

/// Tools run inside one directory and only see bare file names, so every
/// challenge file must share a parent.
fn resolve_challenge_files(files: &[PathBuf]) -> anyhow::Result<(PathBuf, Vec<String>)> {
    let mut working_dir: Option<PathBuf> = None;
    let mut names = Vec::with_capacity(files.len());
    for file in files {
        let absolute = std::fs::canonicalize(file)
            .with_context(|| format!("challenge file not found: {}", file.display()))?;
        if !absolute.is_file() {
            anyhow::bail!("not a regular file: {}", file.display());
        }
        let parent = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        match &working_dir {
            Some(dir) if *dir != parent => anyhow::bail!(
                "challenge files must share one directory (found {} and {})",
                dir.display(),
                parent.display()
            ),
            Some(_) => {}
            None => working_dir = Some(parent),
        }
        let name = absolute
            .file_name()
            .and_then(|n| n.to_str())
            .context("challenge file name is not valid UTF-8")?;
        names.push(name.to_string());
    }
    let working_dir = working_dir.context("at least one --file is required")?;
    Ok((working_dir, names))
}

fn build_cli_overrides(
    max_attempts: Option<u32>,
    api_key: Option<String>,
    model: Option<String>,
    provider_url: Option<String>,
    working_dir: Option<PathBuf>,
) -> anyhow::Result<Option<Value>> {
    if max_attempts == Some(0) {
        anyhow::bail!("--max-attempts must be at least 1");
    }
    let mut root = Map::new();

    if let Some(max) = max_attempts {
        root.insert("autopilot".to_string(), json!({ "max_attempts": max }));
    }

    let mut provider = Map::new();
    if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
        provider.insert("api_key".to_string(), Value::String(key));
    }
    if let Some(model) = model {
        provider.insert("model".to_string(), Value::String(model));
    }
    if let Some(url) = provider_url {
        provider.insert("url".to_string(), Value::String(url));
    }
    if !provider.is_empty() {
        root.insert("provider".to_string(), Value::Object(provider));
    }

    if let Some(dir) = working_dir {
        root.insert(
            "sandbox".to_string(),
            json!({ "working_dir": dir.display().to_string() }),
        );
    }

    if root.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Object(root)))
}

fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CTFPILOT_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("ctfpilot"))
        .unwrap_or_else(|| PathBuf::from(".ctfpilot"))
}

async fn scan_sources(detector: &FlagDetector, paths: &[PathBuf]) -> anyhow::Result<Vec<Value>> {
    let mut hits = Vec::new();
    if paths.is_empty() {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        collect_hits(detector, "-", &buf, &mut hits);
        return Ok(hits);
    }
    for path in paths {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let text = String::from_utf8_lossy(&raw);
        collect_hits(detector, &path.display().to_string(), &text, &mut hits);
    }
    Ok(hits)
}

fn collect_hits(detector: &FlagDetector, source: &str, text: &str, hits: &mut Vec<Value>) {
    for flag in detector.detect(text) {
        let confidence = score_candidate(&flag, "cat", text);
        hits.push(json!({ "source": source, "flag": flag, "confidence": confidence }));
    }
}

fn strategies_value() -> Value {
    Value::Array(
        STRATEGIES
            .iter()
            .map(|strategy| {
                json!({
                    "category": strategy.category,
                    "display_name": strategy.display_name,
                    "description": strategy.description,
                    "phases": strategy.phases,
                    "tools": strategy.tools,
                    "packages": strategy.packages,
                })
            })
            .collect(),
    )
}
