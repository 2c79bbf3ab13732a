#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};

use ctfpilot_core::{Autopilot, AutopilotConfig, Collaborators, RunControl, RunObserver};
use ctfpilot_orchestrator::AutopilotEvent;
use ctfpilot_providers::{AnalysisRequest, CategoryClassifier, SuggestionProvider};
use ctfpilot_tools::{CommandExecutor, ScriptRunner};
use ctfpilot_types::{
    format_command, AiInsight, CategoryGuess, CommandOutput, NextCommand, ScriptOutput,
};

/// Answers by substring match on the rendered command line.
#[derive(Default)]
pub struct ScriptedExecutor {
    responses: Vec<(String, CommandOutput)>,
    calls: Mutex<Vec<String>>,
    gate: Mutex<Option<String>>,
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, needle: &str, stdout: &str) -> Self {
        self.respond_output(
            needle,
            CommandOutput {
                stdout: stdout.to_string(),
                ..CommandOutput::default()
            },
        )
    }

    pub fn respond_output(mut self, needle: &str, output: CommandOutput) -> Self {
        self.responses.push((needle.to_string(), output));
        self
    }

    /// The first matching command signals `entered` and waits for `release`.
    pub fn block_once_on(self, needle: &str) -> Self {
        *self.gate.lock().unwrap() = Some(needle.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, tool: &str, args: &[String]) -> anyhow::Result<CommandOutput> {
        let line = format_command(tool, args);
        self.calls.lock().unwrap().push(line.clone());
        let block = {
            let mut gate = self.gate.lock().unwrap();
            if gate.as_deref().is_some_and(|needle| line.contains(needle)) {
                gate.take();
                true
            } else {
                false
            }
        };
        if block {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(self
            .responses
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

pub struct ScriptedClassifier {
    answer: Option<CategoryGuess>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn answering(category: &str, confidence: f64) -> Self {
        Self {
            answer: Some(CategoryGuess {
                category: category.to_string(),
                confidence,
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CategoryClassifier for ScriptedClassifier {
    async fn detect_category(
        &self,
        _files: &[String],
        _file_outputs: &HashMap<String, String>,
        _strings_outputs: &HashMap<String, String>,
    ) -> anyhow::Result<CategoryGuess> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.answer {
            Some(guess) => Ok(guess.clone()),
            None => anyhow::bail!("classifier offline"),
        }
    }
}

type Responder = dyn Fn(&AnalysisRequest) -> anyhow::Result<AiInsight> + Send + Sync;

pub struct ScriptedAnalyst {
    responder: Box<Responder>,
    requests: Mutex<Vec<AnalysisRequest>>,
    control: Mutex<Option<RunControl>>,
    pause_at: Option<u32>,
    hold_at: Option<u32>,
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedAnalyst {
    pub fn new(
        responder: impl Fn(&AnalysisRequest) -> anyhow::Result<AiInsight> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            control: Mutex::new(None),
            pause_at: None,
            hold_at: None,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn failing() -> Self {
        Self::new(|_| anyhow::bail!("model endpoint unreachable"))
    }

    /// Pauses the attached run from inside the given attempt.
    pub fn pausing_at(mut self, attempt: u32) -> Self {
        self.pause_at = Some(attempt);
        self
    }

    /// The given attempt signals `entered` and waits for `release` before
    /// answering.
    pub fn holding_at(mut self, attempt: u32) -> Self {
        self.hold_at = Some(attempt);
        self
    }

    pub fn attach(&self, control: RunControl) {
        *self.control.lock().unwrap() = Some(control);
    }

    pub fn attempts_seen(&self) -> Vec<u32> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.attempt_number)
            .collect()
    }

    pub fn requests(&self) -> Vec<AnalysisRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SuggestionProvider for ScriptedAnalyst {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AiInsight> {
        self.requests.lock().unwrap().push(request.clone());
        if self.pause_at == Some(request.attempt_number) {
            if let Some(control) = self.control.lock().unwrap().as_ref() {
                control.pause();
            }
        }
        if self.hold_at == Some(request.attempt_number) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        (self.responder)(request)
    }
}

#[derive(Debug, Clone)]
pub struct ScriptCall {
    pub script: String,
    pub packages: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Default)]
pub struct RecordingRunner {
    output: ScriptOutput,
    calls: Mutex<Vec<ScriptCall>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn printing(stdout: &str, stderr: &str) -> Self {
        Self {
            output: ScriptOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code: 0,
            },
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ScriptCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptRunner for RecordingRunner {
    async fn run(
        &self,
        script: &str,
        packages: &[String],
        timeout_secs: u64,
    ) -> anyhow::Result<ScriptOutput> {
        self.calls.lock().unwrap().push(ScriptCall {
            script: script.to_string(),
            packages: packages.to_vec(),
            timeout_secs,
        });
        Ok(self.output.clone())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub found: Mutex<Vec<String>>,
    pub completed: Mutex<Vec<(bool, Vec<String>)>>,
    pub cancelled: Mutex<Vec<Vec<String>>>,
}

impl RunObserver for RecordingObserver {
    fn on_flag_found(&self, _run_id: &str, flag: &str) {
        self.found.lock().unwrap().push(flag.to_string());
    }

    fn on_complete(&self, _run_id: &str, success: bool, flags: &[String]) {
        self.completed
            .lock()
            .unwrap()
            .push((success, flags.to_vec()));
    }

    fn on_cancelled(&self, _run_id: &str, flags: &[String]) {
        self.cancelled.lock().unwrap().push(flags.to_vec());
    }
}

pub struct Harness {
    pub autopilot: Autopilot,
    pub executor: Arc<ScriptedExecutor>,
    pub classifier: Arc<ScriptedClassifier>,
    pub analyst: Arc<ScriptedAnalyst>,
    pub runner: Arc<RecordingRunner>,
    pub observer: Arc<RecordingObserver>,
}

pub fn harness(
    executor: ScriptedExecutor,
    classifier: ScriptedClassifier,
    analyst: ScriptedAnalyst,
    runner: RecordingRunner,
    config: AutopilotConfig,
) -> Harness {
    let executor = Arc::new(executor);
    let classifier = Arc::new(classifier);
    let analyst = Arc::new(analyst);
    let runner = Arc::new(runner);
    let observer = Arc::new(RecordingObserver::default());
    let collaborators = Collaborators {
        executor: executor.clone(),
        classifier: classifier.clone(),
        analyst: analyst.clone(),
        script_runner: runner.clone(),
    };
    Harness {
        autopilot: Autopilot::new(collaborators, config, observer.clone()),
        executor,
        classifier,
        analyst,
        runner,
        observer,
    }
}

pub fn fast_config(max_attempts: u32) -> AutopilotConfig {
    AutopilotConfig {
        max_attempts,
        iteration_delay_ms: 0,
        ..AutopilotConfig::default()
    }
}

pub fn command(tool: &str, args: &[&str]) -> NextCommand {
    NextCommand {
        tool: tool.to_string(),
        args: args.iter().map(|arg| arg.to_string()).collect(),
        reason: format!("try {tool}"),
    }
}

pub fn insight_with(commands: Vec<NextCommand>) -> AiInsight {
    AiInsight {
        analysis: "keep digging".to_string(),
        next_commands: commands,
        ..AiInsight::default()
    }
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

pub async fn next_matching(
    rx: &mut broadcast::Receiver<AutopilotEvent>,
    predicate: impl Fn(&AutopilotEvent) -> bool,
) -> AutopilotEvent {
    within(async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
}
