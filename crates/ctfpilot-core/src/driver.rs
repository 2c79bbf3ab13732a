use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::Level;

use ctfpilot_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use ctfpilot_orchestrator::{
    AutopilotEvent, PhaseReducer, PhaseSignal, PhaseTransitionError, RunOutcome, RunSnapshot,
};
use ctfpilot_types::{
    format_command, Category, Challenge, CommandOutput, HistoryEntry, Phase, Step, StepStatus,
};

use crate::{
    analysis, classify, recon, synthesis, AutopilotConfig, Collaborators, EventBus,
    FlagAggregator, FlagDetector, HistoryBuffer, RunControl, RunObserver,
};

/// Everything a run task needs, assembled by the controller.
pub(crate) struct RunSetup {
    pub run_id: String,
    pub challenge: Challenge,
    pub config: AutopilotConfig,
    pub collaborators: Collaborators,
    pub control: RunControl,
    pub detector: FlagDetector,
    pub observer: Arc<dyn RunObserver>,
    pub events: EventBus,
    pub snapshots: Arc<watch::Sender<RunSnapshot>>,
}

/// Sole owner of one run's mutable state. Lives on a single task; the host
/// only sees snapshots, events and observer callbacks.
pub(crate) struct RunDriver {
    pub run_id: String,
    pub challenge: Challenge,
    pub config: AutopilotConfig,
    pub collaborators: Collaborators,
    pub control: RunControl,
    pub detector: FlagDetector,
    pub history: HistoryBuffer,
    pub flags: FlagAggregator,
    pub phase: Phase,
    pub message: String,
    pub attempts: u32,
    pub category: Option<Category>,
    pub confidence: f64,
    pub steps: Vec<Arc<Step>>,
    pub last_analysis: String,
    pub error: Option<String>,
    observer: Arc<dyn RunObserver>,
    events: EventBus,
    snapshots: Arc<watch::Sender<RunSnapshot>>,
}

impl RunDriver {
    pub fn new(setup: RunSetup) -> Self {
        Self {
            history: HistoryBuffer::new(setup.config.history_capacity),
            flags: FlagAggregator::new(setup.run_id.clone(), setup.observer.clone()),
            run_id: setup.run_id,
            challenge: setup.challenge,
            config: setup.config,
            collaborators: setup.collaborators,
            control: setup.control,
            detector: setup.detector,
            phase: Phase::Idle,
            message: PhaseReducer::message(Phase::Idle).to_string(),
            attempts: 0,
            category: None,
            confidence: 0.0,
            steps: Vec::new(),
            last_analysis: String::new(),
            error: None,
            observer: setup.observer,
            events: setup.events,
            snapshots: setup.snapshots,
        }
    }

    pub async fn run(mut self) -> RunOutcome {
        self.events.publish(AutopilotEvent::RunStarted {
            run_id: self.run_id.clone(),
            files: self.challenge.files.len(),
            max_attempts: self.config.max_attempts,
        });
        tracing::info!(
            files = self.challenge.files.len(),
            max_attempts = self.config.max_attempts,
            description = %redact_text(&self.challenge.description),
            "autopilot run started"
        );
        if let Err(err) = self.drive().await {
            self.fail(err);
        }
        self.finish()
    }

    async fn drive(&mut self) -> anyhow::Result<()> {
        self.transition(PhaseSignal::Start)?;
        if !self.checkpoint().await {
            return self.stop_cancelled();
        }

        let findings = recon::reconnoitre(self).await;
        if self.control.is_cancelled() {
            return self.stop_cancelled();
        }
        let found = self.flags.has_any();
        self.transition(PhaseSignal::ReconFinished { flags_found: found })?;
        if found {
            return Ok(());
        }

        if !self.checkpoint().await {
            return self.stop_cancelled();
        }
        classify::detect(self, &findings).await;
        self.transition(PhaseSignal::CategoryDetected)?;

        if !self.checkpoint().await {
            return self.stop_cancelled();
        }
        let exit = analysis::run_loop(self).await;
        tracing::info!(?exit, attempts = self.attempts, "analysis loop finished");
        if self.control.is_cancelled() {
            return self.stop_cancelled();
        }
        let found = self.flags.has_any();
        self.transition(PhaseSignal::AnalysisFinished { flags_found: found })?;
        if found {
            return Ok(());
        }

        if !self.checkpoint().await {
            return self.stop_cancelled();
        }
        let (script, strategy) = synthesis::build_script(self);
        self.transition(PhaseSignal::ScriptGenerated)?;
        if !self.checkpoint().await {
            return self.stop_cancelled();
        }
        synthesis::execute(self, script, strategy).await;
        self.transition(PhaseSignal::ScriptExecuted)?;
        Ok(())
    }

    fn stop_cancelled(&mut self) -> anyhow::Result<()> {
        self.transition(PhaseSignal::CancelObserved)?;
        Ok(())
    }

    pub fn transition(&mut self, signal: PhaseSignal) -> Result<(), PhaseTransitionError> {
        let next = PhaseReducer::reduce(self.phase, signal)?;
        tracing::debug!(from = %self.phase, to = %next, "phase transition");
        self.phase = next;
        self.message = PhaseReducer::message(next).to_string();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "phase.changed",
                component: "autopilot",
                run_id: Some(&self.run_id),
                phase: Some(next.as_str()),
                attempt: Some(self.attempts),
                ..Default::default()
            },
        );
        self.events.publish(AutopilotEvent::PhaseChanged {
            run_id: self.run_id.clone(),
            phase: next,
            message: self.message.clone(),
            progress: self.progress(),
        });
        self.publish_snapshot();
        Ok(())
    }

    /// Pause gate plus cancel check. Returns false once the run is cancelled.
    pub async fn checkpoint(&mut self) -> bool {
        if self.control.is_cancelled() {
            return false;
        }
        if self.control.is_paused() {
            tracing::info!(attempts = self.attempts, "run paused");
            self.events.publish(AutopilotEvent::Paused {
                run_id: self.run_id.clone(),
                attempts: self.attempts,
            });
            self.publish_snapshot();
            if !self.control.wait_if_paused().await {
                return false;
            }
            tracing::info!(attempts = self.attempts, "run resumed");
            self.events.publish(AutopilotEvent::Resumed {
                run_id: self.run_id.clone(),
                attempts: self.attempts,
            });
            self.publish_snapshot();
        }
        !self.control.is_cancelled()
    }

    /// Runs one tool command to completion. Collaborator errors become a
    /// failed step rather than an error.
    pub async fn dispatch_command(
        &mut self,
        tool: &str,
        args: &[String],
        rationale: &str,
    ) -> CommandOutput {
        let index = self.begin_step(Step::new(
            self.phase,
            format_command(tool, args),
            rationale,
        ));
        let executor = self.collaborators.executor.clone();
        let started = Instant::now();
        let output = match executor.execute(tool, args).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(tool, error = %err, "command dispatch failed");
                CommandOutput {
                    stdout: String::new(),
                    stderr: err.to_string(),
                    exit_code: -1,
                    error: Some(format!("{err:#}")),
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut flags = self.detector.detect(&output.stdout);
        for flag in self.detector.detect(&output.stderr) {
            if !flags.contains(&flag) {
                flags.push(flag);
            }
        }
        self.history.push(HistoryEntry {
            tool: tool.to_string(),
            args: args.to_vec(),
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            exit_code: output.exit_code,
        });
        let (status, level, label) = if output.succeeded() {
            (StepStatus::Success, Level::DEBUG, "success")
        } else {
            (StepStatus::Failed, Level::WARN, "failed")
        };
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "command.finished",
                component: "autopilot",
                run_id: Some(&self.run_id),
                phase: Some(self.phase.as_str()),
                attempt: Some(self.attempts),
                tool: Some(tool),
                status: Some(label),
                error_code: output.error.as_deref(),
                ..Default::default()
            },
        );
        self.finish_step(
            index,
            status,
            &output.stdout,
            &output.stderr,
            Some(output.exit_code),
            duration_ms,
            &flags,
        );
        output
    }

    /// Hands the solve script to the runner. Only stdout is searched for flags.
    pub async fn dispatch_script(
        &mut self,
        script: String,
        packages: Vec<String>,
        timeout_secs: u64,
        rationale: &str,
    ) -> Vec<String> {
        let step =
            Step::new(self.phase, "python3 solve.py", rationale).with_script(script.clone());
        let index = self.begin_step(step);
        let runner = self.collaborators.script_runner.clone();
        let started = Instant::now();
        let (stdout, stderr, exit_code) = match runner.run(&script, &packages, timeout_secs).await {
            Ok(output) => (output.stdout, output.stderr, output.exit_code),
            Err(err) => {
                tracing::warn!(error = %err, "solve script failed to run");
                (String::new(), format!("{err:#}"), -1)
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let flags = self.detector.detect(&stdout);
        self.history.push(HistoryEntry {
            tool: "python3".to_string(),
            args: vec!["solve.py".to_string()],
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            exit_code,
        });
        let status = if exit_code == 0 {
            StepStatus::Success
        } else {
            StepStatus::Failed
        };
        self.finish_step(
            index,
            status,
            &stdout,
            &stderr,
            Some(exit_code),
            duration_ms,
            &flags,
        );
        flags
    }

    /// Logs a command that was planned but never dispatched.
    pub fn skip_command(&mut self, tool: &str, args: &[String], rationale: &str) {
        let index = self.begin_step(Step::new(
            self.phase,
            format_command(tool, args),
            rationale,
        ));
        self.finish_step(index, StepStatus::Skipped, "", "", None, 0, &[]);
    }

    fn begin_step(&mut self, mut step: Step) -> usize {
        step.status = StepStatus::Running;
        self.events.publish(AutopilotEvent::StepStarted {
            run_id: self.run_id.clone(),
            step_id: step.id.clone(),
            phase: step.phase,
            command: step.command.clone(),
        });
        self.steps.push(Arc::new(step));
        self.publish_snapshot();
        self.steps.len() - 1
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_step(
        &mut self,
        index: usize,
        status: StepStatus,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i32>,
        duration_ms: u64,
        flags: &[String],
    ) {
        let Some(slot) = self.steps.get_mut(index) else {
            return;
        };
        // Snapshots may still hold the running step; only that one is copied.
        let step = Arc::make_mut(slot);
        step.status = status;
        step.stdout = stdout.to_string();
        step.stderr = stderr.to_string();
        step.exit_code = exit_code;
        step.duration_ms = duration_ms;
        step.flags_found = flags.to_vec();
        let step_id = step.id.clone();

        self.record_flags(flags);
        self.events.publish(AutopilotEvent::StepFinished {
            run_id: self.run_id.clone(),
            step_id,
            status,
            duration_ms,
            flags: flags.to_vec(),
        });
        self.publish_snapshot();
    }

    /// Adds candidates to the run's flag set and announces the new ones.
    pub fn record_flags(&mut self, candidates: &[String]) -> Vec<String> {
        let fresh = self.flags.record(candidates);
        for flag in &fresh {
            tracing::info!(flag = %flag, "flag recorded");
            self.events.publish(AutopilotEvent::FlagFound {
                run_id: self.run_id.clone(),
                flag: flag.clone(),
            });
        }
        fresh
    }

    pub fn set_category(&mut self, category: Category, confidence: f64, rule_based: bool) {
        self.category = Some(category);
        self.confidence = confidence;
        tracing::info!(%category, confidence, rule_based, "category set");
        self.events.publish(AutopilotEvent::CategoryChanged {
            run_id: self.run_id.clone(),
            category,
            confidence,
            rule_based,
        });
        self.publish_snapshot();
    }

    pub fn analysis_failed(&mut self, attempt: u32, error: &anyhow::Error) {
        tracing::warn!(attempt, error = %error, "analysis request failed");
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "analysis.failed",
                component: "autopilot",
                run_id: Some(&self.run_id),
                phase: Some(self.phase.as_str()),
                attempt: Some(attempt),
                detail: Some(&error.to_string()),
                ..Default::default()
            },
        );
        self.events.publish(AutopilotEvent::AnalysisFailed {
            run_id: self.run_id.clone(),
            attempt,
            error: format!("{error:#}"),
        });
    }

    pub fn progress(&self) -> u8 {
        PhaseReducer::progress(self.phase, self.attempts, self.config.max_attempts)
    }

    pub fn publish_snapshot(&self) {
        self.snapshots.send_replace(RunSnapshot {
            run_id: Some(self.run_id.clone()),
            phase: self.phase,
            message: self.message.clone(),
            progress: self.progress(),
            attempts: self.attempts,
            max_attempts: self.config.max_attempts,
            paused: self.control.is_paused() && !self.phase.is_terminal(),
            category: self.category,
            confidence: self.confidence,
            flags: self.flags.flags().to_vec(),
            steps: self.steps.clone(),
            error: self.error.clone(),
            updated_at_ms: now_ms(),
        });
    }

    fn fail(&mut self, err: anyhow::Error) {
        let detail = format!("{err:#}");
        tracing::error!(error = %detail, phase = %self.phase, "autopilot run failed");
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.failed",
                component: "autopilot",
                run_id: Some(&self.run_id),
                phase: Some(self.phase.as_str()),
                detail: Some(&detail),
                ..Default::default()
            },
        );
        self.phase = PhaseReducer::reduce(self.phase, PhaseSignal::Fault).unwrap_or(Phase::Failed);
        self.message = detail.clone();
        self.error = Some(detail);
        self.events.publish(AutopilotEvent::PhaseChanged {
            run_id: self.run_id.clone(),
            phase: self.phase,
            message: self.message.clone(),
            progress: self.progress(),
        });
    }

    fn finish(mut self) -> RunOutcome {
        if !self.phase.is_terminal() {
            let phase = self.phase;
            self.fail(anyhow::anyhow!("run stopped in non-terminal phase `{phase}`"));
        }
        let flags = self.flags.flags().to_vec();
        let outcome = match self.phase {
            Phase::Cancelled => {
                self.observer.on_cancelled(&self.run_id, &flags);
                self.events.publish(AutopilotEvent::RunCancelled {
                    run_id: self.run_id.clone(),
                    attempts: self.attempts,
                });
                self.outcome(false, flags)
            }
            Phase::Failed => {
                self.observer.on_complete(&self.run_id, false, &[]);
                self.events.publish(AutopilotEvent::RunFailed {
                    run_id: self.run_id.clone(),
                    error: self.message.clone(),
                });
                self.outcome(false, Vec::new())
            }
            _ => {
                let success = !flags.is_empty();
                self.message = if success {
                    format!("Run completed: {} flag(s) found", flags.len())
                } else {
                    "Run completed without finding a flag".to_string()
                };
                self.observer.on_complete(&self.run_id, success, &flags);
                self.events.publish(AutopilotEvent::RunCompleted {
                    run_id: self.run_id.clone(),
                    success,
                    flags: flags.clone(),
                });
                self.outcome(success, flags)
            }
        };
        self.publish_snapshot();
        tracing::info!(
            phase = %outcome.phase,
            success = outcome.success,
            attempts = outcome.attempts,
            flags = outcome.flags.len(),
            "autopilot run finished"
        );
        outcome
    }

    fn outcome(&self, success: bool, flags: Vec<String>) -> RunOutcome {
        RunOutcome {
            run_id: self.run_id.clone(),
            phase: self.phase,
            success,
            flags,
            attempts: self.attempts,
            category: self.category,
            message: self.message.clone(),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
