use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tracing::Instrument;
use uuid::Uuid;

use ctfpilot_orchestrator::{AutopilotEvent, PhaseReducer, RunOutcome, RunSnapshot};
use ctfpilot_types::{Challenge, Phase};

use crate::driver::{now_ms, RunDriver, RunSetup};
use crate::{
    AutopilotConfig, Collaborators, EventBus, FlagDetector, NoopObserver, RunControl, RunObserver,
};

/// Host-side handle to one run.
#[derive(Clone, Debug)]
pub struct RunHandle {
    run_id: String,
    control: RunControl,
    snapshots: watch::Receiver<RunSnapshot>,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Latest published state, with the live pause switch applied.
    pub fn snapshot(&self) -> RunSnapshot {
        let mut snapshot = self.snapshots.borrow().clone();
        if !snapshot.phase.is_terminal() {
            snapshot.paused = self.control.is_paused();
        }
        snapshot
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub async fn wait(&self) -> RunOutcome {
        let mut rx = self.outcome.clone();
        let ready = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .ok()
            .and_then(|outcome| (*outcome).clone());
        ready.unwrap_or_else(|| {
            let snapshot = self.snapshot();
            RunOutcome {
                run_id: self.run_id.clone(),
                phase: Phase::Failed,
                success: false,
                flags: Vec::new(),
                attempts: snapshot.attempts,
                category: snapshot.category,
                message: "run task ended without reporting an outcome".to_string(),
            }
        })
    }
}

/// Phase controller facade. Owns at most one live run; starting another
/// cancels and discards the previous one.
pub struct Autopilot {
    collaborators: Collaborators,
    config: AutopilotConfig,
    observer: Arc<dyn RunObserver>,
    events: EventBus,
    current: Mutex<Option<RunHandle>>,
}

impl Autopilot {
    pub fn new(
        collaborators: Collaborators,
        config: AutopilotConfig,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self {
            collaborators,
            config,
            observer,
            events: EventBus::new(),
            current: Mutex::new(None),
        }
    }

    pub fn without_observer(collaborators: Collaborators, config: AutopilotConfig) -> Self {
        Self::new(collaborators, config, Arc::new(NoopObserver))
    }

    pub fn config(&self) -> &AutopilotConfig {
        &self.config
    }

    /// Validates inputs and spawns the run task. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self, challenge: Challenge) -> anyhow::Result<RunHandle> {
        self.config.validate()?;
        let detector = FlagDetector::from_optional(challenge.flag_pattern.as_deref())?;

        if let Some(previous) = self.current().take() {
            if !previous.is_finished() {
                tracing::info!(run_id = %previous.run_id(), "cancelling previous run");
                previous.cancel();
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let control = RunControl::new();
        let mut initial = RunSnapshot::idle();
        initial.run_id = Some(run_id.clone());
        initial.max_attempts = self.config.max_attempts;
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let snapshot_tx = Arc::new(snapshot_tx);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let driver = RunDriver::new(RunSetup {
            run_id: run_id.clone(),
            challenge,
            config: self.config.clone(),
            collaborators: self.collaborators.clone(),
            control: control.clone(),
            detector,
            observer: self.observer.clone(),
            events: self.events.clone(),
            snapshots: snapshot_tx.clone(),
        });
        let span = tracing::info_span!("autopilot_run", run_id = %run_id);
        let worker = tokio::spawn(driver.run().instrument(span));

        let supervisor = Supervisor {
            run_id: run_id.clone(),
            observer: self.observer.clone(),
            events: self.events.clone(),
            snapshots: snapshot_tx,
        };
        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(err) => supervisor.recover(err),
            };
            outcome_tx.send_replace(Some(outcome));
        });

        let handle = RunHandle {
            run_id,
            control,
            snapshots: snapshot_rx,
            outcome: outcome_rx,
        };
        *self.current() = Some(handle.clone());
        Ok(handle)
    }

    pub fn handle(&self) -> Option<RunHandle> {
        self.current().clone()
    }

    pub fn pause(&self) -> bool {
        self.current().as_ref().is_some_and(RunHandle::pause)
    }

    pub fn resume(&self) -> bool {
        self.current().as_ref().is_some_and(RunHandle::resume)
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.current().as_ref() {
            handle.cancel();
        }
    }

    /// Cancels any live run and forgets it.
    pub fn reset(&self) {
        if let Some(handle) = self.current().take() {
            handle.cancel();
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.current()
            .as_ref()
            .map(RunHandle::snapshot)
            .unwrap_or_else(RunSnapshot::idle)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutopilotEvent> {
        self.events.subscribe()
    }

    /// Outcome of the current run, if there is one.
    pub async fn wait(&self) -> Option<RunOutcome> {
        let handle = self.handle()?;
        Some(handle.wait().await)
    }

    fn current(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reports a run whose task died without finishing.
struct Supervisor {
    run_id: String,
    observer: Arc<dyn RunObserver>,
    events: EventBus,
    snapshots: Arc<watch::Sender<RunSnapshot>>,
}

impl Supervisor {
    fn recover(&self, err: tokio::task::JoinError) -> RunOutcome {
        let message = if err.is_panic() {
            "run task panicked".to_string()
        } else {
            format!("run task aborted: {err}")
        };
        tracing::error!(run_id = %self.run_id, error = %message, "autopilot run lost");
        self.snapshots.send_modify(|snapshot| {
            snapshot.phase = Phase::Failed;
            snapshot.progress = PhaseReducer::progress(Phase::Failed, 0, 0);
            snapshot.paused = false;
            snapshot.message = message.clone();
            snapshot.error = Some(message.clone());
            snapshot.updated_at_ms = now_ms();
        });
        self.observer.on_complete(&self.run_id, false, &[]);
        self.events.publish(AutopilotEvent::RunFailed {
            run_id: self.run_id.clone(),
            error: message.clone(),
        });
        let snapshot = self.snapshots.borrow().clone();
        RunOutcome {
            run_id: self.run_id.clone(),
            phase: Phase::Failed,
            success: false,
            flags: Vec::new(),
            attempts: snapshot.attempts,
            category: snapshot.category,
            message,
        }
    }
}
