use std::sync::Arc;

use ctfpilot_types::{Category, Phase, Step, StepStatus};
use serde::{Deserialize, Serialize};

/// Read-only view of a run handed to hosts for polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub phase: Phase,
    pub message: String,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    pub confidence: f64,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Shared with the run task; a finished step is never copied again.
    #[serde(default)]
    pub steps: Vec<Arc<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at_ms: u64,
}

impl RunSnapshot {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            phase: Phase::Idle,
            message: crate::PhaseReducer::message(Phase::Idle).to_string(),
            progress: 0,
            attempts: 0,
            max_attempts: 0,
            paused: false,
            category: None,
            confidence: 0.0,
            flags: Vec::new(),
            steps: Vec::new(),
            error: None,
            updated_at_ms: 0,
        }
    }

    pub fn failed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
            .count()
    }
}

/// Terminal result of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub phase: Phase,
    pub success: bool,
    #[serde(default)]
    pub flags: Vec<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutopilotEvent {
    RunStarted {
        run_id: String,
        files: usize,
        max_attempts: u32,
    },
    PhaseChanged {
        run_id: String,
        phase: Phase,
        message: String,
        progress: u8,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        phase: Phase,
        command: String,
    },
    StepFinished {
        run_id: String,
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
        flags: Vec<String>,
    },
    CategoryChanged {
        run_id: String,
        category: Category,
        confidence: f64,
        rule_based: bool,
    },
    AnalysisFailed {
        run_id: String,
        attempt: u32,
        error: String,
    },
    Paused {
        run_id: String,
        attempts: u32,
    },
    Resumed {
        run_id: String,
        attempts: u32,
    },
    FlagFound {
        run_id: String,
        flag: String,
    },
    RunCompleted {
        run_id: String,
        success: bool,
        flags: Vec<String>,
    },
    RunCancelled {
        run_id: String,
        attempts: u32,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
}

impl AutopilotEvent {
    pub fn run_id(&self) -> &str {
        match self {
            AutopilotEvent::RunStarted { run_id, .. }
            | AutopilotEvent::PhaseChanged { run_id, .. }
            | AutopilotEvent::StepStarted { run_id, .. }
            | AutopilotEvent::StepFinished { run_id, .. }
            | AutopilotEvent::CategoryChanged { run_id, .. }
            | AutopilotEvent::AnalysisFailed { run_id, .. }
            | AutopilotEvent::Paused { run_id, .. }
            | AutopilotEvent::Resumed { run_id, .. }
            | AutopilotEvent::FlagFound { run_id, .. }
            | AutopilotEvent::RunCompleted { run_id, .. }
            | AutopilotEvent::RunCancelled { run_id, .. }
            | AutopilotEvent::RunFailed { run_id, .. } => run_id,
        }
    }
}
