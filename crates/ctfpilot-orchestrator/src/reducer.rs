use ctfpilot_types::Phase;

/// Inputs that move a run between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSignal {
    Start,
    ReconFinished { flags_found: bool },
    CategoryDetected,
    AnalysisFinished { flags_found: bool },
    ScriptGenerated,
    ScriptExecuted,
    CancelObserved,
    Fault,
}

impl PhaseSignal {
    fn as_str(self) -> &'static str {
        match self {
            PhaseSignal::Start => "start",
            PhaseSignal::ReconFinished { .. } => "recon_finished",
            PhaseSignal::CategoryDetected => "category_detected",
            PhaseSignal::AnalysisFinished { .. } => "analysis_finished",
            PhaseSignal::ScriptGenerated => "script_generated",
            PhaseSignal::ScriptExecuted => "script_executed",
            PhaseSignal::CancelObserved => "cancel_observed",
            PhaseSignal::Fault => "fault",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransitionError {
    pub from: Phase,
    pub signal: &'static str,
}

impl std::fmt::Display for PhaseTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal phase transition: `{}` cannot handle `{}`",
            self.from, self.signal
        )
    }
}

impl std::error::Error for PhaseTransitionError {}

pub struct PhaseReducer;

impl PhaseReducer {
    pub fn reduce(current: Phase, signal: PhaseSignal) -> Result<Phase, PhaseTransitionError> {
        let next = match (current, signal) {
            (phase, PhaseSignal::CancelObserved) if !phase.is_terminal() => Phase::Cancelled,
            (phase, PhaseSignal::Fault) if !phase.is_terminal() => Phase::Failed,
            (Phase::Idle, PhaseSignal::Start) => Phase::Reconnaissance,
            (Phase::Reconnaissance, PhaseSignal::ReconFinished { flags_found: true }) => {
                Phase::Completed
            }
            (Phase::Reconnaissance, PhaseSignal::ReconFinished { flags_found: false }) => {
                Phase::CategoryDetection
            }
            (Phase::CategoryDetection, PhaseSignal::CategoryDetected) => Phase::AiAnalysis,
            (Phase::AiAnalysis, PhaseSignal::AnalysisFinished { flags_found: true }) => {
                Phase::Completed
            }
            (Phase::AiAnalysis, PhaseSignal::AnalysisFinished { flags_found: false }) => {
                Phase::ScriptGeneration
            }
            (Phase::ScriptGeneration, PhaseSignal::ScriptGenerated) => Phase::ScriptExecution,
            (Phase::ScriptExecution, PhaseSignal::ScriptExecuted) => Phase::Completed,
            (from, signal) => {
                return Err(PhaseTransitionError {
                    from,
                    signal: signal.as_str(),
                })
            }
        };
        Ok(next)
    }

    pub fn message(phase: Phase) -> &'static str {
        match phase {
            Phase::Idle => "Waiting to start",
            Phase::Reconnaissance => "Inspecting challenge files",
            Phase::CategoryDetection => "Detecting challenge category",
            Phase::AiAnalysis => "Running AI-guided analysis",
            Phase::ScriptGeneration => "Generating solve script",
            Phase::ScriptExecution => "Executing solve script",
            Phase::Completed => "Run completed",
            Phase::Failed => "Run failed",
            Phase::Cancelled => "Run cancelled",
        }
    }

    /// Coarse progress for display. The analysis phase scales with attempts.
    pub fn progress(phase: Phase, attempts: u32, max_attempts: u32) -> u8 {
        match phase {
            Phase::Idle => 0,
            Phase::Reconnaissance => 10,
            Phase::CategoryDetection => 25,
            Phase::AiAnalysis => {
                let max = max_attempts.max(1) as u64;
                let done = (attempts as u64).min(max);
                (30 + done * 50 / max) as u8
            }
            Phase::ScriptGeneration => 85,
            Phase::ScriptExecution => 92,
            Phase::Completed | Phase::Failed | Phase::Cancelled => 100,
        }
    }
}
