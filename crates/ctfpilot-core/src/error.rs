use ctfpilot_orchestrator::PhaseTransitionError;
use thiserror::Error;

/// Errors surfaced to the host before or while driving a run.
#[derive(Error, Debug)]
pub enum AutopilotError {
    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("history_capacity must be at least 1")]
    ZeroHistoryCapacity,

    #[error("invalid flag pattern `{pattern}`: {source}")]
    InvalidFlagPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Transition(#[from] PhaseTransitionError),
}
