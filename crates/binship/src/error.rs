//! Typed failures at the engine's seams.
//!
//! Stages return `anyhow::Error`; the orchestrator inspects the chain for the
//! types defined here to tell a cancelled run from a failed one.

use binship_config::ConfigError;
use binship_git::VersionControlError;
use binship_process::{CancelToken, StopReason};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    VersionControl(#[from] VersionControlError),

    #[error("--parallelism must be at least 1")]
    InvalidParallelism,
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to run hook `{cmd}`: {message}")]
    Spawn { cmd: String, message: String },

    #[error("hook failed: {cmd}: {status}\n{output}")]
    Failed {
        cmd: String,
        status: String,
        output: String,
    },

    #[error("hook `{cmd}` interrupted: {reason}")]
    Interrupted { cmd: String, reason: String },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to build {unit}: {message}")]
    Unit { unit: String, message: String },

    #[error("all {total} build units failed, first error: {first}")]
    Aggregate { total: usize, first: String },

    #[error("build timed out with {pending} of {total} units unfinished")]
    TimedOut { pending: usize, total: usize },

    #[error("build cancelled with {pending} of {total} units unfinished")]
    Cancelled { pending: usize, total: usize },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    VersionControl(#[from] VersionControlError),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("{0:#}")]
    Setup(anyhow::Error),

    #[error("{stage}: {error:#}")]
    Stage { stage: String, error: anyhow::Error },

    #[error("timed out during {stage}")]
    Timeout { stage: String },

    #[error("cancelled during {stage}")]
    Cancelled { stage: String },
}

impl From<ContextError> for PipelineError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Config(e) => PipelineError::Configuration(e),
            ContextError::VersionControl(e) => PipelineError::VersionControl(e),
            e @ ContextError::InvalidParallelism => PipelineError::InvalidOption(e.to_string()),
        }
    }
}

impl PipelineError {
    /// Errors caused by the project file or the command line.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_) | PipelineError::InvalidOption(_)
        )
    }
}

/// Whether `err` means the run was stopped rather than failed.
pub fn stop_reason(err: &anyhow::Error, cancel: &CancelToken) -> Option<StopReason> {
    for cause in err.chain() {
        if let Some(build) = cause.downcast_ref::<BuildError>() {
            match build {
                BuildError::TimedOut { .. } => return Some(StopReason::DeadlineExceeded),
                BuildError::Cancelled { .. } => return Some(StopReason::Cancelled),
                _ => {}
            }
        }
        if let Some(HookError::Interrupted { .. }) = cause.downcast_ref::<HookError>() {
            return Some(cancel.stop_reason().unwrap_or(StopReason::Cancelled));
        }
    }
    cancel.stop_reason()
}

pub fn describe_stop(reason: StopReason) -> &'static str {
    match reason {
        StopReason::DeadlineExceeded => "deadline exceeded",
        StopReason::Cancelled => "cancelled",
    }
}
