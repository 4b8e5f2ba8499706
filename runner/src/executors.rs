mod mpi;

pub use mpi::{MpiExecutor, RunHandle};

use crate::machinefile::MachineFileError;
use std::{
    fmt, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Errors that stop a run before it reaches progress tracking
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Input directory {0:?} does not exist or is not a directory")]
    InvalidInput(PathBuf),
    #[error("No supported images found in {0:?}")]
    NoWorkItems(PathBuf),
    #[error("Failed to write machine-file: {0}")]
    MachineFile(#[from] MachineFileError),
    #[error("Failed to prepare output directory {path:?}: {source}")]
    OutputDirectory { path: PathBuf, source: io::Error },
    #[error("Failed to spawn launcher {exec:?}: {source}")]
    Spawn { exec: PathBuf, source: io::Error },
    #[error("Failed to attach to launcher output: {0}")]
    Attach(io::Error),
}

/// The single terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    InvalidInput,
    NoWorkItems,
    LaunchFailed(String),
    ExecutionFailed(String),
    Cancelled,
    Completed,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// short status for the presentation layer
    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidInput => "Invalid input folder.",
            Self::NoWorkItems => "No images found in selected folder.",
            Self::LaunchFailed(_) => "Error launching process.",
            Self::ExecutionFailed(_) => "Execution error.",
            Self::Cancelled => "Processing cancelled.",
            Self::Completed => "Processing completed.",
        }
    }

    /// diagnostic text attached to failures
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::LaunchFailed(detail) | Self::ExecutionFailed(detail) => Some(detail),
            _ => None,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}\n{}", self.message(), detail),
            None => f.write_str(self.message()),
        }
    }
}

impl From<ExecutorError> for JobOutcome {
    fn from(error: ExecutorError) -> Self {
        match error {
            ExecutorError::InvalidInput(_) => Self::InvalidInput,
            ExecutorError::NoWorkItems(_) => Self::NoWorkItems,
            error => Self::LaunchFailed(error.to_string()),
        }
    }
}

/// Cooperative cancellation flag shared between the controller and a run
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_from_preflight_errors() {
        assert_eq!(
            JobOutcome::from(ExecutorError::InvalidInput("x".into())),
            JobOutcome::InvalidInput
        );
        assert_eq!(
            JobOutcome::from(ExecutorError::NoWorkItems("x".into())),
            JobOutcome::NoWorkItems
        );

        let outcome = JobOutcome::from(ExecutorError::Spawn {
            exec: "mpirun".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        });
        assert!(matches!(outcome, JobOutcome::LaunchFailed(ref detail) if detail.contains("no such file")));
    }

    #[test]
    fn outcome_display_includes_detail() {
        let outcome = JobOutcome::ExecutionFailed("rank 3 died".into());

        assert_eq!(outcome.to_string(), "Execution error.\nrank 3 died");
        assert_eq!(JobOutcome::Completed.to_string(), "Processing completed.");
    }

    #[test]
    fn token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();

        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
