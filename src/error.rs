use std::path::PathBuf;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use thiserror::Error;

use crate::job::{JobState, SlotId};

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("invalid command")]
    InvalidCommand,

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job {job} is {state}")]
    InvalidState { job: SlotId, state: JobState },

    #[error("line too long (max {0} bytes)")]
    LineTooLong(usize),

    #[error("too many arguments (max {0})")]
    TooManyArgs(usize),

    #[error("no job id left to be used (max {capacity} jobs)")]
    TableFull { capacity: usize },

    #[error("job {0} has not been reaped yet")]
    StillRunning(SlotId),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to send {signal} to {pid}: {source}")]
    Signal {
        pid: Pid,
        signal: Signal,
        #[source]
        source: nix::Error,
    },

    #[error("failed to set process group of {pid}: {source}")]
    ProcessGroup {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    #[error("failed to update signal mask: {0}")]
    SignalMask(#[source] nix::Error),

    #[error("failed to install signal handler: {0}")]
    SignalHandler(#[source] nix::Error),

    #[error("cd: {path}: {source}")]
    ChangeDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("argument contains a NUL byte: {0:?}")]
    NulByte(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShellError {
    /// Errors caused by what the user typed, as opposed to the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShellError::InvalidCommand
                | ShellError::InvalidJob(_)
                | ShellError::InvalidState { .. }
                | ShellError::LineTooLong(_)
                | ShellError::TooManyArgs(_)
                | ShellError::NulByte(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;

/// Tells the user about an error the shell carries on from.
pub fn report(err: &ShellError) {
    if err.is_user_error() {
        tracing::debug!(error = %err, "rejected command");
    } else {
        tracing::info!(error = %err, "command failed");
    }
    eprintln!("jobsh: {}", err);
}
