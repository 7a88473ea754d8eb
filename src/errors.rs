//! Error types for spawn operations

use std::io;
use thiserror::Error;

/// Result type for spawn operations
pub type Result<T> = std::result::Result<T, SpawnError>;

/// Errors surfaced to the parent side.
///
/// Failures that happen inside a child after the fork are not represented
/// here; they travel back as a [`ChildFailure`](crate::ChildFailure) through
/// the normal completion path.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Process {pid} is already registered")]
    DuplicatePid { pid: i32 },

    #[error("Task has not been started")]
    NotStarted,

    #[error("Scheduler stalled: no live process or capture can wake a pending task")]
    Stalled,

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SpawnError::Stalled;
        assert!(err.to_string().starts_with("Scheduler stalled"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let spawn_err = SpawnError::from(io_err);
        assert!(spawn_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_fork_error_carries_errno() {
        let err = SpawnError::Fork(nix::errno::Errno::EAGAIN);
        assert!(err.to_string().contains("fork failed"));
    }

    #[test]
    fn test_duplicate_pid_display() {
        let err = SpawnError::DuplicatePid { pid: 4242 };
        assert_eq!(err.to_string(), "Process 4242 is already registered");
    }

    #[test]
    fn test_serialization_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err = SpawnError::from(json_err);
        assert!(err.to_string().contains("Serialization"));
    }
}
