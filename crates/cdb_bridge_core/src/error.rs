use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Why a single candidate executable could not be brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchFailure {
    NotFound,
    Spawn(String),
    HandshakeTimeout(Duration),
    HandshakeExited(String),
}

impl fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "executable not found"),
            Self::Spawn(reason) => write!(f, "spawn failed: {reason}"),
            Self::HandshakeTimeout(after) => {
                write!(f, "no prompt within {after:?}")
            }
            Self::HandshakeExited(status) => {
                write!(f, "exited before first prompt ({status})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchAttempt {
    pub path: PathBuf,
    pub failure: LaunchFailure,
}

impl LaunchAttempt {
    pub fn new(path: impl Into<PathBuf>, failure: LaunchFailure) -> Self {
        Self {
            path: path.into(),
            failure,
        }
    }
}

impl fmt::Display for LaunchAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.failure)
    }
}

#[derive(Error, Debug)]
pub enum CdbError {
    #[error("No usable debugger executable (tried: {})", format_attempts(attempts))]
    NoUsableExecutable { attempts: Vec<LaunchAttempt> },

    #[error("A command is already in flight")]
    CommandInFlight,

    #[error("Command '{command}' timed out after {timeout:?} at {}", timed_out_at.to_rfc3339())]
    CommandTimeout {
        command: String,
        timeout: Duration,
        partial_output: String,
        timed_out_at: DateTime<Utc>,
    },

    #[error("Debugger process exited unexpectedly during '{command}' ({status})")]
    UnexpectedExit { command: String, status: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session engine is no longer running")]
    EngineClosed,
}

impl CdbError {
    /// True when no candidate executable could be brought up.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Self::NoUsableExecutable { .. })
    }

    /// Output captured before a command timed out, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::CommandTimeout { partial_output, .. } => Some(partial_output),
            _ => None,
        }
    }
}

fn format_attempts(attempts: &[LaunchAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_usable_executable_names_every_attempt() {
        let err = CdbError::NoUsableExecutable {
            attempts: vec![
                LaunchAttempt::new("cdb.exe", LaunchFailure::NotFound),
                LaunchAttempt::new(r"C:\bad\path.exe", LaunchFailure::NotFound),
            ],
        };
        let message = err.to_string();
        assert!(message.starts_with("No usable debugger executable"));
        assert!(message.contains("cdb.exe: executable not found"));
        assert!(message.contains(r"C:\bad\path.exe: executable not found"));
        assert!(err.is_launch_failure());
    }

    #[test]
    fn test_command_timeout_keeps_partial_output() {
        let err = CdbError::CommandTimeout {
            command: "k".to_string(),
            timeout: Duration::from_secs(30),
            partial_output: "Child-SP".to_string(),
            timed_out_at: Utc::now(),
        };
        assert_eq!(err.partial_output(), Some("Child-SP"));
        assert!(err.to_string().starts_with("Command 'k' timed out after 30s"));
        assert!(!err.is_launch_failure());
    }

    #[test]
    fn test_launch_attempt_display_names_path_and_failure() {
        let timeout = LaunchAttempt::new(
            "/usr/bin/cdb",
            LaunchFailure::HandshakeTimeout(Duration::from_secs(7)),
        );
        assert_eq!(timeout.to_string(), "/usr/bin/cdb: no prompt within 7s");

        let exited = LaunchAttempt::new(
            "/usr/bin/cdb",
            LaunchFailure::HandshakeExited("exit status: 3".to_string()),
        );
        assert_eq!(
            exited.to_string(),
            "/usr/bin/cdb: exited before first prompt (exit status: 3)"
        );
    }

    #[test]
    fn test_error_display_messages() {
        assert_eq!(
            CdbError::CommandInFlight.to_string(),
            "A command is already in flight"
        );
        let exit = CdbError::UnexpectedExit {
            command: "g".to_string(),
            status: "exit status: 5".to_string(),
        };
        assert_eq!(
            exit.to_string(),
            "Debugger process exited unexpectedly during 'g' (exit status: 5)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: CdbError = io_err.into();
        match err {
            CdbError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            _ => panic!("Expected Io variant"),
        }
    }
}
