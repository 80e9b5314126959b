use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of the single debugger session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Starting,
    Ready,
    Busy,
    Crashed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// One command line to run, plus how to start a session if none is alive.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub command: String,
    pub candidate_paths: Option<Vec<PathBuf>>,
    pub startup_args: Option<Vec<String>>,
}

impl ExecuteRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_candidate_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.candidate_paths = Some(paths);
        self
    }

    pub fn with_startup_args(mut self, args: Vec<String>) -> Self {
        self.startup_args = Some(args);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub text: String,
    pub completed_at: DateTime<Utc>,
    /// Set when the command ended the process as intended (`q`, `qd`, ...).
    pub exit: Option<String>,
}

impl CommandOutput {
    pub fn completed(command: impl Into<String>, text: String) -> Self {
        Self {
            command: command.into(),
            text,
            completed_at: Utc::now(),
            exit: None,
        }
    }

    pub fn expected_exit(command: impl Into<String>, mut text: String, status: String) -> Self {
        let command = command.into();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!(
            "process exited as expected after command: {command}"
        ));
        Self {
            command,
            text,
            completed_at: Utc::now(),
            exit: Some(status),
        }
    }

    /// Output text prefixed with the completion timestamp.
    pub fn render(&self) -> String {
        format!("[{}]\n{}", self.completed_at.to_rfc3339(), self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prefixes_timestamp() {
        let output = CommandOutput::completed("k", "Child-SP\n0:000> ".to_string());
        let rendered = output.render();
        assert!(rendered.starts_with('['));
        assert!(rendered.ends_with("]\nChild-SP\n0:000> "));
        assert!(rendered.contains(&output.completed_at.to_rfc3339()));
    }

    #[test]
    fn expected_exit_appends_notice() {
        let output =
            CommandOutput::expected_exit("q", "quit:".to_string(), "exit status: 0".into());
        assert_eq!(output.text, "quit:\nprocess exited as expected after command: q");
        assert_eq!(output.exit.as_deref(), Some("exit status: 0"));

        let silent = CommandOutput::expected_exit("qd", String::new(), "exit status: 0".into());
        assert_eq!(silent.text, "process exited as expected after command: qd");
    }

    #[test]
    fn session_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Crashed).expect("state should serialize");
        assert_eq!(json, "\"crashed\"");
        assert_eq!(SessionState::Ready.to_string(), "ready");
    }
}
