//! Session engine.
//!
//! A single tokio task owns the debugger session and runs one command at a
//! time. Callers talk to it through [`EngineHandle`]. A second `execute` while
//! one is outstanding is rejected on the caller's side before anything is
//! sent to the task.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::Instant,
};

use crate::args::StartupArgs;
use crate::config::CdbConfig;
use crate::error::CdbError;
use crate::process::{DebuggerProcess, ProcessEvent};
use crate::prompt;
use crate::types::{CommandOutput, ExecuteRequest, SessionState};
use crate::Result;

/// Commands after which the debugger is expected to exit.
const EXIT_COMMANDS: &[&str] = &["q", "qq", "qd", ".detach"];
const TRANSITION_CAPACITY: usize = 64;

enum EngineRequest {
    Execute {
        request: ExecuteRequest,
        reply: oneshot::Sender<Result<CommandOutput>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::UnboundedSender<EngineRequest>,
    in_flight: Arc<AtomicBool>,
    state: watch::Receiver<SessionState>,
    transitions: broadcast::Sender<SessionState>,
}

impl EngineHandle {
    /// Runs one command line, starting a session first if none is alive.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<CommandOutput> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(CdbError::CommandInFlight);
        }

        let (reply, rx) = oneshot::channel();
        if self
            .requests
            .send(EngineRequest::Execute { request, reply })
            .is_err()
        {
            self.in_flight.store(false, Ordering::SeqCst);
            return Err(CdbError::EngineClosed);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                self.in_flight.store(false, Ordering::SeqCst);
                Err(CdbError::EngineClosed)
            }
        }
    }

    /// Stops the live session, if any. Calling it with nothing running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(EngineRequest::Stop { reply })
            .map_err(|_| CdbError::EngineClosed)?;
        rx.await.map_err(|_| CdbError::EngineClosed)
    }

    /// Stops the session and ends the engine task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(EngineRequest::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Every state change from now on, including short-lived ones like `Crashed`.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }
}

/// The command currently waiting for a prompt.
struct InFlightCommand {
    command: String,
    deadline: Instant,
}

impl InFlightCommand {
    fn new(command: String, command_timeout: Duration) -> Self {
        Self {
            command,
            deadline: Instant::now() + command_timeout,
        }
    }

    fn expects_exit(&self) -> bool {
        let trimmed = self.command.trim();
        EXIT_COMMANDS
            .iter()
            .any(|exit| trimmed.eq_ignore_ascii_case(exit))
    }
}

enum CommandOutcome {
    Completed(String),
    TimedOut(String),
    Exited { status: String, output: String },
    WriteFailed(std::io::Error),
}

struct Session {
    process: DebuggerProcess,
    startup_args: Vec<String>,
    buffer: String,
}

impl Session {
    fn new(process: DebuggerProcess, startup_args: Vec<String>) -> Self {
        Self {
            process,
            startup_args,
            buffer: String::new(),
        }
    }

    async fn run(&mut self, in_flight: &InFlightCommand) -> CommandOutcome {
        self.buffer.clear();
        let stale = self.process.discard_pending_output();
        if stale > 0 {
            tracing::debug!(bytes = stale, "discarded output received between commands");
        }

        if let Err(e) = self.process.write_line(&in_flight.command).await {
            return CommandOutcome::WriteFailed(e);
        }
        tracing::debug!(command = %in_flight.command, "command written");

        loop {
            match self.process.next_event(in_flight.deadline).await {
                ProcessEvent::Output(chunk) => {
                    tracing::trace!(
                        stream = ?chunk.stream,
                        bytes = chunk.text.len(),
                        "command output"
                    );
                    self.buffer.push_str(&chunk.text);
                    if prompt::ends_with_prompt(&self.buffer) {
                        return CommandOutcome::Completed(std::mem::take(&mut self.buffer));
                    }
                }
                ProcessEvent::Exited(status) => {
                    return CommandOutcome::Exited {
                        status,
                        output: std::mem::take(&mut self.buffer),
                    };
                }
                ProcessEvent::DeadlineElapsed => {
                    return CommandOutcome::TimedOut(std::mem::take(&mut self.buffer));
                }
            }
        }
    }
}

pub struct SessionEngine {
    config: CdbConfig,
    session: Option<Session>,
    in_flight: Arc<AtomicBool>,
    state: watch::Sender<SessionState>,
    transitions: broadcast::Sender<SessionState>,
}

/// What woke the engine task up while it was idle.
enum Wake {
    Request(Option<EngineRequest>),
    Exited(String),
}

impl SessionEngine {
    /// Spawns the engine task on the current tokio runtime.
    pub fn spawn(config: CdbConfig) -> EngineHandle {
        let (requests, rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SessionState::Stopped);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let in_flight = Arc::new(AtomicBool::new(false));

        let engine = Self {
            config,
            session: None,
            in_flight: in_flight.clone(),
            state,
            transitions: transitions.clone(),
        };
        tokio::spawn(engine.run(rx));

        EngineHandle {
            requests,
            in_flight,
            state: state_rx,
            transitions,
        }
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<EngineRequest>) {
        loop {
            // A live session is watched for exit between commands too.
            let wake = match self.session.as_mut() {
                Some(session) => tokio::select! {
                    request = requests.recv() => Wake::Request(request),
                    status = session.process.wait_exit() => Wake::Exited(status),
                },
                None => Wake::Request(requests.recv().await),
            };

            let request = match wake {
                Wake::Request(Some(request)) => request,
                Wake::Request(None) => break,
                Wake::Exited(status) => {
                    if let Some(session) = self.session.take() {
                        self.discard_exited(session, &status);
                    }
                    continue;
                }
            };

            match request {
                EngineRequest::Execute { request, reply } => {
                    let result = self.execute(request).await;
                    self.in_flight.store(false, Ordering::SeqCst);
                    let _ = reply.send(result);
                }
                EngineRequest::Stop { reply } => {
                    self.stop_session().await;
                    let _ = reply.send(());
                }
                EngineRequest::Shutdown { reply } => {
                    self.stop_session().await;
                    let _ = reply.send(());
                    tracing::info!("session engine shut down");
                    return;
                }
            }
        }

        // Every handle is gone.
        self.stop_session().await;
    }

    async fn execute(&mut self, request: ExecuteRequest) -> Result<CommandOutput> {
        let ExecuteRequest {
            command,
            candidate_paths,
            startup_args,
        } = request;
        let startup_args = startup_args.filter(|args| !args.is_empty());

        let live = match self.session.take() {
            Some(mut session) => match session.process.exit_status() {
                Some(status) => {
                    self.discard_exited(session, &status);
                    None
                }
                None => Some(session),
            },
            None => None,
        };

        let mut session = match live {
            Some(session) => {
                if let Some(requested) = &startup_args {
                    if *requested != session.startup_args {
                        tracing::warn!(
                            current = ?session.startup_args,
                            requested = ?requested,
                            "reusing live session started with different arguments"
                        );
                    }
                }
                session
            }
            None => {
                let args = startup_args.unwrap_or_else(StartupArgs::idle);
                self.start_session(candidate_paths, args).await?
            }
        };

        let in_flight = InFlightCommand::new(command, self.config.command_timeout);
        self.set_state(SessionState::Busy);
        let outcome = session.run(&in_flight).await;

        match outcome {
            CommandOutcome::Completed(text) => {
                self.session = Some(session);
                self.finish_command(SessionState::Ready);
                tracing::debug!(
                    command = %in_flight.command,
                    bytes = text.len(),
                    "command completed"
                );
                Ok(CommandOutput::completed(in_flight.command, text))
            }
            CommandOutcome::TimedOut(partial_output) => {
                self.session = Some(session);
                self.finish_command(SessionState::Ready);
                tracing::warn!(
                    command = %in_flight.command,
                    timeout_ms = self.config.command_timeout.as_millis() as u64,
                    partial_bytes = partial_output.len(),
                    "command timed out"
                );
                Err(CdbError::CommandTimeout {
                    command: in_flight.command,
                    timeout: self.config.command_timeout,
                    partial_output,
                    timed_out_at: Utc::now(),
                })
            }
            CommandOutcome::Exited { status, output } => {
                drop(session);
                if in_flight.expects_exit() {
                    self.finish_command(SessionState::Stopped);
                    tracing::info!(
                        command = %in_flight.command,
                        %status,
                        "debugger exited as expected"
                    );
                    Ok(CommandOutput::expected_exit(in_flight.command, output, status))
                } else {
                    self.finish_command(SessionState::Crashed);
                    tracing::warn!(
                        command = %in_flight.command,
                        %status,
                        "debugger exited unexpectedly"
                    );
                    self.set_state(SessionState::Stopped);
                    Err(CdbError::UnexpectedExit {
                        command: in_flight.command,
                        status,
                    })
                }
            }
            CommandOutcome::WriteFailed(e) => {
                session.process.kill().await;
                self.finish_command(SessionState::Crashed);
                tracing::warn!(command = %in_flight.command, error = %e, "failed to write command");
                self.set_state(SessionState::Stopped);
                Err(CdbError::Io(e))
            }
        }
    }

    async fn start_session(
        &mut self,
        candidate_paths: Option<Vec<PathBuf>>,
        startup_args: Vec<String>,
    ) -> Result<Session> {
        let candidates = match candidate_paths {
            Some(paths) => self.config.with_fallback(paths),
            None => self.config.candidate_paths(None),
        };

        self.set_state(SessionState::Starting);
        let started =
            DebuggerProcess::start(&candidates, &startup_args, self.config.handshake_timeout).await;
        match started {
            Ok(process) => {
                tracing::info!(
                    path = %process.path().display(),
                    pid = ?process.id(),
                    "debugger session started"
                );
                self.set_state(SessionState::Ready);
                Ok(Session::new(process, startup_args))
            }
            Err(e) => {
                self.set_state(SessionState::Stopped);
                Err(e)
            }
        }
    }

    async fn stop_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        tracing::info!(path = %session.process.path().display(), "stopping debugger session");
        session.process.stop(self.config.stop_grace).await;
        self.set_state(SessionState::Stopped);
    }

    /// The process went away while no command was running.
    fn discard_exited(&mut self, session: Session, status: &str) {
        tracing::warn!(
            path = %session.process.path().display(),
            %status,
            "debugger exited while idle"
        );
        drop(session);
        self.set_state(SessionState::Crashed);
        self.set_state(SessionState::Stopped);
    }

    fn finish_command(&mut self, next: SessionState) {
        self.in_flight.store(false, Ordering::SeqCst);
        self.set_state(next);
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "session state changed");
            let _ = self.transitions.send(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_flight(command: &str) -> InFlightCommand {
        InFlightCommand::new(command.to_string(), Duration::from_secs(30))
    }

    #[test]
    fn quit_and_detach_commands_expect_exit() {
        assert!(in_flight("q").expects_exit());
        assert!(in_flight(" qd ").expects_exit());
        assert!(in_flight("QQ").expects_exit());
        assert!(in_flight(".detach").expects_exit());
    }

    #[test]
    fn other_commands_do_not_expect_exit() {
        assert!(!in_flight("k").expects_exit());
        assert!(!in_flight("g").expects_exit());
        assert!(!in_flight("q; k").expects_exit());
        assert!(!in_flight("").expects_exit());
    }

    #[tokio::test]
    async fn stop_without_session_is_idempotent() {
        let handle = SessionEngine::spawn(CdbConfig::default());

        handle.stop().await.expect("first stop should succeed");
        handle.stop().await.expect("second stop should succeed");
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn handle_reports_closed_engine_after_shutdown() {
        let handle = SessionEngine::spawn(CdbConfig::default());
        handle.shutdown().await;

        tokio::task::yield_now().await;
        let err = handle
            .execute(ExecuteRequest::new("k"))
            .await
            .expect_err("engine task is gone");
        assert!(matches!(err, CdbError::EngineClosed), "unexpected error: {err}");
        assert!(!handle.is_busy());
    }
}
