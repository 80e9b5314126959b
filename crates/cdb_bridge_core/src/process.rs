//! Process supervisor: spawn, handshake and termination of the debugger.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};

use crate::error::{CdbError, LaunchAttempt, LaunchFailure};
use crate::prompt;
use crate::Result;

pub const QUIT_COMMAND: &str = "q";
pub const LINE_TERMINATOR: &str = if cfg!(windows) { "\r\n" } else { "\n" };

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug)]
pub enum ProcessEvent {
    Output(OutputChunk),
    Exited(String),
    DeadlineElapsed,
}

/// A live, handshake-confirmed debugger process.
pub struct DebuggerProcess {
    child: Child,
    stdin: ChildStdin,
    output: mpsc::UnboundedReceiver<OutputChunk>,
    readers: Vec<JoinHandle<()>>,
    streams_open: bool,
    path: PathBuf,
}

impl DebuggerProcess {
    /// Tries each candidate in order and returns the first one that reaches a prompt.
    pub async fn start(
        candidates: &[PathBuf],
        args: &[String],
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let mut attempts = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            match Self::launch(candidate, args, handshake_timeout).await {
                Ok(process) => {
                    tracing::info!(
                        path = %process.path.display(),
                        args = ?args,
                        "debugger handshake complete"
                    );
                    return Ok(process);
                }
                Err(failure) => {
                    tracing::warn!(
                        path = %candidate.display(),
                        reason = %failure,
                        "debugger candidate rejected"
                    );
                    attempts.push(LaunchAttempt::new(candidate.clone(), failure));
                }
            }
        }

        Err(CdbError::NoUsableExecutable { attempts })
    }

    async fn launch(
        candidate: &Path,
        args: &[String],
        handshake_timeout: Duration,
    ) -> std::result::Result<Self, LaunchFailure> {
        let executable = resolve_executable(candidate).ok_or(LaunchFailure::NotFound)?;

        let mut child = Command::new(&executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchFailure::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaunchFailure::Spawn("missing stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchFailure::Spawn("missing stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LaunchFailure::Spawn("missing stderr pipe".to_string()))?;

        let (tx, output) = mpsc::unbounded_channel();
        let readers = vec![
            tokio::spawn(reader_loop(stdout, OutputStream::Stdout, tx.clone())),
            tokio::spawn(reader_loop(stderr, OutputStream::Stderr, tx)),
        ];

        let mut process = Self {
            child,
            stdin,
            output,
            readers,
            streams_open: true,
            path: executable,
        };

        if let Err(failure) = process.handshake(handshake_timeout).await {
            process.kill().await;
            return Err(failure);
        }

        Ok(process)
    }

    /// Waits for the first prompt. Banner text is dropped once it arrives.
    async fn handshake(
        &mut self,
        handshake_timeout: Duration,
    ) -> std::result::Result<(), LaunchFailure> {
        let deadline = Instant::now() + handshake_timeout;
        let mut banner = String::new();

        loop {
            match self.next_event(deadline).await {
                ProcessEvent::Output(chunk) => {
                    tracing::trace!(
                        stream = ?chunk.stream,
                        bytes = chunk.text.len(),
                        "banner output"
                    );
                    banner.push_str(&chunk.text);
                    if prompt::ends_with_prompt(&banner) {
                        return Ok(());
                    }
                }
                ProcessEvent::Exited(status) => return Err(LaunchFailure::HandshakeExited(status)),
                ProcessEvent::DeadlineElapsed => {
                    return Err(LaunchFailure::HandshakeTimeout(handshake_timeout))
                }
            }
        }
    }

    /// Next output chunk from either stream, the process exit, or the deadline.
    /// Pending output is always delivered before the exit.
    pub async fn next_event(&mut self, deadline: Instant) -> ProcessEvent {
        loop {
            tokio::select! {
                biased;
                chunk = self.output.recv(), if self.streams_open => match chunk {
                    Some(chunk) => return ProcessEvent::Output(chunk),
                    None => self.streams_open = false,
                },
                status = self.child.wait() => return ProcessEvent::Exited(describe_status(status)),
                _ = sleep_until(deadline) => return ProcessEvent::DeadlineElapsed,
            }
        }
    }

    /// Resolves once the process has exited, whether or not a command is running.
    pub async fn wait_exit(&mut self) -> String {
        describe_status(self.child.wait().await)
    }

    /// Exit status if the process is already gone.
    pub fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("exit status unavailable: {e}")),
        }
    }

    /// Drops output that arrived while no command was waiting for it.
    pub fn discard_pending_output(&mut self) -> usize {
        let mut discarded = 0;
        while let Ok(chunk) = self.output.try_recv() {
            discarded += chunk.text.len();
        }
        discarded
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(LINE_TERMINATOR.as_bytes()).await?;
        self.stdin.flush().await
    }

    /// Sends `q`, waits up to `grace` for the exit and kills the process otherwise.
    pub async fn stop(mut self, grace: Duration) {
        if let Err(e) = self.write_line(QUIT_COMMAND).await {
            tracing::debug!(error = %e, "quit command not delivered");
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(path = %self.path.display(), %status, "debugger exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed waiting for debugger exit, killing");
                self.kill().await;
            }
            Err(_) => {
                tracing::warn!(
                    path = %self.path.display(),
                    grace_ms = grace.as_millis() as u64,
                    "debugger ignored quit, killing"
                );
                self.kill().await;
            }
        }

        self.detach();
    }

    /// Force-terminates the process and waits for it to be reaped.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "kill on debugger process failed");
        }
        self.detach();
    }

    fn detach(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.output.close();
        self.streams_open = false;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Drop for DebuggerProcess {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Existing files are taken as-is; bare names are looked up on `PATH`.
pub fn resolve_executable(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }

    let is_bare_name = !candidate.is_absolute() && candidate.components().count() == 1;
    if !is_bare_name {
        return None;
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(candidate))
        .find(|path| path.is_file())
}

fn describe_status(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("exit status unavailable: {e}"),
    }
}

async fn reader_loop<R>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<OutputChunk>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; READ_CHUNK_SIZE];
    let mut pending = Vec::new();

    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(?stream, error = %e, "debugger output stream closed with error");
                break;
            }
        };

        pending.extend_from_slice(&buf[..read]);
        let text = take_decoded(&mut pending);
        if text.is_empty() {
            continue;
        }
        if tx.send(OutputChunk { stream, text }).is_err() {
            return;
        }
    }

    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(OutputChunk { stream, text });
    }
}

/// Decodes the longest complete UTF-8 prefix, keeping a split trailing
/// character for the next read.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_decoded_keeps_split_character_for_next_read() {
        let bytes = "kd> é".as_bytes();
        let mut pending = bytes[..bytes.len() - 1].to_vec();

        assert_eq!(take_decoded(&mut pending), "kd> ");
        assert_eq!(pending, vec![0xC3]);

        pending.push(0xA9);
        assert_eq!(take_decoded(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn take_decoded_replaces_invalid_bytes() {
        let mut pending = vec![b'a', 0xFF, b'b'];
        assert_eq!(take_decoded(&mut pending), "a\u{FFFD}b");
        assert!(pending.is_empty());
    }

    #[test]
    fn resolve_executable_rejects_missing_paths() {
        assert_eq!(
            resolve_executable(Path::new("definitely-missing-debugger-7f3a.exe")),
            None
        );
        assert_eq!(
            resolve_executable(Path::new("/nonexistent/dir/cdb.exe")),
            None
        );
    }

    #[cfg(unix)]
    #[test]
    fn resolve_executable_finds_bare_names_on_path() {
        let resolved = resolve_executable(Path::new("sh")).expect("sh should be on PATH");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));

        assert_eq!(
            resolve_executable(Path::new("/bin/sh")),
            Some(PathBuf::from("/bin/sh"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn next_event_delivers_output_before_exit() {
        let process = DebuggerProcess::start(
            &[PathBuf::from("/bin/sh")],
            &["-c".to_string(), "printf '0:000> '; read line; printf 'bye'; exit 3".to_string()],
            Duration::from_secs(5),
        )
        .await;
        let mut process = process.expect("scripted debugger should reach its prompt");

        process.write_line("go").await.expect("stdin should accept a line");
        let deadline = Instant::now() + Duration::from_secs(5);

        let mut seen = String::new();
        loop {
            match process.next_event(deadline).await {
                ProcessEvent::Output(chunk) => seen.push_str(&chunk.text),
                ProcessEvent::Exited(status) => {
                    assert!(status.contains('3'), "unexpected status: {status}");
                    break;
                }
                ProcessEvent::DeadlineElapsed => panic!("process did not exit in time"),
            }
        }
        assert_eq!(seen, "bye");
    }
}
