//! Transports that carry JSON-RPC frames for a [`Connection`].
//!
//! Two kinds exist:
//! - stdio: a child process, one JSON object per line on stdin/stdout
//! - SSE: an HTTP event stream for inbound frames, POSTs for outbound (see [`super::sse`])
//!
//! Either way the caller gets back a shared [`Connection`] plus a
//! [`TransportHandle`] that owns the background tasks. Dropping the handle
//! without calling [`TransportHandle::shutdown`] tears the transport down
//! immediately (child processes are killed).

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::config::{Launch, ServerDescriptor, StdioLaunch};
use super::connection::{Connection, Outbound};
use super::errors::McpError;

/// Lines of stderr kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// Diagnostics are truncated to keep log messages readable.
const STDERR_TAIL_CHARS: usize = 2000;

/// How long to keep reading stdout after the process exits, so replies
/// already in the pipe still reach their callers.
const STDOUT_DRAIN: Duration = Duration::from_millis(500);

/// How long to wait for an exit status once stdout has closed.
const EXIT_AFTER_EOF: Duration = Duration::from_secs(1);

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Owns the background tasks of one open transport.
pub struct TransportHandle {
    stop: Option<oneshot::Sender<Duration>>,
    driver: Option<JoinHandle<()>>,
    stderr: Option<Arc<StderrTail>>,
}

impl TransportHandle {
    pub(crate) fn new(
        stop: oneshot::Sender<Duration>,
        driver: JoinHandle<()>,
        stderr: Option<Arc<StderrTail>>,
    ) -> Self {
        Self {
            stop: Some(stop),
            driver: Some(driver),
            stderr,
        }
    }

    /// Stop the transport and wait until every handle is released.
    ///
    /// Stdio servers get `grace` to exit after stdin closes before they are
    /// killed. Safe to call more than once.
    pub async fn shutdown(&mut self, grace: Duration) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(grace);
        }
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    /// Recent stderr output, formatted as a suffix for error messages
    /// (empty when there is none).
    pub fn diagnostics(&self) -> String {
        let tail = self
            .stderr
            .as_ref()
            .map(|s| s.render())
            .unwrap_or_default();
        format_stderr_suffix(&tail)
    }
}

/// Open the transport described by `descriptor`.
///
/// The returned connection is in the `Pending` state; the caller performs
/// the handshake.
pub async fn open(descriptor: &ServerDescriptor) -> Result<(Arc<Connection>, TransportHandle), McpError> {
    match &descriptor.launch {
        Launch::Stdio(launch) => spawn_stdio(&descriptor.name, launch),
        Launch::Sse(launch) => {
            super::sse::connect(&descriptor.name, launch, descriptor.startup_timeout).await
        }
    }
}

// ─── Stderr capture ──────────────────────────────────────────────────────────

/// Rolling buffer of the last lines a server wrote to stderr.
#[derive(Default)]
pub(crate) struct StderrTail {
    lines: Mutex<VecDeque<String>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn render(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut joined = lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        if joined.len() > STDERR_TAIL_CHARS {
            let mut cut = joined.len() - STDERR_TAIL_CHARS;
            while !joined.is_char_boundary(cut) {
                cut += 1;
            }
            joined = format!("...(truncated){}", &joined[cut..]);
        }
        joined
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

/// Spawn a stdio server and wire its pipes to a new connection.
fn spawn_stdio(
    name: &str,
    launch: &StdioLaunch,
) -> Result<(Arc<Connection>, TransportHandle), McpError> {
    let mut cmd = Command::new(&launch.command);
    cmd.args(&launch.args);
    cmd.envs(&launch.env);
    if let Some(dir) = &launch.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{}: {e}", launch.command),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = child.stderr.take();

    tracing::info!(
        server = name,
        command = %launch.command,
        pid = child.id().unwrap_or_default(),
        "server process spawned"
    );

    let (conn, outbound) = Connection::new(name);
    let conn = Arc::new(conn);
    let tail = Arc::new(StderrTail::default());

    let tasks = StdioTasks {
        writer: tokio::spawn(write_loop(conn.clone(), stdin, outbound)),
        reader: tokio::spawn(read_loop(conn.clone(), stdout)),
        stderr: stderr.map(|s| tokio::spawn(stderr_loop(name.to_string(), s, tail.clone()))),
    };

    let (stop_tx, stop_rx) = oneshot::channel();
    let driver = tokio::spawn(drive_stdio(child, conn.clone(), stop_rx, tasks, tail.clone()));

    Ok((conn, TransportHandle::new(stop_tx, driver, Some(tail))))
}

struct StdioTasks {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

/// How the stdio driver was woken.
enum StdioExit {
    Exited(std::io::Result<ExitStatus>),
    StdoutClosed,
    Fault,
    Stop(Duration),
}

/// Watch the process until it exits, the transport faults, or a stop is
/// requested; then release everything and mark the connection closed.
async fn drive_stdio(
    mut child: Child,
    conn: Arc<Connection>,
    mut stop: oneshot::Receiver<Duration>,
    mut tasks: StdioTasks,
    tail: Arc<StderrTail>,
) {
    let name = conn.server().to_string();

    let exit = tokio::select! {
        status = child.wait() => StdioExit::Exited(status),
        _ = &mut tasks.reader => StdioExit::StdoutClosed,
        _ = conn.faulted() => StdioExit::Fault,
        grace = &mut stop => StdioExit::Stop(grace.unwrap_or(Duration::ZERO)),
    };

    let reason = match exit {
        StdioExit::Exited(status) => {
            // Let the reader deliver replies that were written before exit.
            if tokio::time::timeout(STDOUT_DRAIN, &mut tasks.reader).await.is_err() {
                tasks.reader.abort();
            }
            describe_exit(status)
        }
        StdioExit::StdoutClosed => match tokio::time::timeout(EXIT_AFTER_EOF, child.wait()).await {
            Ok(status) => describe_exit(status),
            Err(_) => {
                kill(&mut child, &name).await;
                "server closed stdout".to_string()
            }
        },
        StdioExit::Fault => {
            tasks.reader.abort();
            kill(&mut child, &name).await;
            "transport fault".to_string()
        }
        StdioExit::Stop(grace) => {
            conn.drain("server stopped");
            conn.close_outbound();
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => tracing::debug!(server = %name, "server exited after stdin closed"),
                Err(_) => {
                    tracing::warn!(
                        server = %name,
                        grace_ms = grace.as_millis() as u64,
                        "server did not exit within grace period, killing"
                    );
                    kill(&mut child, &name).await;
                }
            }
            tasks.reader.abort();
            "server stopped".to_string()
        }
    };

    // Stderr hits EOF once the process is gone; bound the wait in case a
    // grandchild still holds the pipe.
    if let Some(mut stderr) = tasks.stderr.take() {
        if tokio::time::timeout(STDOUT_DRAIN, &mut stderr).await.is_err() {
            stderr.abort();
        }
    }
    tasks.writer.abort();

    let stderr_ctx = tail.render();
    if reason != "server stopped" && !stderr_ctx.is_empty() {
        tracing::warn!(server = %name, stderr = %stderr_ctx, "server stderr captured on exit");
    }

    conn.degrade(&reason);
    conn.mark_closed(&reason);
    tracing::info!(server = %name, reason = %reason, "transport closed");
}

async fn kill(child: &mut Child, name: &str) {
    if let Err(e) = child.kill().await {
        tracing::warn!(server = name, error = %e, "failed to kill server process");
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => format!("process exited ({status})"),
        Err(e) => format!("failed to wait for process: {e}"),
    }
}

/// Sole consumer of the outbound queue; writes one frame per line.
async fn write_loop(
    conn: Arc<Connection>,
    mut stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Message(mut line) => {
                line.push('\n');
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    conn.degrade(&format!("failed to write to stdin: {e}"));
                    return;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = stdin.shutdown().await;
}

/// Feed stdout lines to the demultiplexer until EOF.
///
/// Lines that are not UTF-8 are skipped like any other non-JSON output;
/// only EOF or an I/O error ends the loop.
async fn read_loop(conn: Arc<Connection>, stdout: ChildStdout) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => match std::str::from_utf8(&buf) {
                Ok(line) => conn.dispatch_raw(line.trim_end_matches(['\n', '\r'])),
                Err(_) => tracing::debug!(
                    server = %conn.server(),
                    bytes = buf.len(),
                    "skipping non-UTF-8 stdout line"
                ),
            },
            Err(e) => {
                tracing::debug!(server = %conn.server(), error = %e, "stdout read failed");
                break;
            }
        }
    }
}

/// Forward stderr to the log and keep the tail for diagnostics.
async fn stderr_loop(name: String, stderr: ChildStderr, tail: Arc<StderrTail>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                tracing::debug!(server = %name, line = %line, "server stderr");
                tail.push(line);
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
