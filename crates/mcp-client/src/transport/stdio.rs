use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use tm_domain::config::{McpServerConfig, McpTransportKind};
use tm_domain::trace::TraceEvent;

use super::{McpTransport, TransportError};
use crate::sink::EventSink;

/// Maximum number of consecutive non-JSON lines to skip before declaring the
/// server broken.
const MAX_SKIP_LINES: usize = 1000;

/// Inbound buffer between the stdout reader and the receive loop.
const INBOUND_CAPACITY: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stdio transport: communicates with a child process over stdin/stdout.
///
/// Each JSON-RPC message is a single newline-delimited line. Writes are
/// serialized by the stdin lock so concurrent callers never interleave
/// partial lines; stdout is read by a background task for the lifetime of
/// the process and stderr is drained into the event sink.
pub struct StdioTransport {
    server_id: String,
    /// `None` once shutdown has closed the pipe.
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    pid: Option<u32>,
    inbound: parking_lot::Mutex<Option<mpsc::Receiver<String>>>,
    alive: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn a child process from the given server config.
    pub fn spawn(
        config: &McpServerConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| broken_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| broken_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| broken_pipe("stderr"))?;

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        let reader = tokio::spawn(read_stdout(
            config.id.clone(),
            stdout,
            tx,
            alive.clone(),
        ));
        let drain = tokio::spawn(drain_stderr(config.id.clone(), stderr, sink));

        tracing::debug!(server_id = %config.id, pid = ?pid, command = %config.command, "spawned MCP server");

        Ok(Self {
            server_id: config.id.clone(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
            pid,
            inbound: parking_lot::Mutex::new(Some(rx)),
            alive,
            tasks: parking_lot::Mutex::new(vec![reader, drain]),
        })
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;

        let result = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            self.alive.store(false, Ordering::SeqCst);
            return Err(if e.kind() == std::io::ErrorKind::BrokenPipe {
                TransportError::ProcessExited
            } else {
                TransportError::Io(e)
            });
        }
        Ok(())
    }
}

fn broken_pipe(stream: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("failed to capture child {stream}"),
    ))
}

/// Forward every JSON-looking stdout line until EOF.
///
/// Dropping `tx` on exit closes the inbound channel, which is how the
/// receive loop learns that the process is gone.
async fn read_stdout(
    server_id: String,
    stdout: ChildStdout,
    tx: mpsc::Sender<String>,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut skipped = 0usize;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.starts_with('{') {
                    skipped = 0;
                    if tx.send(trimmed.to_owned()).await.is_err() {
                        break;
                    }
                    continue;
                }
                skipped += 1;
                if skipped >= MAX_SKIP_LINES {
                    tracing::warn!(
                        server_id = %server_id,
                        "MCP server produced too many non-JSON lines on stdout"
                    );
                    break;
                }
                tracing::debug!(server_id = %server_id, line = %trimmed, "skipping non-JSON line from MCP server stdout");
            }
            Ok(None) => {
                tracing::debug!(server_id = %server_id, "MCP server stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(server_id = %server_id, error = %e, "error reading MCP server stdout");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

async fn drain_stderr(server_id: String, stderr: ChildStderr, sink: Arc<dyn EventSink>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        sink.emit(TraceEvent::ServerStderr {
            server_id: server_id.clone(),
            line,
        });
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Stdio
    }

    async fn send(&self, message: &str) -> Result<Option<String>, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }
        self.write_line(message).await?;
        Ok(None)
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<String>> {
        self.inbound.lock().take()
    }

    fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        // A held lock means shutdown or a kill is in progress.
        match self.child.try_lock() {
            Ok(mut child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    self.alive.store(false, Ordering::SeqCst);
                    false
                }
            },
            Err(_) => true,
        }
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    async fn shutdown(&self, grace: Duration) {
        self.alive.store(false, Ordering::SeqCst);

        // Close stdin to signal the process to exit.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(server_id = %self.server_id, error = %e, "error closing MCP server stdin");
            }
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server_id = %self.server_id, ?status, "MCP server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server_id = %self.server_id, error = %e, "error waiting for MCP server process");
            }
            Err(_) => {
                tracing::warn!(
                    server_id = %self.server_id,
                    grace_ms = grace.as_millis() as u64,
                    "MCP server process did not exit within grace period, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(server_id = %self.server_id, error = %e, "failed to kill MCP server process");
                }
            }
        }
        drop(child);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
