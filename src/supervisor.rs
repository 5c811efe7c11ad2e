//! Owns the child process of one executing session.
//!
//! The child runs behind a fixed `sh` template that changes directory and
//! then execs the real command, which is passed as positional parameters
//! and never interpolated into shell text.
//!
//! Background tasks (one per output pipe, a stdin writer, and a waiter)
//! report to the session through a single [`ProcessEvent`] channel.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StdStream;
use crate::protocol::{signal_exit_code, ExecRequest, ForwardedSignal, SENTINEL_EXIT_CODE};

/// `$0` is a label, `$1` the directory, the rest the command.
const CD_THEN_EXEC: &str = r#"cd "$1" && shift && exec "$@""#;

const READ_BUF_SIZE: usize = 8192;

/// How long output may keep flowing after the child is reaped.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn command: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Notifications from the supervisor's background tasks.
#[derive(Debug)]
pub enum ProcessEvent {
    Output { stream: StdStream, data: Bytes },
    /// Reading or writing one of the child's pipes failed.
    StreamFailed { stream: StdStream, error: io::Error },
    /// The child was reaped.
    Exited { code: i32 },
    /// The child was reaped and both output pipes are drained, or
    /// [`DRAIN_GRACE`] ran out first.
    Closed { code: i32 },
    /// Waiting on the child failed.
    Failed { message: String },
}

enum StdinCommand {
    Data(Bytes),
    End,
}

pub struct Supervisor {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    stdin_tx: mpsc::UnboundedSender<StdinCommand>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pid", &self.pid)
            .field("exited", &self.exited.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Build the `sh` invocation for `args` run inside `cwd`.
pub fn build_command(args: &[String], cwd: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(CD_THEN_EXEC)
        .arg("rexec")
        .arg(cwd)
        .args(args);
    cmd
}

impl Supervisor {
    /// Spawn `request` and start the pipe and waiter tasks.
    ///
    /// `home` is used when the request carries no working directory.
    pub fn spawn(
        request: &ExecRequest,
        home: &Path,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Self, SupervisorError> {
        if request.args.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }

        let cwd = match &request.cwd {
            Some(dir) => dir.clone(),
            None => home.to_string_lossy().into_owned(),
        };

        let mut cmd = build_command(&request.args, &cwd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id();
        tracing::info!(?pid, %cwd, args = ?request.args, "spawned process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let stdout_task = stdout.map(|out| tokio::spawn(pump(out, StdStream::Stdout, events.clone())));
        let stderr_task = stderr.map(|err| tokio::spawn(pump(err, StdStream::Stderr, events.clone())));

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        if let Some(stdin) = stdin {
            tokio::spawn(feed_stdin(stdin, stdin_rx, events.clone()));
        }

        let exited = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let waiter_exited = exited.clone();
        let waiter_cancel = cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = waiter_cancel.cancelled() => {
                    tracing::debug!(?pid, "session torn down, killing process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // Set before anything else so no signal can hit a recycled pid.
            waiter_exited.store(true, Ordering::Release);

            match status {
                Ok(status) => {
                    let code = exit_code(status);
                    tracing::debug!(?pid, ?status, code, "process exited");
                    let _ = events.send(ProcessEvent::Exited { code });

                    // A background grandchild can hold the pipes open
                    // indefinitely; stop waiting for EOF after a grace period.
                    let mut pumps: Vec<_> = [stdout_task, stderr_task].into_iter().flatten().collect();
                    let drained = async {
                        for task in pumps.iter_mut() {
                            let _ = task.await;
                        }
                    };
                    if tokio::time::timeout(DRAIN_GRACE, drained).await.is_err() {
                        tracing::debug!(?pid, "output still open after exit, closing anyway");
                        for task in &pumps {
                            task.abort();
                        }
                    }
                    let _ = events.send(ProcessEvent::Closed { code });
                }
                Err(e) => {
                    tracing::error!(?pid, ?e, "error waiting for process");
                    let _ = events.send(ProcessEvent::Failed {
                        message: e.to_string(),
                    });
                }
            }
        });

        Ok(Self {
            pid,
            exited,
            stdin_tx,
            cancel,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue a chunk for the child's stdin.
    pub fn write_stdin(&self, data: Bytes) {
        let _ = self.stdin_tx.send(StdinCommand::Data(data));
    }

    /// Close the child's stdin once everything queued so far is written.
    pub fn close_stdin(&self) {
        let _ = self.stdin_tx.send(StdinCommand::End);
    }

    /// Deliver a forwarded signal, remapped as the protocol requires.
    ///
    /// Does nothing once the child has been reaped.
    pub fn signal(&self, signal: ForwardedSignal) -> Result<(), SupervisorError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return Ok(());
        }
        if self.exited.load(Ordering::Acquire) {
            tracing::debug!(pid, %signal, "process already exited, skipping signal");
            return Ok(());
        }

        let delivered = signal.delivered();
        tracing::info!(pid, received = %signal, %delivered, "signalling process");
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as i32, delivered.number()) };
        if rc != 0 {
            return Err(SupervisorError::Signal {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Kill the child (if still running) and stop the background tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Exit code reported for `status`: the real code, 128+N for a process
/// killed by signal N, the sentinel otherwise.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return signal_exit_code(signal);
        }
    }
    SENTINEL_EXIT_CODE
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: StdStream,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(%stream, "end of stream");
                break;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(ProcessEvent::Output { stream, data }).is_err() {
                    break;
                }
            }
            Err(error) => {
                let _ = events.send(ProcessEvent::StreamFailed { stream, error });
                break;
            }
        }
    }
}

async fn feed_stdin(
    mut stdin: ChildStdin,
    mut commands: mpsc::UnboundedReceiver<StdinCommand>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    while let Some(command) = commands.recv().await {
        let result = match command {
            StdinCommand::Data(data) => stdin.write_all(&data).await,
            StdinCommand::End => {
                tracing::debug!("closing process stdin");
                let _ = stdin.shutdown().await;
                return;
            }
        };

        match result {
            Ok(()) => {}
            // The child closed its end; it simply takes no more input.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!("process closed stdin");
                return;
            }
            Err(error) => {
                let _ = events.send(ProcessEvent::StreamFailed {
                    stream: StdStream::Stdin,
                    error,
                });
                return;
            }
        }
    }
}

/// Turns the racing error / exit / close notifications into exactly one
/// final exit code.
#[derive(Debug, Default)]
pub struct ExitReconciler {
    status: Option<i32>,
    settled: bool,
}

/// The three ways the OS tells us a process is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Error,
    Exit(i32),
    Close(i32),
}

impl ExitReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Feed a notification. Returns the exit code to report the first time
    /// the outcome settles and `None` ever after.
    pub fn observe(&mut self, termination: Termination) -> Option<i32> {
        if self.settled {
            return None;
        }
        match termination {
            Termination::Error => {
                self.settled = true;
                Some(SENTINEL_EXIT_CODE)
            }
            Termination::Exit(code) => {
                self.status = Some(code);
                None
            }
            Termination::Close(code) => {
                self.settled = true;
                Some(self.status.unwrap_or(code))
            }
        }
    }
}
