//! Executor side of one connection.
//!
//! An [`ExecSession`] is a single task that owns the handshake, the
//! supervised child and the outbound half of the channel. It reacts to two
//! sources, inbound protocol events and [`ProcessEvent`]s from the
//! supervisor, so there is never more than one writer on the channel.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{AuthPolicy, Handshake, HandshakeStep};
use crate::channel::{EventSink, EventStream};
use crate::error::{SessionError, StdStream};
use crate::protocol::{Event, ForwardedSignal};
use crate::supervisor::{ExitReconciler, ProcessEvent, Supervisor, Termination};

/// Token files hold a handful of characters; never read more than this.
const MAX_PROOF_LEN: u64 = 256;

const PROOF_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on waiting for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle shared by both ends of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingAuth,
    Authenticating,
    Executing,
    Exited,
    Disconnected,
}

pub struct ExecSession {
    id: Uuid,
    peer: Option<IpAddr>,
    state: SessionState,
    handshake: Handshake,
    policy: Arc<dyn AuthPolicy>,
    home: PathBuf,
    supervisor: Option<Supervisor>,
    reconciler: ExitReconciler,
    shutdown: CancellationToken,
}

impl ExecSession {
    pub fn new(policy: Arc<dyn AuthPolicy>, home: PathBuf, peer: Option<IpAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            state: SessionState::Connecting,
            handshake: Handshake::new(),
            policy,
            home,
            supervisor: None,
            reconciler: ExitReconciler::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// End the session, killing its command, once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until the command's exit has been reported or the
    /// channel goes away.
    ///
    /// Returns the exit code sent to the client. A command that could not be
    /// started is still reported to the client (on stderr, with exit code
    /// 255) before this returns [`SessionError::Process`]. On any error the
    /// child, if one was started, is killed and reaped before returning.
    pub async fn run(
        mut self,
        mut sink: EventSink,
        mut events: EventStream,
    ) -> Result<i32, SessionError> {
        self.state = SessionState::AwaitingAuth;
        let (process_tx, mut process_rx) = mpsc::unbounded_channel();
        let shutdown = self.shutdown.clone();

        let result = loop {
            tokio::select! {
                inbound = events.next() => match inbound {
                    None => break Err(SessionError::Disconnected),
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(event)) => {
                        match self.on_event(event, &mut sink, &process_tx).await {
                            Ok(Some(code)) => break Ok(code),
                            Ok(None) => {}
                            Err(e) => break Err(e),
                        }
                    }
                },
                Some(event) = process_rx.recv() => {
                    match self.on_process_event(event, &mut sink).await {
                        Ok(Some(code)) => break Ok(code),
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown.cancelled() => break Err(SessionError::Shutdown),
            }
        };

        drop(process_tx);
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown();
            if result.is_err() {
                wait_reaped(&mut process_rx).await;
            }
        }
        if result.is_err() {
            self.state = SessionState::Disconnected;
        }
        let _ = sink.close().await;
        result
    }

    async fn on_event(
        &mut self,
        event: Event,
        sink: &mut EventSink,
        process_tx: &mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Option<i32>, SessionError> {
        tracing::debug!(event = event.name(), state = ?self.state, "inbound event");
        match event {
            Event::Exec(request) => {
                let step = self.handshake.on_exec(request, self.policy.as_ref(), self.peer);
                self.apply_step(step, sink, process_tx).await
            }
            Event::Login { path } => {
                let proof = read_proof(&path).await;
                let step = self.handshake.on_login(proof.as_deref());
                self.apply_step(step, sink, process_tx).await
            }
            Event::Stdin { data } => {
                if let Some(supervisor) = &self.supervisor {
                    supervisor.write_stdin(data);
                } else {
                    tracing::debug!("dropping stdin received before the command started");
                }
                Ok(None)
            }
            Event::StdinEnd => {
                if let Some(supervisor) = &self.supervisor {
                    supervisor.close_stdin();
                }
                Ok(None)
            }
            Event::Signal { name } => {
                let Some(signal) = ForwardedSignal::from_name(&name) else {
                    tracing::warn!(%name, "ignoring unsupported signal");
                    return Ok(None);
                };
                match &self.supervisor {
                    Some(supervisor) => {
                        if let Err(e) = supervisor.signal(signal) {
                            tracing::warn!(error = %e, "failed to forward signal");
                        }
                    }
                    None => tracing::debug!(%signal, "no process to signal"),
                }
                Ok(None)
            }
            other => {
                tracing::warn!(event = other.name(), "ignoring event not meant for the executor");
                Ok(None)
            }
        }
    }

    async fn apply_step(
        &mut self,
        step: HandshakeStep,
        sink: &mut EventSink,
        process_tx: &mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Option<i32>, SessionError> {
        match step {
            HandshakeStep::Ignore => Ok(None),
            HandshakeStep::Deny(token) => {
                tracing::info!("request challenged");
                self.state = SessionState::Authenticating;
                sink.send(Event::Deny { token }).await?;
                Ok(None)
            }
            HandshakeStep::Allow(request) => {
                tracing::info!(args = ?request.args, cwd = ?request.cwd, "request allowed");
                self.state = SessionState::Executing;
                sink.send(Event::Allow).await?;

                match Supervisor::spawn(&request, &self.home, process_tx.clone()) {
                    Ok(supervisor) => {
                        self.supervisor = Some(supervisor);
                        Ok(None)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "could not start command");
                        sink.send(Event::Stderr {
                            data: format!("{e}\n").into(),
                        })
                        .await?;
                        self.settle(Termination::Error, sink).await?;
                        Err(e.into())
                    }
                }
            }
        }
    }

    async fn on_process_event(
        &mut self,
        event: ProcessEvent,
        sink: &mut EventSink,
    ) -> Result<Option<i32>, SessionError> {
        match event {
            ProcessEvent::Output { stream, data } => {
                let event = match stream {
                    StdStream::Stderr => Event::Stderr { data },
                    _ => Event::Stdout { data },
                };
                sink.send(event).await?;
                Ok(None)
            }
            ProcessEvent::StreamFailed { stream, error } => {
                Err(SessionError::stream_io(stream, error))
            }
            ProcessEvent::Exited { code } => self.settle(Termination::Exit(code), sink).await,
            ProcessEvent::Closed { code } => self.settle(Termination::Close(code), sink).await,
            ProcessEvent::Failed { message } => {
                sink.send(Event::Stderr {
                    data: format!("{message}\n").into(),
                })
                .await?;
                self.settle(Termination::Error, sink).await
            }
        }
    }

    async fn settle(
        &mut self,
        termination: Termination,
        sink: &mut EventSink,
    ) -> Result<Option<i32>, SessionError> {
        let Some(code) = self.reconciler.observe(termination) else {
            return Ok(None);
        };
        tracing::info!(code, "command finished");
        sink.send(Event::Exit { code }).await?;
        self.state = SessionState::Exited;
        Ok(Some(code))
    }
}

/// Wait until the waiter reports the killed child as reaped.
async fn wait_reaped(process_rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) {
    let reaped = async {
        while let Some(event) = process_rx.recv().await {
            if matches!(event, ProcessEvent::Exited { .. } | ProcessEvent::Closed { .. } | ProcessEvent::Failed { .. }) {
                return;
            }
        }
    };
    if tokio::time::timeout(REAP_TIMEOUT, reaped).await.is_err() {
        tracing::warn!("process not reaped after kill");
    }
}

/// Read what the client claims to have written. Any failure reads as no
/// proof at all.
///
/// The path comes from an unauthenticated peer, so only regular files are
/// opened, without blocking on open, and the whole read is time-limited.
async fn read_proof(path: &str) -> Option<String> {
    match tokio::time::timeout(PROOF_READ_TIMEOUT, read_regular_file(path)).await {
        Ok(Ok(proof)) => Some(proof),
        Ok(Err(e)) => {
            tracing::info!(%path, error = %e, "cannot read token file");
            None
        }
        Err(_) => {
            tracing::warn!(%path, "timed out reading token file");
            None
        }
    }
}

async fn read_regular_file(path: &str) -> std::io::Result<String> {
    if !tokio::fs::metadata(path).await?.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    // The path may have been swapped for a FIFO since the check.
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .await?;
    if !file.metadata().await?.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    let mut proof = String::new();
    file.take(MAX_PROOF_LEN).read_to_string(&mut proof).await?;
    Ok(proof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Decision;
    use crate::channel::{memory_pair, MemoryEnd};
    use crate::protocol::ExecRequest;
    use crate::supervisor::SupervisorError;
    use tokio::task::JoinHandle;

    fn allow_all(_: &ExecRequest, _: Option<IpAddr>) -> Decision {
        Decision::Allow
    }

    fn challenge_all(_: &ExecRequest, _: Option<IpAddr>) -> Decision {
        Decision::Challenge
    }

    fn start(policy: Arc<dyn AuthPolicy>) -> (MemoryEnd, JoinHandle<Result<i32, SessionError>>) {
        let (client, server) = memory_pair();
        let session = ExecSession::new(policy, std::env::temp_dir(), None);
        let handle = tokio::spawn(session.run(server.sink, server.stream));
        (client, handle)
    }

    fn exec(args: &[&str], cwd: Option<&str>) -> Event {
        Event::Exec(ExecRequest::new(
            args.iter().map(|s| s.to_string()).collect(),
            cwd.map(str::to_string),
        ))
    }

    async fn recv(client: &mut MemoryEnd) -> Event {
        tokio::time::timeout(Duration::from_secs(10), client.stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
            .expect("channel error")
    }

    /// Collect stdout and stderr until `exit`, then check the channel closes.
    async fn drain(client: &mut MemoryEnd) -> (String, String, i32) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        loop {
            match recv(client).await {
                Event::Stdout { data } => out.extend_from_slice(&data),
                Event::Stderr { data } => err.extend_from_slice(&data),
                Event::Exit { code } => {
                    let next = tokio::time::timeout(Duration::from_secs(5), client.stream.next())
                        .await
                        .expect("channel stayed open after exit");
                    assert!(next.is_none(), "event after exit: {next:?}");
                    return (
                        String::from_utf8(out).unwrap(),
                        String::from_utf8(err).unwrap(),
                        code,
                    );
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn allowed_request_runs_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().to_str().unwrap();
        let (mut client, handle) = start(Arc::new(allow_all));

        client.sink.send(exec(&["sh", "-c", "pwd; echo oops >&2; exit 4"], Some(cwd))).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);

        let (out, err, code) = drain(&mut client).await;
        assert_eq!(
            std::path::Path::new(out.trim_end()).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(err, "oops\n");
        assert_eq!(code, 4);
        assert_eq!(handle.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn challenge_then_login_runs_original_request() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle) = start(Arc::new(challenge_all));

        client.sink.send(exec(&["echo", "hi"], None)).await.unwrap();
        let Event::Deny { token } = recv(&mut client).await else {
            panic!("expected deny");
        };

        let proof = dir.path().join("proof");
        std::fs::write(&proof, &token).unwrap();
        client
            .sink
            .send(Event::Login {
                path: proof.to_string_lossy().into_owned(),
            })
            .await
            .unwrap();

        assert_eq!(recv(&mut client).await, Event::Allow);
        let (out, _, code) = drain(&mut client).await;
        assert_eq!(out, "hi\n");
        assert_eq!(code, 0);
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_login_reissues_a_new_token() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle) = start(Arc::new(challenge_all));

        client.sink.send(exec(&["true"], None)).await.unwrap();
        let Event::Deny { token: first } = recv(&mut client).await else {
            panic!("expected deny");
        };

        let proof = dir.path().join("proof");
        std::fs::write(&proof, "wrong").unwrap();
        let login = Event::Login {
            path: proof.to_string_lossy().into_owned(),
        };
        client.sink.send(login.clone()).await.unwrap();
        let Event::Deny { token: second } = recv(&mut client).await else {
            panic!("expected second deny");
        };
        assert_ne!(first, second);

        // Unreadable path is just another failed proof.
        client
            .sink
            .send(Event::Login {
                path: "/definitely/not/here".into(),
            })
            .await
            .unwrap();
        let Event::Deny { token: third } = recv(&mut client).await else {
            panic!("expected third deny");
        };

        std::fs::write(&proof, &third).unwrap();
        client.sink.send(login).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);
        assert_eq!(drain(&mut client).await.2, 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stdin_is_relayed_until_end() {
        let (mut client, handle) = start(Arc::new(allow_all));

        client.sink.send(exec(&["cat"], None)).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);
        client.sink.send(Event::Stdin { data: "ab".into() }).await.unwrap();
        client.sink.send(Event::Stdin { data: "c\n".into() }).await.unwrap();
        client.sink.send(Event::StdinEnd).await.unwrap();

        let (out, _, code) = drain(&mut client).await;
        assert_eq!(out, "abc\n");
        assert_eq!(code, 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn interrupt_terminates_process() {
        let (mut client, handle) = start(Arc::new(allow_all));

        client.sink.send(exec(&["sleep", "30"], None)).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);
        tokio::time::sleep(Duration::from_millis(100)).await;

        client.sink.send(Event::Signal { name: "SIGUSR1".into() }).await.unwrap();
        client.sink.send(ForwardedSignal::Interrupt.to_event()).await.unwrap();

        let (_, _, code) = drain(&mut client).await;
        assert_eq!(code, 143);
        assert_eq!(handle.await.unwrap().unwrap(), 143);
    }

    #[tokio::test]
    async fn empty_command_reports_error_and_sentinel() {
        let (mut client, handle) = start(Arc::new(allow_all));

        client.sink.send(exec(&[], None)).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);
        let (out, err, code) = drain(&mut client).await;
        assert!(out.is_empty());
        assert_eq!(err, "empty command\n");
        assert_eq!(code, 255);
        assert!(matches!(
            handle.await.unwrap(),
            Err(SessionError::Process(SupervisorError::EmptyCommand))
        ));
    }

    #[tokio::test]
    async fn stdin_before_allow_is_dropped() {
        let (mut client, handle) = start(Arc::new(allow_all));

        client.sink.send(Event::Stdin { data: "early".into() }).await.unwrap();
        client.sink.send(Event::StdinEnd).await.unwrap();
        client.sink.send(exec(&["sh", "-c", "echo ran"], None)).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);

        let (out, _, code) = drain(&mut client).await;
        assert_eq!(out, "ran\n");
        assert_eq!(code, 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disconnect_kills_running_process() {
        let (mut client, handle) = start(Arc::new(allow_all));

        client.sink.send(exec(&["sleep", "30"], None)).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);
        drop(client);

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session did not end after disconnect")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Disconnected)));
    }

    #[tokio::test]
    async fn background_child_does_not_hold_back_exit() {
        let (mut client, handle) = start(Arc::new(allow_all));

        client.sink.send(exec(&["sh", "-c", "sleep 20 & echo hi"], None)).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);

        let (out, _, code) = tokio::time::timeout(Duration::from_secs(5), drain(&mut client))
            .await
            .expect("exit held back by background child");
        assert_eq!(out, "hi\n");
        assert_eq!(code, 0);
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn login_pointing_at_fifo_is_a_failed_proof() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("proof");
        let c_path = std::ffi::CString::new(fifo.to_str().unwrap()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let (mut client, handle) = start(Arc::new(challenge_all));
        client.sink.send(exec(&["true"], None)).await.unwrap();
        let Event::Deny { token: first } = recv(&mut client).await else {
            panic!("expected deny");
        };

        client
            .sink
            .send(Event::Login {
                path: fifo.to_string_lossy().into_owned(),
            })
            .await
            .unwrap();
        let Event::Deny { token: second } =
            tokio::time::timeout(Duration::from_secs(3), recv(&mut client))
                .await
                .expect("login on a fifo stalled the session")
        else {
            panic!("expected a fresh deny");
        };
        assert_ne!(first, second);

        drop(client);
        let result = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("session did not end after disconnect")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Disconnected)));
    }

    #[tokio::test]
    async fn read_proof_rejects_non_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_proof(dir.path().to_str().unwrap()).await, None);

        let file = dir.path().join("token");
        std::fs::write(&file, "abc").unwrap();
        assert_eq!(read_proof(file.to_str().unwrap()).await.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn shutdown_kills_running_process() {
        let shutdown = CancellationToken::new();
        let (mut client, server) = memory_pair();
        let session = ExecSession::new(Arc::new(allow_all), std::env::temp_dir(), None)
            .with_shutdown(shutdown.clone());
        let handle = tokio::spawn(session.run(server.sink, server.stream));

        client.sink.send(exec(&["sh", "-c", "echo $$; exec sleep 30"], None)).await.unwrap();
        assert_eq!(recv(&mut client).await, Event::Allow);
        let Event::Stdout { data } = recv(&mut client).await else {
            panic!("expected the pid on stdout");
        };
        let pid: i32 = std::str::from_utf8(&data).unwrap().trim().parse().unwrap();

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session did not end on shutdown")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Shutdown)));
        // Reaped before `run` returned, so the pid is gone.
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }
}
