//! Client side of a remote execution session.
//!
//! Connects to the executor's `/exec` endpoint, sends the (path-mapped)
//! request, answers token challenges through the shared filesystem, and
//! then relays local stdin and signals out and remote output back until the
//! executor reports the exit code.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::channel::{ChannelError, EventSink, EventStream};
use crate::config::ClientSettings;
use crate::error::{SessionError, StdStream};
use crate::mapping::PathMapper;
use crate::protocol::{Event, ExecRequest, ForwardedSignal};
use crate::session::SessionState;
use crate::token::{TokenFile, TokenGenerator};

const STDIN_BUF_SIZE: usize = 4096;

/// One read from local stdin.
#[derive(Debug)]
pub enum InputChunk {
    Data(Bytes),
    End,
    Failed(io::Error),
}

/// The local side the session relays to and from.
pub struct LocalIo<O, E> {
    pub stdin: mpsc::Receiver<InputChunk>,
    pub signals: mpsc::Receiver<ForwardedSignal>,
    pub stdout: O,
    pub stderr: E,
}

impl LocalIo<tokio::io::Stdout, tokio::io::Stderr> {
    /// The process's own stdio and signals. Must be called inside the runtime.
    pub fn stdio() -> Self {
        Self {
            stdin: spawn_stdin_reader(),
            signals: spawn_signal_listener(),
            stdout: tokio::io::stdout(),
            stderr: tokio::io::stderr(),
        }
    }
}

impl From<tungstenite::Error> for ChannelError {
    fn from(e: tungstenite::Error) -> Self {
        ChannelError::Transport(Box::new(e))
    }
}

/// Open a WebSocket to `url` and adapt it to the session's event channel.
pub async fn connect(url: &str) -> Result<(EventSink, EventStream), ChannelError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    let (tx, rx) = ws.split();

    let sink = tx.sink_map_err(ChannelError::from).with(|event: Event| {
        future::ready(
            event
                .encode()
                .map(|text| Message::Text(text.into()))
                .map_err(ChannelError::from),
        )
    });

    let stream = rx.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Event::decode(text.as_str()).map_err(ChannelError::from)),
            Ok(Message::Binary(data)) => Some(Err(ChannelError::UnexpectedBinary(data.len()))),
            Ok(_) => None,
            Err(e) => Some(Err(ChannelError::from(e))),
        })
    });

    Ok((Box::pin(sink), Box::pin(stream)))
}

/// Map path-like arguments into the executor's namespace.
///
/// The program name is left alone. Any other argument naming an existing
/// local file is resolved to its real path and then mapped.
pub fn rewrite_args(mapper: &PathMapper, args: Vec<String>) -> Vec<String> {
    let mut args = args.into_iter();
    let Some(program) = args.next() else {
        return Vec::new();
    };
    std::iter::once(program)
        .chain(args.map(|arg| match std::fs::canonicalize(&arg) {
            Ok(real) => mapper.to_remote(&real.to_string_lossy()),
            Err(_) => arg,
        }))
        .collect()
}

/// Working directory to request, or `None` (executor's home) when no rule
/// covers `cwd`.
pub fn detect_cwd(mapper: &PathMapper, cwd: &Path) -> Option<String> {
    let local = cwd.to_string_lossy();
    let remote = mapper.to_remote(&local);
    (remote != local).then_some(remote)
}

/// Read local stdin on a blocking thread.
pub fn spawn_stdin_reader() -> mpsc::Receiver<InputChunk> {
    let (tx, rx) = mpsc::channel(64);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; STDIN_BUF_SIZE];
        loop {
            let chunk = match stdin.read(&mut buf) {
                Ok(0) => InputChunk::End,
                Ok(n) => InputChunk::Data(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => InputChunk::Failed(e),
            };
            let last = !matches!(chunk, InputChunk::Data(_));
            if tx.blocking_send(chunk).is_err() || last {
                break;
            }
        }
    });
    rx
}

fn install_signal_handlers() -> io::Result<(Signal, Signal, Signal)> {
    Ok((
        signal(SignalKind::hangup())?,
        signal(SignalKind::interrupt())?,
        signal(SignalKind::terminate())?,
    ))
}

/// Catch SIGHUP, SIGINT and SIGTERM so they can be forwarded instead of
/// killing the client.
///
/// Handlers are installed before returning; if that fails the returned
/// channel is already closed and signals keep their default action.
pub fn spawn_signal_listener() -> mpsc::Receiver<ForwardedSignal> {
    let (tx, rx) = mpsc::channel(8);
    let (mut hangup, mut interrupt, mut terminate) = match install_signal_handlers() {
        Ok(handlers) => handlers,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install signal handlers, signals will not be forwarded");
            return rx;
        }
    };

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = hangup.recv() => ForwardedSignal::Hangup,
                Some(()) = interrupt.recv() => ForwardedSignal::Interrupt,
                Some(()) = terminate.recv() => ForwardedSignal::Terminate,
                else => break,
            };
            if tx.send(received).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Run `args` on the executor described by `settings`, with `cwd` as the
/// local working directory. Returns the remote exit code.
pub async fn execute(
    settings: &ClientSettings,
    args: Vec<String>,
    cwd: PathBuf,
) -> Result<i32, SessionError> {
    let request = ExecRequest::new(
        rewrite_args(&settings.mapper, args),
        detect_cwd(&settings.mapper, &cwd),
    );
    let url = settings.endpoint_url();
    tracing::debug!(%url, ?request, "connecting to executor");

    let (sink, events) = connect(&url).await?;
    let mut io = LocalIo::stdio();
    ClientSession::new(request, settings.mapper.clone(), cwd)
        .run(&mut io, sink, events)
        .await
}

pub struct ClientSession {
    state: SessionState,
    request: ExecRequest,
    mapper: Arc<PathMapper>,
    /// Where token files are written.
    token_dir: PathBuf,
    tokens: TokenGenerator,
    token_file: Option<TokenFile>,
}

impl ClientSession {
    pub fn new(request: ExecRequest, mapper: Arc<PathMapper>, token_dir: PathBuf) -> Self {
        Self {
            state: SessionState::Connecting,
            request,
            mapper,
            token_dir,
            tokens: TokenGenerator,
            token_file: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion.
    ///
    /// `Ok` carries the exit code the executor reported. Every error
    /// (including a disconnect before `exit`) maps to an exit code through
    /// [`SessionError::exit_code`].
    pub async fn run<O, E>(
        mut self,
        io: &mut LocalIo<O, E>,
        mut sink: EventSink,
        mut events: EventStream,
    ) -> Result<i32, SessionError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let LocalIo {
            stdin,
            signals,
            stdout,
            stderr,
        } = io;

        sink.send(Event::Exec(self.request.clone())).await?;
        self.state = SessionState::AwaitingAuth;
        let mut stdin_open = true;

        let result = loop {
            let executing = self.state == SessionState::Executing;
            tokio::select! {
                inbound = events.next() => match inbound {
                    None => break Err(SessionError::Disconnected),
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(event)) => {
                        match self.on_event(event, &mut sink, &mut *stdout, &mut *stderr).await {
                            Ok(Some(code)) => break Ok(code),
                            Ok(None) => {}
                            Err(e) => break Err(e),
                        }
                    }
                },
                chunk = stdin.recv(), if executing && stdin_open => {
                    let event = match chunk {
                        Some(InputChunk::Data(data)) => Event::Stdin { data },
                        Some(InputChunk::End) | None => {
                            stdin_open = false;
                            Event::StdinEnd
                        }
                        Some(InputChunk::Failed(e)) => {
                            break Err(SessionError::stream_io(StdStream::Stdin, e))
                        }
                    };
                    if let Err(e) = sink.send(event).await {
                        break Err(e.into());
                    }
                },
                Some(received) = signals.recv() => {
                    if !executing {
                        tracing::info!(signal = %received, "interrupted before the command started");
                        break Err(SessionError::Interrupted(received));
                    }
                    tracing::debug!(signal = %received, "forwarding signal");
                    if let Err(e) = sink.send(received.to_event()).await {
                        break Err(e.into());
                    }
                }
            }
        };

        self.state = SessionState::Disconnected;
        self.token_file = None;
        let _ = sink.close().await;
        result
    }

    async fn on_event<O, E>(
        &mut self,
        event: Event,
        sink: &mut EventSink,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<Option<i32>, SessionError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        match event {
            Event::Allow if self.state != SessionState::Executing => {
                tracing::debug!("command allowed");
                self.state = SessionState::Executing;
                self.token_file = None;
                Ok(None)
            }
            Event::Deny { token }
                if matches!(
                    self.state,
                    SessionState::AwaitingAuth | SessionState::Authenticating
                ) =>
            {
                let path = self.answer_challenge(&token)?;
                self.state = SessionState::Authenticating;
                sink.send(Event::Login { path }).await?;
                Ok(None)
            }
            Event::Stdout { data } => {
                write_local(stdout, &data, StdStream::Stdout).await?;
                Ok(None)
            }
            Event::Stderr { data } => {
                write_local(stderr, &data, StdStream::Stderr).await?;
                Ok(None)
            }
            Event::Exit { code } => {
                tracing::debug!(code, "command exited");
                self.state = SessionState::Exited;
                Ok(Some(code))
            }
            other => {
                tracing::warn!(event = other.name(), state = ?self.state, "ignoring unexpected event");
                Ok(None)
            }
        }
    }

    /// Write `token` where the executor can see it and return the
    /// executor-side path. Replaces any previous token file.
    fn answer_challenge(&mut self, token: &str) -> Result<String, SessionError> {
        let local = self.tokens.file_path(&self.token_dir);
        let local_str = local.to_string_lossy().into_owned();
        let remote = self.mapper.to_remote(&local_str);
        if remote == local_str {
            return Err(SessionError::MappingChannel(self.token_dir.clone()));
        }

        let file = TokenFile::create(local.clone(), token)
            .map_err(|source| SessionError::TokenFile { path: local, source })?;
        tracing::debug!(local = %file.path().display(), %remote, "wrote token file");
        self.token_file = Some(file);
        Ok(remote)
    }
}

async fn write_local<W>(out: &mut W, data: &[u8], stream: StdStream) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(data)
        .await
        .map_err(|e| SessionError::stream_io(stream, e))?;
    out.flush()
        .await
        .map_err(|e| SessionError::stream_io(stream, e))
}
