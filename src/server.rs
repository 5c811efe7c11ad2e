//! Executor WebSocket server.
//!
//! Serves a single `/exec` endpoint. Every upgraded connection gets its own
//! [`ExecSession`], run inside a `session` tracing span carrying a fresh id
//! and the peer address.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{future, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::auth::AuthPolicy;
use crate::channel::{ChannelError, EventSink, EventStream};
use crate::error::SessionError;
use crate::protocol::Event;
use crate::session::ExecSession;

#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<dyn AuthPolicy>,
    /// Working directory for requests that carry none.
    pub home: Arc<PathBuf>,
    /// Upgraded connections outlive axum's graceful shutdown, so sessions
    /// are tracked here and ended through `shutdown`.
    sessions: TaskTracker,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(policy: Arc<dyn AuthPolicy>, home: PathBuf) -> Self {
        Self {
            policy,
            home: Arc::new(home),
            sessions: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl From<axum::Error> for ChannelError {
    fn from(e: axum::Error) -> Self {
        ChannelError::Transport(Box::new(e))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/exec", get(exec_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Accept connections until `cancel` fires, then end every running session
/// and wait for their commands to be killed.
pub async fn serve(
    listener: TcpListener,
    mut state: AppState,
    cancel: CancellationToken,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "executor listening");

    state.shutdown = cancel.clone();
    let sessions = state.sessions.clone();

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;

    sessions.close();
    if !sessions.is_empty() {
        tracing::info!(count = sessions.len(), "ending running sessions");
    }
    sessions.wait().await;
    Ok(())
}

async fn exec_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| sessions.track_future(handle_exec_socket(socket, state, peer)))
}

async fn handle_exec_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let (sink, events) = split_socket(socket);
    let session = ExecSession::new(
        state.policy.clone(),
        state.home.as_ref().clone(),
        Some(peer.ip()),
    )
    .with_shutdown(state.shutdown.clone());
    let span = tracing::info_span!("session", id = %session.id(), %peer);

    async move {
        tracing::info!("client connected");
        match session.run(sink, events).await {
            Ok(code) => tracing::info!(code, "session finished"),
            Err(SessionError::Disconnected) => {
                tracing::info!("client disconnected before the command exited")
            }
            Err(SessionError::Shutdown) => tracing::info!("session ended by shutdown"),
            Err(e) => tracing::warn!(error = %e, "session ended with error"),
        }
    }
    .instrument(span)
    .await
}

/// Adapt an upgraded socket to the session's event channel.
pub fn split_socket(socket: WebSocket) -> (EventSink, EventStream) {
    let (tx, rx) = socket.split();

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
            // Ping, pong and close are handled by the socket itself.
            Ok(_) => None,
            Err(e) => Some(Err(ChannelError::from(e))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}
