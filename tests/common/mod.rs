#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use rexec::auth::{AuthPolicy, TrustedPeers};
use rexec::client::{InputChunk, LocalIo};
use rexec::server::{self, AppState};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running executor on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
    pub task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("ws://{}/exec", self.addr)
    }

    /// Cancel the server and wait for `serve` to return.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(10), &mut self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start an executor with the given policy. Requests without a working
/// directory run in `home`.
pub async fn start_server(policy: Arc<dyn AuthPolicy>, home: &Path) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let state = AppState::new(policy, home.to_path_buf());
    let task = tokio::spawn(server::serve(listener, state, cancel.clone()));
    TestServer { addr, cancel, task }
}

/// Loopback connections run without a challenge.
pub fn trust_loopback() -> Arc<dyn AuthPolicy> {
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();
    Arc::new(TrustedPeers::new(vec![loopback]))
}

/// Every connection is challenged.
pub fn trust_nobody() -> Arc<dyn AuthPolicy> {
    Arc::new(TrustedPeers::default())
}

/// In-memory stand-in for the terminal the client would relay.
pub struct CapturedIo {
    pub io: LocalIo<Vec<u8>, Vec<u8>>,
    pub stdin: mpsc::Sender<InputChunk>,
    pub signals: mpsc::Sender<rexec::protocol::ForwardedSignal>,
}

pub fn captured_io() -> CapturedIo {
    let (stdin_tx, stdin) = mpsc::channel(16);
    let (signal_tx, signals) = mpsc::channel(4);
    CapturedIo {
        io: LocalIo {
            stdin,
            signals,
            stdout: Vec::new(),
            stderr: Vec::new(),
        },
        stdin: stdin_tx,
        signals: signal_tx,
    }
}

pub fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
