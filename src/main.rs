//! rexec - run a command on the machine you are logged in from.
//!
//! ## Modes
//!
//! **Default** (`rexec <command> [args...]`): Connects to the executor,
//! runs the command there with path-mapped arguments and working directory,
//! relays stdio and signals, and exits with the remote exit code.
//!
//! **Server mode** (`rexec server`): Runs the executor, accepting one
//! command per WebSocket connection on `/exec`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rexec::auth::TrustedPeers;
use rexec::config::{self, ClientSettings, Config, ConfigError, HOST_ENV_VAR};
use rexec::error::SessionError;
use rexec::protocol::SENTINEL_EXIT_CODE;
use rexec::{client, server};

/// rexec - run a command on the machine you are logged in from
///
/// Paths in the arguments and the working directory are rewritten through
/// the configured mappings so the command sees the same files remotely.
#[derive(ClapParser, Debug)]
#[command(
    name = "rexec",
    version,
    about,
    long_about = None,
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to $XDG_CONFIG_HOME/rexec/config.toml)
    #[arg(long, env = "REXEC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Executor host (overrides the config file and SSH_CLIENT)
    #[arg(long)]
    host: Option<String>,

    /// Executor port
    #[arg(long, short)]
    port: Option<u16>,

    /// Command and arguments to run on the executor
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    args: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the executor
    Server {
        /// Address to listen on (overrides the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
}

#[derive(Debug, Error)]
pub enum RexecError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RexecError {
    fn exit_code(&self) -> i32 {
        match self {
            RexecError::Session(e) => e.exit_code(),
            _ => SENTINEL_EXIT_CODE,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Server { bind }) => {
            init_tracing("rexec=info,tower_http=info");
            run_server(cli.config, bind).await.map(|()| 0)
        }
        None => {
            init_tracing("rexec=warn");
            run_client(cli.config, cli.host, cli.port, cli.args).await
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rexec: {e}");
            e.exit_code()
        }
    };
    // Exit directly: the blocking stdin reader would otherwise hold the
    // runtime open.
    std::process::exit(code);
}

/// Initialize tracing on stderr; stdout carries the remote command's output.
fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    match path.or_else(config::default_config_path) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            Config::load(&path)
        }
        None => Ok(Config::default()),
    }
}

// ── Client mode ────────────────────────────────────────────────────

async fn run_client(
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    args: Vec<String>,
) -> Result<i32, RexecError> {
    let config = load_config(config_path)?;
    let ssh_client = std::env::var(HOST_ENV_VAR).ok();
    let settings = ClientSettings::resolve(&config, host, port, ssh_client.as_deref())?;
    let cwd = std::env::current_dir()?;

    Ok(client::execute(&settings, args, cwd).await?)
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config_path: Option<PathBuf>, bind: Option<SocketAddr>) -> Result<(), RexecError> {
    let config = load_config(config_path)?;
    let addr = bind.unwrap_or_else(|| config.server.bind_addr());

    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    if !config.server.trusted.is_empty() {
        tracing::info!(trusted = ?config.server.trusted, "trusted peers skip the token check");
    }
    let policy = Arc::new(TrustedPeers::new(config.server.trusted.clone()));
    let state = server::AppState::new(policy, home);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| RexecError::Bind { addr, source })?;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C");
        }
        ctrl_c_cancel.cancel();
    });

    server::serve(listener, state, cancel).await?;
    tracing::info!("executor stopped");
    Ok(())
}
