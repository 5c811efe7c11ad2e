use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::protocol::{signal_exit_code, ForwardedSignal, SENTINEL_EXIT_CODE};
use crate::supervisor::SupervisorError;

/// One of the three standard streams, on whichever side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl std::fmt::Display for StdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StdStream::Stdin => "stdin",
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        })
    }
}

/// Everything that can end a session early. Every variant is terminal.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot prove access: {} is not covered by any path mapping", .0.display())]
    MappingChannel(PathBuf),

    #[error("failed to write token file {}: {source}", .path.display())]
    TokenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{stream} i/o error: {source}")]
    StreamIo {
        stream: StdStream,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Process(#[from] SupervisorError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("interrupted by {0} before the command started")]
    Interrupted(ForwardedSignal),

    #[error("connection closed before the command exited")]
    Disconnected,

    #[error("executor shutting down")]
    Shutdown,
}

impl SessionError {
    pub fn stream_io(stream: StdStream, source: io::Error) -> Self {
        SessionError::StreamIo { stream, source }
    }

    /// Exit code the client reports when the session ends with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Interrupted(signal) => signal_exit_code(signal.number()),
            _ => SENTINEL_EXIT_CODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_sentinel_exit_code() {
        assert_eq!(SessionError::Disconnected.exit_code(), 255);
        assert_eq!(
            SessionError::MappingChannel(PathBuf::from("/tmp/x")).exit_code(),
            255
        );
        assert_eq!(
            SessionError::stream_io(StdStream::Stdout, io::ErrorKind::BrokenPipe.into()).exit_code(),
            255
        );
    }

    #[test]
    fn interruption_maps_to_signal_exit_code() {
        assert_eq!(SessionError::Interrupted(ForwardedSignal::Interrupt).exit_code(), 130);
        assert_eq!(SessionError::Interrupted(ForwardedSignal::Hangup).exit_code(), 129);
    }

    #[test]
    fn stream_io_message_names_stream() {
        let err = SessionError::stream_io(StdStream::Stdin, io::Error::other("boom"));
        assert_eq!(err.to_string(), "stdin i/o error: boom");
    }
}
