//! Named-event protocol spoken between the client and the executor.
//!
//! Wire format: one JSON text message per event, tagged by `"event"`.
//! Byte payloads are base64-encoded. Messages are decoded into [`Event`]
//! once, at the transport boundary.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Exit code used when no real exit status is available.
pub const SENTINEL_EXIT_CODE: i32 = 255;

/// Client → Server: what to run and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Executable followed by its arguments, already in the executor's namespace.
    pub args: Vec<String>,
    /// Working directory in the executor's namespace; `None` means home.
    pub cwd: Option<String>,
}

impl ExecRequest {
    pub fn new(args: Vec<String>, cwd: Option<String>) -> Self {
        Self { args, cwd }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Exec(ExecRequest),
    Allow,
    Deny {
        token: String,
    },
    Login {
        path: String,
    },
    Signal {
        name: String,
    },
    Stdin {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    #[serde(rename = "stdin.end")]
    StdinEnd,
    Stdout {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    Stderr {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    Exit {
        code: i32,
    },
}

impl Event {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Event name as it appears on the wire, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Exec(_) => "exec",
            Event::Allow => "allow",
            Event::Deny { .. } => "deny",
            Event::Login { .. } => "login",
            Event::Signal { .. } => "signal",
            Event::Stdin { .. } => "stdin",
            Event::StdinEnd => "stdin.end",
            Event::Stdout { .. } => "stdout",
            Event::Stderr { .. } => "stderr",
            Event::Exit { .. } => "exit",
        }
    }
}

/// The signals that travel over the channel. Anything else stays local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardedSignal {
    Hangup,
    Interrupt,
    Terminate,
}

impl ForwardedSignal {
    pub const ALL: [ForwardedSignal; 3] = [
        ForwardedSignal::Hangup,
        ForwardedSignal::Interrupt,
        ForwardedSignal::Terminate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ForwardedSignal::Hangup => "SIGHUP",
            ForwardedSignal::Interrupt => "SIGINT",
            ForwardedSignal::Terminate => "SIGTERM",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    pub fn number(self) -> i32 {
        match self {
            ForwardedSignal::Hangup => libc::SIGHUP,
            ForwardedSignal::Interrupt => libc::SIGINT,
            ForwardedSignal::Terminate => libc::SIGTERM,
        }
    }

    /// The signal the child actually receives. SIGINT arrives as SIGTERM.
    pub fn delivered(self) -> Self {
        match self {
            ForwardedSignal::Interrupt => ForwardedSignal::Terminate,
            other => other,
        }
    }

    pub fn to_event(self) -> Event {
        Event::Signal {
            name: self.name().to_string(),
        }
    }
}

impl std::fmt::Display for ForwardedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Conventional shell exit code for a process killed by `signal`.
pub fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}

/// Serde helper for base64-encoded byte payloads in JSON.
mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
