//! Executor side of the `exec` / `allow` / `deny` / `login` exchange.
//!
//! A request is either allowed outright by the [`AuthPolicy`] or answered
//! with a challenge token. The client proves it can write somewhere the
//! executor can read by dropping the token in a file and sending back that
//! file's path. Each challenge is single-use: a failed login mints a new one.

use std::net::IpAddr;

use subtle::ConstantTimeEq;

use crate::protocol::ExecRequest;
use crate::token::TokenGenerator;

/// Outcome of evaluating a request against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Challenge,
}

/// Pluggable authorization predicate.
pub trait AuthPolicy: Send + Sync {
    fn evaluate(&self, request: &ExecRequest, peer: Option<IpAddr>) -> Decision;
}

impl<F> AuthPolicy for F
where
    F: Fn(&ExecRequest, Option<IpAddr>) -> Decision + Send + Sync,
{
    fn evaluate(&self, request: &ExecRequest, peer: Option<IpAddr>) -> Decision {
        self(request, peer)
    }
}

/// Allows configured peer addresses, challenges everyone else.
#[derive(Debug, Clone, Default)]
pub struct TrustedPeers {
    peers: Vec<IpAddr>,
}

impl TrustedPeers {
    pub fn new(peers: Vec<IpAddr>) -> Self {
        Self { peers }
    }
}

impl AuthPolicy for TrustedPeers {
    fn evaluate(&self, _request: &ExecRequest, peer: Option<IpAddr>) -> Decision {
        match peer {
            Some(ip) if self.peers.iter().any(|p| *p == ip.to_canonical()) => Decision::Allow,
            _ => Decision::Challenge,
        }
    }
}

/// What the session should do after feeding the handshake a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send `allow` and run this request.
    Allow(ExecRequest),
    /// Send `deny` with this token.
    Deny(String),
    /// Out-of-phase message; nothing to send.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    AwaitingExec,
    Challenged { request: ExecRequest, token: String },
    Allowed,
}

#[derive(Debug)]
pub struct Handshake {
    phase: Phase,
    tokens: TokenGenerator,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingExec,
            tokens: TokenGenerator,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.phase == Phase::Allowed
    }

    pub fn is_challenged(&self) -> bool {
        matches!(self.phase, Phase::Challenged { .. })
    }

    /// Handle an `exec` request.
    pub fn on_exec(
        &mut self,
        request: ExecRequest,
        policy: &dyn AuthPolicy,
        peer: Option<IpAddr>,
    ) -> HandshakeStep {
        if self.phase != Phase::AwaitingExec {
            tracing::warn!("ignoring repeated exec request");
            return HandshakeStep::Ignore;
        }

        match policy.evaluate(&request, peer) {
            Decision::Allow => {
                self.phase = Phase::Allowed;
                HandshakeStep::Allow(request)
            }
            Decision::Challenge => self.challenge(request),
        }
    }

    /// Handle a `login`, given whatever could be read from the named file
    /// (`None` if it could not be read at all).
    pub fn on_login(&mut self, proof: Option<&str>) -> HandshakeStep {
        let (request, token) = match std::mem::replace(&mut self.phase, Phase::AwaitingExec) {
            Phase::Challenged { request, token } => (request, token),
            other => {
                self.phase = other;
                tracing::warn!("ignoring login without an outstanding challenge");
                return HandshakeStep::Ignore;
            }
        };

        if proof.is_some_and(|p| tokens_match(p, &token)) {
            self.phase = Phase::Allowed;
            HandshakeStep::Allow(request)
        } else {
            tracing::info!("login proof rejected, issuing a new challenge");
            self.challenge(request)
        }
    }

    fn challenge(&mut self, request: ExecRequest) -> HandshakeStep {
        let token = self.tokens.token();
        self.phase = Phase::Challenged {
            request,
            token: token.clone(),
        };
        HandshakeStep::Deny(token)
    }
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
