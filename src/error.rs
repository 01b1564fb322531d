// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed error values carried inside the `anyhow` chain.
//!
//! Plumbing code returns `anyhow::Result` everywhere; the values below are
//! bailed into the chain at the point of failure and recovered later with
//! `downcast_ref` (see [`ErrorKindExt`]). The SDAM issue classifier and the
//! retry paths only ever look at these types, never at message text.

use bson::Document;
use thiserror::Error;

use crate::{cfg::config::ServerAddress, sdam::description::TopologyVersion};

/// Server error codes that indicate the node is no longer primary.
pub const NOT_PRIMARY_CODES: &[i32] = &[10107, 13435, 10058];
/// Server error codes that indicate the node is recovering or shutting down.
pub const RECOVERING_CODES: &[i32] = &[11600, 11602, 13436, 189, 91];
/// Subset of the recovering codes that mean the process is going away.
pub const SHUTDOWN_CODES: &[i32] = &[91, 11600];
/// Server error code for an exceeded server-side execution budget.
pub const EXCEEDED_TIME_LIMIT_CODE: i32 = 50;
/// Server error code for a failed authentication attempt.
pub const AUTHENTICATION_FAILED_CODE: i32 = 18;
/// Server error code for an unknown user.
pub const USER_NOT_FOUND_CODE: i32 = 11;

/// Transport failure kinds, one per distinct I/O outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ConnectRefused,
    OpenFailure,
    PrematureEof,
    ReadTimeout,
    WriteFailure,
    SocksProtocolViolation,
    TlsHandshake,
}

/// A failure observed on the socket itself, before any command semantics.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} talking to {address}: {message}")]
pub struct TransportError {
    pub kind: TransportKind,
    pub address: ServerAddress,
    pub message: String,
}

impl TransportError {
    pub fn new(
        kind: TransportKind,
        address: ServerAddress,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            address,
            message: message.into(),
        }
    }

    /// Read-timeout errors are handled more gently than other socket errors:
    /// they indicate overload rather than a dead server.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, TransportKind::ReadTimeout)
    }
}

/// A violation of the wire format itself. Fatal to the round-trip and never
/// retried on the same stream.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("framing violation: {0}")]
    Framing(String),
    #[error("failed to decode reply: {0}")]
    ReplyDecode(String),
    #[error("invalid SASL conversation: {0}")]
    Sasl(String),
    #[error("compressor id {0} is not supported by this build")]
    UnsupportedCompressor(u8),
}

/// An error document returned by the server for a command.
#[derive(Debug, Clone, Error)]
#[error("command failed with code {code} ({code_name}): {message}")]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: Vec<String>,
    /// Topology revision the server stamped on the error, when present.
    /// Consumed by the staleness check in the SDAM classifier.
    pub topology_version: Option<TopologyVersion>,
}

impl CommandError {
    pub fn is_not_primary(&self) -> bool {
        NOT_PRIMARY_CODES.contains(&self.code)
    }

    pub fn is_recovering(&self) -> bool {
        RECOVERING_CODES.contains(&self.code)
    }

    pub fn is_shutdown(&self) -> bool {
        SHUTDOWN_CODES.contains(&self.code)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.code == AUTHENTICATION_FAILED_CODE
    }
}

/// A command that succeeded on the server but reported a write-concern
/// failure. Carries the full server response so callers can still read the
/// write results; unwrapped at the protocol boundary.
#[derive(Debug, Clone, Error)]
#[error("write concern error {code}: {message}")]
pub struct WriteConcernCarrier {
    pub code: i32,
    pub message: String,
    pub response: Document,
}

/// The operation observed a primary older than one the topology already saw.
#[derive(Debug, Clone, Error)]
#[error("stale primary reported by {address}")]
pub struct StalePrimaryError {
    pub address: ServerAddress,
}

/// The connection pool was cleared while the operation held (or waited for)
/// one of its connections. Retryable against the same server, so attempt
/// bookkeeping treats it differently from an ordinary failure.
#[derive(Debug, Clone, Error)]
#[error("connection pool for {address} was cleared (generation {generation})")]
pub struct PoolClearedError {
    pub address: ServerAddress,
    pub generation: u32,
}

/// Authentication and credential handling failures. Never retried by the
/// connection layer. The offending credential is identified by user and
/// source database only; secrets never enter an error.
#[derive(Debug, Clone, Error)]
pub enum SecurityError {
    #[error("authentication mechanism {mechanism} is not supported")]
    MechanismUnsupported { mechanism: String },
    #[error("failed to look up security principal for '{user}': {message}")]
    PrincipalLookup { user: String, message: String },
    #[error("invalid SASL conversation for '{user}@{source_db}': {message}")]
    SaslConversation {
        user: String,
        source_db: String,
        message: String,
    },
    #[error("host '{host}' is not covered by the allowed callback hosts")]
    AllowedHostDenied { host: String },
    #[error("authentication failed for '{user}@{source_db}': {message}")]
    AuthenticationFailed {
        user: String,
        source_db: String,
        message: String,
    },
}

/// A problem with the client configuration, detected either up front or the
/// first time the offending setting is exercised. Never retried.
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    #[error("load-balanced SRV lookup resolved to {count} hosts, expected exactly one")]
    MultipleSrvHosts { count: usize },
    #[error("snapshot reads require wire version {min}, server supports {actual}")]
    SnapshotWireVersion { min: i32, actual: i32 },
    #[error("allowed-host pattern '{pattern}' may only use a single leading wildcard")]
    AllowedHostWildcard { pattern: String },
    #[error("{0}")]
    Other(String),
}

/// Cooperative-cancellation outcomes.
#[derive(Debug, Clone, Error)]
pub enum Cancellation {
    #[error("operation interrupted")]
    Interrupted,
    #[error("shutdown in progress")]
    ShutdownInProgress,
    #[error("deadline expired{}", .context.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    DeadlineExpired { context: Option<String> },
}

impl Cancellation {
    pub fn deadline() -> Self {
        Self::DeadlineExpired { context: None }
    }

    pub fn deadline_with(context: impl Into<String>) -> Self {
        Self::DeadlineExpired {
            context: Some(context.into()),
        }
    }
}

/// Downcast helpers over `anyhow::Error` so call sites classify by kind
/// without touching message text.
pub trait ErrorKindExt {
    fn transport(&self) -> Option<&TransportError>;
    fn protocol(&self) -> Option<&ProtocolError>;
    fn command(&self) -> Option<&CommandError>;
    fn write_concern(&self) -> Option<&WriteConcernCarrier>;
    fn security(&self) -> Option<&SecurityError>;
    fn configuration(&self) -> Option<&ConfigurationError>;
    fn cancellation(&self) -> Option<&Cancellation>;
    fn stale_primary(&self) -> Option<&StalePrimaryError>;
    fn pool_cleared(&self) -> Option<&PoolClearedError>;
}

impl ErrorKindExt for anyhow::Error {
    fn transport(&self) -> Option<&TransportError> {
        self.downcast_ref()
    }

    fn protocol(&self) -> Option<&ProtocolError> {
        self.downcast_ref()
    }

    fn command(&self) -> Option<&CommandError> {
        self.downcast_ref()
    }

    fn write_concern(&self) -> Option<&WriteConcernCarrier> {
        self.downcast_ref()
    }

    fn security(&self) -> Option<&SecurityError> {
        self.downcast_ref()
    }

    fn configuration(&self) -> Option<&ConfigurationError> {
        self.downcast_ref()
    }

    fn cancellation(&self) -> Option<&Cancellation> {
        self.downcast_ref()
    }

    fn stale_primary(&self) -> Option<&StalePrimaryError> {
        self.downcast_ref()
    }

    fn pool_cleared(&self) -> Option<&PoolClearedError> {
        self.downcast_ref()
    }
}
