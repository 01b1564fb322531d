// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Authentication mechanism selector.
///
/// The names follow the SASL mechanism registry used on the wire. When the
/// config omits the mechanism, the handshake advertises
/// `saslSupportedMechs` and picks from the server's answer.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    #[serde(rename = "PLAIN", alias = "plain")]
    Plain,
    #[serde(rename = "MONGODB-CR", alias = "mongodb-cr")]
    NativeCr,
    #[serde(rename = "SCRAM-SHA-1", alias = "scram-sha-1")]
    ScramSha1,
    #[serde(rename = "SCRAM-SHA-256", alias = "scram-sha-256")]
    ScramSha256,
    #[serde(rename = "MONGODB-OIDC", alias = "mongodb-oidc")]
    Oidc,
}

impl AuthMechanism {
    /// Wire-level mechanism name used in `saslStart` and
    /// `saslSupportedMechs` matching.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::NativeCr => "MONGODB-CR",
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
            AuthMechanism::Oidc => "MONGODB-OIDC",
        }
    }

    pub fn from_mechanism_name(name: &str) -> Option<Self> {
        Some(match name {
            "PLAIN" => AuthMechanism::Plain,
            "MONGODB-CR" => AuthMechanism::NativeCr,
            "SCRAM-SHA-1" => AuthMechanism::ScramSha1,
            "SCRAM-SHA-256" => AuthMechanism::ScramSha256,
            "MONGODB-OIDC" => AuthMechanism::Oidc,
            _ => return None,
        })
    }

    /// Mechanisms that run through the generic SASL conversation.
    pub fn is_sasl(&self) -> bool {
        !matches!(self, AuthMechanism::NativeCr)
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire compressor names offered during the handshake.
///
/// Ids are assigned by the wire protocol; `Noop` is the id-0 pass-through
/// used mostly by tests and debugging proxies.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressorName {
    #[serde(rename = "noop")]
    Noop,
    #[serde(rename = "snappy")]
    Snappy,
    #[serde(rename = "zlib")]
    Zlib,
    #[serde(rename = "zstd")]
    Zstd,
}

impl CompressorName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressorName::Noop => "noop",
            CompressorName::Snappy => "snappy",
            CompressorName::Zlib => "zlib",
            CompressorName::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "noop" => CompressorName::Noop,
            "snappy" => CompressorName::Snappy,
            "zlib" => CompressorName::Zlib,
            "zstd" => CompressorName::Zstd,
            _ => return None,
        })
    }

    /// Whether this build can actually encode/decode the compressor.
    pub fn is_supported(&self) -> bool {
        matches!(self, CompressorName::Noop | CompressorName::Zlib)
    }
}

impl fmt::Display for CompressorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the topology was constructed from configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    #[serde(rename = "Single", alias = "single")]
    Single,
    #[serde(rename = "Multiple", alias = "multiple")]
    Multiple,
    #[serde(rename = "LoadBalanced", alias = "load_balanced")]
    LoadBalanced,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionMode::Single => "Single",
            ConnectionMode::Multiple => "Multiple",
            ConnectionMode::LoadBalanced => "LoadBalanced",
        })
    }
}
