// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Immutable description values: what we believe about a server, a
//! connection, and the cluster. Updates always publish a replacement value,
//! never mutate in place.

use std::{fmt, time::Duration};

use bson::{Document, oid::ObjectId};
use serde::Deserialize;

use crate::{
    cfg::{config::ServerAddress, enums::ConnectionMode},
    models::common::{
        DEFAULT_MAX_BATCH_COUNT, DEFAULT_MAX_DOCUMENT_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
        MessageLimits,
    },
};

/// Identifies a server within one client instance: the client's stable
/// cluster id plus the server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub cluster_id: ObjectId,
    pub address: ServerAddress,
}

impl ServerId {
    pub fn new(cluster_id: ObjectId, address: ServerAddress) -> Self {
        Self {
            cluster_id,
            address,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.cluster_id, self.address)
    }
}

/// Identifies one connection: driver-local counter plus the counter the
/// server assigned during the handshake, once known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionId {
    pub server_id: ServerId,
    pub local: u32,
    pub server_assigned: Option<i64>,
}

impl ConnectionId {
    pub fn new(server_id: ServerId, local: u32) -> Self {
        Self {
            server_id,
            local,
            server_assigned: None,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.server_assigned {
            Some(s) => write!(f, "conn-{}(server {s})", self.local),
            None => write!(f, "conn-{}", self.local),
        }
    }
}

/// Server role as derived from the greeting response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Unknown,
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ReplicaSetArbiter,
    ReplicaSetOther,
    ReplicaSetGhost,
    ShardRouter,
    LoadBalancer,
}

impl ServerType {
    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::ReplicaSetPrimary
                | ServerType::ReplicaSetSecondary
                | ServerType::ShardRouter
                | ServerType::LoadBalancer
        )
    }
}

/// Monitoring lifecycle of a server entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Connecting,
    Connected,
    Disconnected,
}

/// A server's SDAM state revision: process id distinguishes restarts, the
/// counter orders revisions within one process lifetime.
///
/// Cross-process pairs are incomparable, so this deliberately does not
/// implement `Ord`; the two partial-order tests below are the only valid
/// comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TopologyVersion {
    #[serde(rename = "processId")]
    pub process_id: ObjectId,
    pub counter: i64,
}

impl TopologyVersion {
    /// Strict order: true iff same process and strictly larger counter.
    pub fn newer_than(&self, other: &TopologyVersion) -> bool {
        self.process_id == other.process_id && self.counter > other.counter
    }

    /// Non-strict order: true iff same process and counter at least as
    /// large.
    pub fn newer_or_equal(&self, other: &TopologyVersion) -> bool {
        self.process_id == other.process_id && self.counter >= other.counter
    }
}

/// Greeting response fields this layer consumes. Everything else in the
/// reply stays opaque.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    #[serde(default)]
    pub ok: f64,
    pub is_writable_primary: Option<bool>,
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,
    pub hello_ok: Option<bool>,
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub hidden: Option<bool>,
    pub secondary: Option<bool>,
    pub arbiter_only: Option<bool>,
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,
    #[serde(rename = "iscryptd")]
    pub is_cryptd: Option<bool>,
    pub logical_session_timeout_minutes: Option<i64>,
    pub min_wire_version: Option<i32>,
    pub max_wire_version: Option<i32>,
    pub max_bson_object_size: Option<i32>,
    pub max_message_size_bytes: Option<i32>,
    pub max_write_batch_size: Option<i32>,
    #[serde(default)]
    pub compression: Vec<String>,
    #[serde(default)]
    pub sasl_supported_mechs: Vec<String>,
    pub speculative_authenticate: Option<Document>,
    pub topology_version: Option<TopologyVersion>,
    pub service_id: Option<ObjectId>,
    pub connection_id: Option<i64>,
}

impl HelloReply {
    pub fn server_type(&self) -> ServerType {
        if self.ok != 1.0 {
            return ServerType::Unknown;
        }
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::ShardRouter;
        }
        if self.is_replica_set.unwrap_or(false) {
            return ServerType::ReplicaSetGhost;
        }
        if self.set_name.is_some() {
            if self.is_writable_primary.or(self.is_master).unwrap_or(false) {
                return ServerType::ReplicaSetPrimary;
            }
            if self.hidden.unwrap_or(false) {
                return ServerType::ReplicaSetOther;
            }
            if self.secondary.unwrap_or(false) {
                return ServerType::ReplicaSetSecondary;
            }
            if self.arbiter_only.unwrap_or(false) {
                return ServerType::ReplicaSetArbiter;
            }
            return ServerType::ReplicaSetOther;
        }
        ServerType::Standalone
    }

    pub fn supports_sessions(&self) -> bool {
        self.logical_session_timeout_minutes.is_some()
    }
}

/// What we currently believe about one server. Replaced wholesale on every
/// change.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub state: ServerState,
    pub topology_version: Option<TopologyVersion>,
    pub min_rtt: Duration,
    pub ok: bool,
    pub is_cryptd: bool,
    pub supports_sessions: bool,
    pub session_timeout_minutes: Option<i64>,
    /// Why the server is unknown, when it is.
    pub error: Option<String>,
}

impl ServerDescription {
    /// The blank entry a server starts from and is reset to on
    /// invalidation.
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            state: ServerState::Connecting,
            topology_version: None,
            min_rtt: Duration::ZERO,
            ok: false,
            is_cryptd: false,
            supports_sessions: false,
            session_timeout_minutes: None,
            error: None,
        }
    }

    pub fn unknown_with_error(address: ServerAddress, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::unknown(address)
        }
    }

    /// The synthetic entry published for a load balancer, which is never
    /// monitored and is trusted to be up.
    pub fn connected_load_balancer(address: ServerAddress) -> Self {
        Self {
            server_type: ServerType::LoadBalancer,
            state: ServerState::Connected,
            ok: true,
            supports_sessions: true,
            ..Self::unknown(address)
        }
    }

    pub fn from_hello(address: ServerAddress, reply: &HelloReply) -> Self {
        Self {
            server_type: reply.server_type(),
            state: ServerState::Connected,
            topology_version: reply.topology_version,
            min_rtt: Duration::ZERO,
            ok: reply.ok == 1.0,
            is_cryptd: reply.is_cryptd.unwrap_or(false),
            supports_sessions: reply.supports_sessions(),
            session_timeout_minutes: reply.logical_session_timeout_minutes,
            error: None,
            address,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.server_type == ServerType::Unknown
    }
}

/// Immutable facts about one established connection, written once by the
/// handshake. Only the server-assigned counter may be filled in later.
#[derive(Debug, Clone)]
pub struct ConnectionDescription {
    pub connection_id: ConnectionId,
    pub max_document_size: i32,
    pub max_message_size: i32,
    pub max_batch_count: i32,
    pub max_wire_version: i32,
    pub server_type: ServerType,
    pub session_timeout_minutes: Option<i64>,
    /// Set when a load balancer multiplexes us onto a backend.
    pub service_id: Option<ObjectId>,
    pub peer_address: ServerAddress,
}

impl ConnectionDescription {
    /// The placeholder in effect between TCP establishment and the
    /// handshake response; carries conservative default limits.
    pub fn preliminary(connection_id: ConnectionId, peer_address: ServerAddress) -> Self {
        Self {
            connection_id,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
            max_wire_version: 0,
            server_type: ServerType::Unknown,
            session_timeout_minutes: None,
            service_id: None,
            peer_address,
        }
    }

    pub fn from_hello(connection_id: ConnectionId, reply: &HelloReply) -> Self {
        let peer_address = connection_id.server_id.address.clone();
        Self {
            connection_id: ConnectionId {
                server_assigned: reply.connection_id,
                ..connection_id
            },
            max_document_size: reply
                .max_bson_object_size
                .unwrap_or(DEFAULT_MAX_DOCUMENT_SIZE),
            max_message_size: reply
                .max_message_size_bytes
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            max_batch_count: reply.max_write_batch_size.unwrap_or(DEFAULT_MAX_BATCH_COUNT),
            max_wire_version: reply.max_wire_version.unwrap_or(0),
            server_type: reply.server_type(),
            session_timeout_minutes: reply.logical_session_timeout_minutes,
            service_id: reply.service_id,
            peer_address,
        }
    }

    pub fn limits(&self) -> MessageLimits {
        MessageLimits {
            max_document_size: self.max_document_size,
            max_message_size: self.max_message_size,
            max_batch_count: self.max_batch_count,
        }
    }

    /// The one permitted post-handshake write.
    pub fn set_server_connection_id(&mut self, id: i64) {
        self.connection_id.server_assigned = Some(id);
    }
}

/// Shape of the deployment as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    Unknown,
    Standalone,
    ReplicaSet,
    Sharded,
    LoadBalanced,
}

/// Immutable snapshot of everything we know about the deployment,
/// republished on every change.
#[derive(Debug, Clone)]
pub struct ClusterDescription {
    pub connection_mode: ConnectionMode,
    pub cluster_type: ClusterType,
    pub servers: Vec<ServerDescription>,
}

impl ClusterDescription {
    pub fn new(
        connection_mode: ConnectionMode,
        cluster_type: ClusterType,
        servers: Vec<ServerDescription>,
    ) -> Self {
        Self {
            connection_mode,
            cluster_type,
            servers,
        }
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.iter().find(|s| &s.address == address)
    }
}
