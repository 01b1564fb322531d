// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Classifies errors observed on check-out, send, receive, or a command
//! round-trip, and applies their SDAM side effects: pool invalidation,
//! description resets, and immediate monitor checks.

use std::sync::{Arc, Mutex as StdMutex};

use bson::{Document, oid::ObjectId};
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    client::pool::ConnectionPool,
    error::ErrorKindExt,
    sdam::{
        description::{ServerDescription, ServerId, TopologyVersion},
        rtt::RttSampler,
    },
};

/// Message terms that mark a TLS handshake failure as a configuration
/// problem rather than overload.
const TLS_CONFIGURATION_TERMS: &[&str] = &[
    "certificate",
    "certification",
    "trust",
    "hostname",
    "host name",
    "protocol",
    "cipher",
    "verify failed",
];

/// One observed failure, frozen together with the pool generation and
/// service id of the connection it happened on.
#[derive(Debug)]
pub struct SdamIssue {
    pub error: anyhow::Error,
    /// Pool generation of the involved connection at check-out time.
    pub generation: u32,
    /// Service id of the involved connection, for load-balanced pools.
    pub service_id: Option<ObjectId>,
}

impl SdamIssue {
    pub fn new(error: anyhow::Error, generation: u32, service_id: Option<ObjectId>) -> Self {
        Self {
            error,
            generation,
            service_id,
        }
    }

    /// The server this operation targeted stopped being primary or is
    /// recovering.
    pub fn related_to_state_change(&self) -> bool {
        self.error
            .command()
            .is_some_and(|c| c.is_not_primary() || c.is_recovering())
    }

    /// Subset of state changes: the server process is going away.
    pub fn related_to_shutdown(&self) -> bool {
        self.error.command().is_some_and(|c| c.is_shutdown())
    }

    pub fn related_to_network_timeout(&self) -> bool {
        self.error.transport().is_some_and(|t| t.is_timeout())
    }

    pub fn related_to_network_not_timeout(&self) -> bool {
        self.error.transport().is_some_and(|t| !t.is_timeout())
    }

    /// TLS failures caused by configuration (certificates, trust,
    /// hostnames, protocol or cipher mismatch) rather than load.
    pub fn related_to_tls_configuration(&self) -> bool {
        self.error.transport().is_some_and(|t| {
            t.kind == crate::error::TransportKind::TlsHandshake && {
                let msg = t.message.to_lowercase();
                TLS_CONFIGURATION_TERMS.iter().any(|term| msg.contains(term))
            }
        })
    }

    pub fn related_to_auth(&self) -> bool {
        self.error.security().is_some()
    }

    pub fn related_to_write_concern(&self) -> bool {
        self.error.write_concern().is_some()
    }

    pub fn related_to_stale_primary(&self) -> bool {
        self.error.stale_primary().is_some()
    }

    /// Topology revision stamped on the error by the server, if any.
    pub fn topology_version(&self) -> Option<TopologyVersion> {
        self.error.command().and_then(|c| c.topology_version)
    }

    /// An issue is stale (and must be ignored) when the pool has already
    /// been cleared past its generation, or when the current description
    /// already reflects at least the revision the error reports.
    pub fn is_stale(&self, pool: &ConnectionPool, current: &ServerDescription) -> bool {
        if self.generation < pool.generation(self.service_id.as_ref()) {
            return true;
        }
        match (current.topology_version, self.topology_version()) {
            (Some(current_tv), Some(error_tv)) => current_tv.newer_or_equal(&error_tv),
            _ => false,
        }
    }
}

/// Whether a candidate revision may replace the current one. Strictly
/// newer always wins; cross-process revisions are incomparable and win too
/// (a restart must never be ignored); an absent revision on either side
/// wins. Only a same-process candidate that is not strictly newer loses.
fn accepts_candidate(
    current: Option<TopologyVersion>,
    candidate: Option<TopologyVersion>,
) -> bool {
    match (current, candidate) {
        (Some(cur), Some(cand)) => cand.newer_than(&cur) || !cur.newer_or_equal(&cand),
        _ => true,
    }
}

/// Holds the current description of one server plus its pool, and applies
/// classified issues to both. The description is an immutable value behind
/// a lock; every update publishes a replacement.
#[derive(Debug)]
pub struct Server {
    id: ServerId,
    description: StdMutex<Arc<ServerDescription>>,
    pool: ConnectionPool,
    rtt: StdMutex<RttSampler>,
    check_requested: Notify,
}

impl Server {
    pub fn new(id: ServerId, pool: ConnectionPool) -> Self {
        let description = Arc::new(ServerDescription::unknown(id.address.clone()));
        Self {
            id,
            description: StdMutex::new(description),
            pool,
            rtt: StdMutex::new(RttSampler::new()),
            check_requested: Notify::new(),
        }
    }

    /// A server that is known connected from the start (load balancers).
    pub fn new_connected_load_balancer(id: ServerId, pool: ConnectionPool) -> Self {
        let server = Self::new(id.clone(), pool);
        server.publish(ServerDescription::connected_load_balancer(id.address));
        server
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn description(&self) -> Arc<ServerDescription> {
        lock(&self.description).clone()
    }

    fn publish(&self, description: ServerDescription) {
        *lock(&self.description) = Arc::new(description);
    }

    /// Asks the monitor for an immediate check; `wait_for_check_request`
    /// is the monitor's side of the channel.
    pub fn request_check(&self) {
        self.check_requested.notify_one();
    }

    pub async fn wait_for_check_request(&self) {
        self.check_requested.notified().await;
    }

    /// Errors before the handshake completed: a fresh issue resets the
    /// description to unknown/connecting, nothing else.
    pub fn handle_exception_before_handshake(&self, issue: &SdamIssue) {
        if issue.is_stale(&self.pool, &self.description()) {
            debug!(server = %self.id, "ignoring stale pre-handshake issue");
            return;
        }
        self.publish(ServerDescription::unknown_with_error(
            self.id.address.clone(),
            issue.error.to_string(),
        ));
    }

    /// Errors after the handshake. Shutdown and non-timeout network errors
    /// invalidate the pool and reset the description; state changes reset
    /// the description and request an immediate monitor check; a
    /// write-concern carrier hands the server response back to the caller.
    pub fn handle_exception_after_handshake(&self, issue: &SdamIssue) -> Option<Document> {
        if issue.is_stale(&self.pool, &self.description()) {
            debug!(server = %self.id, "ignoring stale post-handshake issue");
            return None;
        }

        let state_change = issue.related_to_state_change();
        let clear_pool =
            issue.related_to_shutdown() || issue.related_to_network_not_timeout();

        if clear_pool {
            self.pool.clear(issue.service_id.as_ref());
        }
        if state_change {
            self.request_check();
        }
        if state_change || clear_pool {
            self.publish(ServerDescription::unknown_with_error(
                self.id.address.clone(),
                issue.error.to_string(),
            ));
        }

        issue.error.write_concern().map(|c| c.response.clone())
    }

    /// Feeds one measured round trip into the per-server sampler.
    pub fn record_round_trip(&self, sample: std::time::Duration) {
        lock(&self.rtt).add_sample(sample);
    }

    /// Minimum round trip over the sampler window; zero until the window
    /// has enough data.
    pub fn min_rtt(&self) -> std::time::Duration {
        lock(&self.rtt).min()
    }

    /// Accepts a monitor-produced description iff it is not outdated by
    /// the one already published. Returns whether it was applied. The
    /// published value carries the sampler's current windowed minimum.
    pub fn monitor_update(&self, mut candidate: ServerDescription) -> bool {
        candidate.min_rtt = self.min_rtt();
        let mut guard = lock(&self.description);
        if !accepts_candidate(guard.topology_version, candidate.topology_version) {
            return false;
        }
        *guard = Arc::new(candidate);
        true
    }

    /// Downgrades the description without touching the pool, under the
    /// same revision gate as `monitor_update`.
    pub fn update_to_unknown(&self, candidate: ServerDescription) -> bool {
        let mut guard = lock(&self.description);
        if !accepts_candidate(guard.topology_version, candidate.topology_version) {
            return false;
        }
        *guard = Arc::new(ServerDescription {
            address: self.id.address.clone(),
            ..ServerDescription::unknown_with_error(
                self.id.address.clone(),
                candidate.error.unwrap_or_default(),
            )
        });
        true
    }

    /// Idempotent: closes the pool's idle connections, resets the RTT
    /// sampler, and publishes a disconnected description.
    pub async fn close(&self) {
        self.pool.close().await;
        lock(&self.rtt).reset();
        let mut desc = ServerDescription::unknown(self.id.address.clone());
        desc.state = crate::sdam::description::ServerState::Disconnected;
        self.publish(desc);
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
