// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use bson::oid::ObjectId;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{client::client::ClientConnection, sdam::description::ServerId};

/// Connection bookkeeping for one server: a monotonic generation (bumped by
/// every clear, which invalidates all older connections), per-service
/// generations for load-balanced multiplexing, and an idle list.
#[derive(Debug)]
pub struct ConnectionPool {
    server_id: ServerId,
    generation: AtomicU32,
    service_generations: DashMap<ObjectId, u32>,
    local_id_counter: AtomicU32,
    idle: Mutex<Vec<Arc<ClientConnection>>>,
    max_size: u32,
}

impl ConnectionPool {
    pub fn new(server_id: ServerId, max_size: u32) -> Self {
        Self {
            server_id,
            generation: AtomicU32::new(0),
            service_generations: DashMap::new(),
            local_id_counter: AtomicU32::new(0),
            idle: Mutex::new(Vec::new()),
            max_size,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Current generation, per service when a service id is known.
    pub fn generation(&self, service_id: Option<&ObjectId>) -> u32 {
        match service_id {
            Some(id) => self.service_generations.get(id).map(|g| *g).unwrap_or(0),
            None => self.generation.load(Ordering::Acquire),
        }
    }

    /// Next driver-local connection id for this server.
    pub fn next_local_id(&self) -> u32 {
        self.local_id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Invalidates every connection of the current generation. With a
    /// service id only that service's connections age out; the load
    /// balancer itself stays usable.
    pub fn clear(&self, service_id: Option<&ObjectId>) {
        match service_id {
            Some(id) => {
                let mut entry = self.service_generations.entry(*id).or_insert(0);
                *entry += 1;
                debug!(server = %self.server_id, service = %id, generation = *entry, "pool cleared");
            },
            None => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(server = %self.server_id, generation, "pool cleared");
            },
        }
    }

    fn is_stale(&self, conn: &ClientConnection) -> bool {
        conn.generation() < self.generation(conn.service_id().as_ref())
    }

    /// Hands out an idle, still-valid connection if one exists. Stale or
    /// closed connections found on the way are discarded.
    pub async fn check_out(&self) -> Option<Arc<ClientConnection>> {
        let mut idle = self.idle.lock().await;
        while let Some(conn) = idle.pop() {
            if conn.is_closed() || self.is_stale(&conn) {
                conn.close();
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Returns a connection to the idle list; connections of an older
    /// generation are closed instead of being handed out again.
    pub async fn check_in(&self, conn: Arc<ClientConnection>) {
        if conn.is_closed() || self.is_stale(&conn) {
            conn.close();
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() as u32 >= self.max_size {
            conn.close();
            return;
        }
        idle.push(conn);
    }

    /// Closes every idle connection. Idempotent.
    pub async fn close(&self) {
        let mut idle = self.idle.lock().await;
        for conn in idle.drain(..) {
            conn.close();
        }
    }
}
