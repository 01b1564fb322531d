// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashSet;

use crate::{
    cfg::config::ServerAddress,
    error::ErrorKindExt,
    sdam::description::{ClusterType, ServerDescription},
};

/// Per-operation suppression of servers that failed the previous attempt.
/// Each operation owns its state (shared only with contexts derived from
/// it), so there is no cross-operation contention.
#[derive(Debug, Default)]
pub struct ServerDeprioritization {
    candidate: Option<ServerAddress>,
    deprioritized: HashSet<ServerAddress>,
}

impl ServerDeprioritization {
    /// Records the server the current attempt is about to use.
    pub fn on_attempt(&mut self, address: ServerAddress) {
        self.candidate = Some(address);
    }

    pub fn on_attempt_success(&mut self) {
        self.candidate = None;
    }

    /// A pool-cleared signal is retryable against the same server, so the
    /// candidate is only forgotten; any other failure deprioritizes it.
    pub fn on_attempt_failure(&mut self, error: &anyhow::Error) {
        match self.candidate.take() {
            None => {},
            Some(_) if error.pool_cleared().is_some() => {},
            Some(candidate) => {
                self.deprioritized.insert(candidate);
            },
        }
    }

    pub fn deprioritized(&self) -> &HashSet<ServerAddress> {
        &self.deprioritized
    }

    /// Applies the soft filter. Deprioritization only makes sense when a
    /// router can stand in for another, so anything but a sharded cluster
    /// is a pass-through; an empty filter result falls back to the full
    /// candidate list.
    pub fn apply(
        &self,
        cluster_type: ClusterType,
        candidates: Vec<ServerDescription>,
    ) -> Vec<ServerDescription> {
        if cluster_type != ClusterType::Sharded {
            return candidates;
        }
        let filtered: Vec<ServerDescription> = candidates
            .iter()
            .filter(|s| !self.deprioritized.contains(&s.address))
            .cloned()
            .collect();
        if filtered.is_empty() {
            candidates
        } else {
            filtered
        }
    }
}
