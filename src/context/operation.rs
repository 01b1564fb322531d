// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Result, anyhow};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::ServerApiConfig,
    context::{deprioritize::ServerDeprioritization, session::SessionContext},
    error::Cancellation,
    models::common::next_operation_id,
};

/// An absolute point in time an operation must finish by. `Infinite` never
/// expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Infinite,
    At(Instant),
}

impl Deadline {
    pub fn after(d: Duration) -> Self {
        Deadline::At(Instant::now() + d)
    }

    pub fn expired(&self) -> bool {
        match self {
            Deadline::Infinite => false,
            Deadline::At(at) => Instant::now() >= *at,
        }
    }

    /// Time left until the deadline; `None` when it never expires.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::Infinite => None,
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self, other) {
            (Deadline::Infinite, d) | (d, Deadline::Infinite) => d,
            (Deadline::At(a), Deadline::At(b)) => Deadline::At(a.min(b)),
        }
    }
}

/// Everything an in-flight operation carries with it: its process-unique
/// id, session, deadline budget, server-api marker, and the
/// deprioritization state shared with every context derived from it.
#[derive(Debug, Clone)]
pub struct OperationContext {
    id: i64,
    session: Option<SessionContext>,
    deadline: Deadline,
    /// Per-round budget of multi-round protocols; bounded by `deadline`.
    maintenance_deadline: Deadline,
    /// Minimum observed network round trip, subtracted from server-side
    /// budgets so the server gives up before the client does.
    min_rtt: Duration,
    server_api: Option<ServerApiConfig>,
    operation_name: Option<String>,
    deprioritization: Arc<Mutex<ServerDeprioritization>>,
    cancel: CancellationToken,
}

impl OperationContext {
    pub fn new(deadline: Deadline) -> Self {
        Self {
            id: next_operation_id(),
            session: None,
            deadline,
            maintenance_deadline: Deadline::Infinite,
            min_rtt: Duration::ZERO,
            server_api: None,
            operation_name: None,
            deprioritization: Arc::new(Mutex::new(ServerDeprioritization::default())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session: SessionContext) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_server_api(mut self, api: Option<ServerApiConfig>) -> Self {
        self.server_api = api;
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn with_min_rtt(mut self, min_rtt: Duration) -> Self {
        self.min_rtt = min_rtt;
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut SessionContext> {
        self.session.as_mut()
    }

    pub fn server_api(&self) -> Option<&ServerApiConfig> {
        self.server_api.as_ref()
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Effective deadline: the earlier of the overall budget and the
    /// current maintenance round.
    pub fn deadline(&self) -> Deadline {
        self.deadline.min(self.maintenance_deadline)
    }

    /// Time left, or a deadline-expired cancellation error.
    pub fn remaining(&self) -> Result<Option<Duration>> {
        match self.deadline().remaining() {
            Some(d) if d.is_zero() => Err(anyhow!(Cancellation::deadline())),
            other => Ok(other),
        }
    }

    /// Remaining budget adjusted down by the minimum round-trip time, for
    /// server-side time limits. Zero-or-negative results expire.
    pub fn remaining_minus_rtt(&self) -> Result<Option<Duration>> {
        match self.remaining()? {
            None => Ok(None),
            Some(left) => {
                let adjusted = left.saturating_sub(self.min_rtt);
                if adjusted.is_zero() {
                    Err(anyhow!(Cancellation::deadline()))
                } else {
                    Ok(Some(adjusted))
                }
            },
        }
    }

    /// Derives a context with an overridden overall timeout. The id and the
    /// deprioritization state are shared with the parent.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut derived = self.clone();
        derived.deadline = Deadline::after(timeout);
        derived.maintenance_deadline = Deadline::Infinite;
        derived
    }

    /// Starts a fresh maintenance round of `budget`, keeping the operation
    /// id and the overall deadline. Each round of a multi-round protocol
    /// gets its own budget; the overall deadline still bounds the sum.
    pub fn with_fresh_maintenance(&self, budget: Duration) -> Self {
        let mut derived = self.clone();
        derived.maintenance_deadline = Deadline::after(budget);
        derived
    }

    pub fn deprioritization(&self) -> &Arc<Mutex<ServerDeprioritization>> {
        &self.deprioritization
    }

    /// Runs `f` on the shared deprioritization state.
    pub fn with_deprioritization<R>(
        &self,
        f: impl FnOnce(&mut ServerDeprioritization) -> R,
    ) -> R {
        let mut guard = self
            .deprioritization
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}
