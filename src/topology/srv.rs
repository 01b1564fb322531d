// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The SRV-resolution callback contract.
//!
//! Actual DNS polling lives outside this crate; whatever drives it holds a
//! monitor handle and feeds each resolution outcome into
//! `LoadBalancedController::on_srv_resolution`. Closing the monitor tells
//! the driver task to stop.

use tokio_util::sync::CancellationToken;

use crate::cfg::config::ServerAddress;

/// One resolution outcome delivered by the external resolver.
pub type SrvOutcome = Result<Vec<ServerAddress>, String>;

/// Handle owned by the controller; the external resolver task watches the
/// token and stops when the monitor closes.
#[derive(Debug)]
pub struct SrvMonitor {
    hostname: String,
    cancel: CancellationToken,
}

impl SrvMonitor {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
