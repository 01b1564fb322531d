// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, ensure};
use bson::{Document, Timestamp, doc};

use crate::error::ConfigurationError;

/// Wire version that introduced snapshot reads.
pub const SNAPSHOT_MIN_WIRE_VERSION: i32 = 13;

/// The slice of a logical session an operation needs: consistency mode,
/// advanced times, and the gossiped cluster time.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    causally_consistent: bool,
    snapshot: bool,
    operation_time: Option<Timestamp>,
    snapshot_time: Option<Timestamp>,
    cluster_time: Option<Document>,
    read_concern_level: Option<String>,
}

impl SessionContext {
    pub fn causally_consistent() -> Self {
        Self {
            causally_consistent: true,
            ..Self::default()
        }
    }

    pub fn snapshot() -> Self {
        Self {
            snapshot: true,
            ..Self::default()
        }
    }

    pub fn with_read_concern_level(mut self, level: impl Into<String>) -> Self {
        self.read_concern_level = Some(level.into());
        self
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    pub fn is_causally_consistent(&self) -> bool {
        self.causally_consistent
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Moves the causal-consistency watermark forward; earlier times are
    /// ignored.
    pub fn advance_operation_time(&mut self, time: Timestamp) {
        match self.operation_time {
            Some(current) if ts_key(current) >= ts_key(time) => {},
            _ => self.operation_time = Some(time),
        }
    }

    pub fn set_snapshot_time(&mut self, time: Timestamp) {
        self.snapshot_time = Some(time);
    }

    pub fn cluster_time(&self) -> Option<&Document> {
        self.cluster_time.as_ref()
    }

    /// Adopts a newer gossiped `$clusterTime`, keyed by its inner
    /// timestamp.
    pub fn advance_cluster_time(&mut self, time: Document) {
        let incoming = cluster_time_stamp(&time);
        let current = self.cluster_time.as_ref().and_then(cluster_time_stamp);
        match (incoming, current) {
            (Some(new), Some(old)) if ts_key(new) <= ts_key(old) => {},
            (Some(_), _) => self.cluster_time = Some(time),
            (None, _) => {},
        }
    }

    /// Builds the read-concern fragment attached to outgoing commands.
    ///
    /// Exactly one of `afterClusterTime` / `atClusterTime` can appear;
    /// snapshot and causal consistency are never both in effect.
    pub fn read_concern_fragment(&self, max_wire_version: i32) -> Result<Option<Document>> {
        ensure!(
            !(self.snapshot && self.causally_consistent),
            "snapshot and causal consistency are mutually exclusive"
        );

        if self.snapshot && max_wire_version < SNAPSHOT_MIN_WIRE_VERSION {
            return Err(anyhow!(ConfigurationError::SnapshotWireVersion {
                min: SNAPSHOT_MIN_WIRE_VERSION,
                actual: max_wire_version,
            }));
        }

        let mut fragment = Document::new();
        if let Some(level) = &self.read_concern_level {
            fragment.insert("level", level.clone());
        }
        if self.causally_consistent
            && let Some(time) = self.operation_time
        {
            fragment.insert("afterClusterTime", time);
        } else if self.snapshot
            && let Some(time) = self.snapshot_time
        {
            fragment.insert("atClusterTime", time);
        }

        if fragment.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fragment))
        }
    }

    /// The `$clusterTime` fragment gossiped back to the server, if any.
    pub fn cluster_time_fragment(&self) -> Option<Document> {
        self.cluster_time
            .as_ref()
            .map(|ct| doc! { "$clusterTime": ct.clone() })
    }
}

fn cluster_time_stamp(time: &Document) -> Option<Timestamp> {
    time.get("clusterTime").and_then(|v| v.as_timestamp())
}

fn ts_key(t: Timestamp) -> (u32, u32) {
    (t.time, t.increment)
}
