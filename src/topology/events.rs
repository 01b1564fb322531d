// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bson::oid::ObjectId;
use tracing::debug;

use crate::sdam::description::ClusterDescription;

/// Lifecycle events of a topology controller.
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    Opening {
        cluster_id: ObjectId,
    },
    DescriptionChanged {
        cluster_id: ObjectId,
        previous: ClusterDescription,
        current: ClusterDescription,
    },
    Closed {
        cluster_id: ObjectId,
    },
}

pub trait TopologyEventListener: Send + Sync {
    fn on_event(&self, event: &TopologyEvent);
}

/// Fans topology events out to listeners and mirrors them to the
/// `docdb::topology` log target.
#[derive(Default, Clone)]
pub struct TopologyEventSink {
    listeners: Vec<Arc<dyn TopologyEventListener>>,
}

impl std::fmt::Debug for TopologyEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyEventSink")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl TopologyEventSink {
    pub fn new(listeners: Vec<Arc<dyn TopologyEventListener>>) -> Self {
        Self { listeners }
    }

    pub fn emit(&self, event: TopologyEvent) {
        match &event {
            TopologyEvent::Opening { cluster_id } => {
                debug!(target: "docdb::topology", cluster = %cluster_id, "topology opening");
            },
            TopologyEvent::DescriptionChanged { cluster_id, .. } => {
                debug!(target: "docdb::topology", cluster = %cluster_id, "description changed");
            },
            TopologyEvent::Closed { cluster_id } => {
                debug!(target: "docdb::topology", cluster = %cluster_id, "topology closed");
            },
        }
        for l in &self.listeners {
            l.on_event(&event);
        }
    }
}
