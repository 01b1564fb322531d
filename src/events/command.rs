// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Structured command events: one `started` per round-trip followed by
//! exactly one of `succeeded` / `failed`, correlated by request id.
//!
//! Commands whose name is security-sensitive (and greetings carrying a
//! speculative-authenticate payload) are redacted: their event documents
//! are replaced with the empty document before anything observes them.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::anyhow;
use bson::{Bson, Document};
use tracing::debug;

use crate::{
    error::{ErrorKindExt, WriteConcernCarrier},
    sdam::description::ConnectionDescription,
};

/// Command names whose payloads never reach events or logs.
pub const SECURITY_SENSITIVE_COMMANDS: &[&str] = &[
    "authenticate",
    "saslStart",
    "saslContinue",
    "getnonce",
    "createUser",
    "updateUser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// Longest JSON rendering that reaches the log line.
pub const MAX_LOGGED_COMMAND_LENGTH: usize = 1000;

#[derive(Debug, Clone)]
pub struct CommandStartedEvent {
    pub operation_id: i64,
    pub request_id: i32,
    pub connection: ConnectionDescription,
    pub db: String,
    pub command_name: String,
    pub command: Document,
}

#[derive(Debug, Clone)]
pub struct CommandSucceededEvent {
    pub operation_id: i64,
    pub request_id: i32,
    pub connection: ConnectionDescription,
    pub command_name: String,
    pub duration: Duration,
    pub reply: Document,
}

#[derive(Debug, Clone)]
pub struct CommandFailedEvent {
    pub operation_id: i64,
    pub request_id: i32,
    pub connection: ConnectionDescription,
    pub command_name: String,
    pub duration: Duration,
    pub failure: String,
}

pub trait CommandEventListener: Send + Sync {
    fn started(&self, event: &CommandStartedEvent);
    fn succeeded(&self, event: &CommandSucceededEvent);
    fn failed(&self, event: &CommandFailedEvent);
}

/// Fans command events out to listeners and mirrors them, truncated, to the
/// `docdb::command` log target.
///
/// The emitter copies whatever it needs out of the borrowed command
/// document while emitting `started`; the caller is free to release the
/// underlying transport buffers immediately afterwards.
pub struct CommandEventEmitter {
    listeners: Vec<Arc<dyn CommandEventListener>>,
    sensitive: HashSet<&'static str>,
}

impl std::fmt::Debug for CommandEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEventEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for CommandEventEmitter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl CommandEventEmitter {
    pub fn new(listeners: Vec<Arc<dyn CommandEventListener>>) -> Self {
        Self {
            listeners,
            sensitive: SECURITY_SENSITIVE_COMMANDS.iter().copied().collect(),
        }
    }

    /// A command is redacted when its name is in the sensitive set, or when
    /// a greeting carries an embedded speculative authentication payload.
    pub fn is_sensitive(&self, command_name: &str, command: &Document) -> bool {
        if self.sensitive.contains(command_name) {
            return true;
        }
        matches!(command_name, "hello" | "isMaster" | "ismaster")
            && command.contains_key("speculativeAuthenticate")
    }

    pub fn started(
        &self,
        operation_id: i64,
        request_id: i32,
        connection: &ConnectionDescription,
        db: &str,
        command_name: &str,
        command: &Document,
    ) {
        let redacted = self.is_sensitive(command_name, command);
        let event_command = if redacted {
            Document::new()
        } else {
            command.clone()
        };

        debug!(
            target: "docdb::command",
            command_name,
            request_id,
            driver_connection_id = connection.connection_id.local,
            server_connection_id = connection.connection_id.server_assigned,
            server_host = connection.peer_address.host.as_str(),
            server_port = connection.peer_address.port,
            service_id = ?connection.service_id,
            command = %truncated_json(&event_command),
            "command started"
        );

        if self.listeners.is_empty() {
            return;
        }
        let event = CommandStartedEvent {
            operation_id,
            request_id,
            connection: connection.clone(),
            db: db.to_string(),
            command_name: command_name.to_string(),
            command: event_command,
        };
        for l in &self.listeners {
            l.started(&event);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn succeeded(
        &self,
        operation_id: i64,
        request_id: i32,
        connection: &ConnectionDescription,
        command_name: &str,
        was_redacted: bool,
        duration: Duration,
        reply: &Document,
    ) {
        let event_reply = if was_redacted {
            Document::new()
        } else {
            reply.clone()
        };

        debug!(
            target: "docdb::command",
            command_name,
            request_id,
            duration_ms = duration.as_secs_f64() * 1000.0,
            driver_connection_id = connection.connection_id.local,
            server_connection_id = connection.connection_id.server_assigned,
            server_host = connection.peer_address.host.as_str(),
            server_port = connection.peer_address.port,
            service_id = ?connection.service_id,
            reply = %truncated_json(&event_reply),
            "command succeeded"
        );

        if self.listeners.is_empty() {
            return;
        }
        let event = CommandSucceededEvent {
            operation_id,
            request_id,
            connection: connection.clone(),
            command_name: command_name.to_string(),
            duration,
            reply: event_reply,
        };
        for l in &self.listeners {
            l.succeeded(&event);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn failed(
        &self,
        operation_id: i64,
        request_id: i32,
        connection: &ConnectionDescription,
        command_name: &str,
        duration: Duration,
        failure: &anyhow::Error,
    ) {
        debug!(
            target: "docdb::command",
            command_name,
            request_id,
            duration_ms = duration.as_secs_f64() * 1000.0,
            driver_connection_id = connection.connection_id.local,
            server_connection_id = connection.connection_id.server_assigned,
            server_host = connection.peer_address.host.as_str(),
            server_port = connection.peer_address.port,
            service_id = ?connection.service_id,
            failure = %failure,
            "command failed"
        );

        if self.listeners.is_empty() {
            return;
        }
        let event = CommandFailedEvent {
            operation_id,
            request_id,
            connection: connection.clone(),
            command_name: command_name.to_string(),
            duration,
            failure: failure.to_string(),
        };
        for l in &self.listeners {
            l.failed(&event);
        }
    }
}

/// Rebuilds an error so that no server response document survives the
/// redaction boundary of a sensitive command.
pub fn redact_error(error: anyhow::Error) -> anyhow::Error {
    if let Some(carrier) = error.write_concern() {
        return anyhow!(WriteConcernCarrier {
            code: carrier.code,
            message: carrier.message.clone(),
            response: Document::new(),
        });
    }
    error
}

/// Relaxed JSON rendering bounded to [`MAX_LOGGED_COMMAND_LENGTH`]
/// characters, with an ellipsis marking the cut.
pub fn truncated_json(doc: &Document) -> String {
    let rendered = Bson::Document(doc.clone())
        .into_relaxed_extjson()
        .to_string();
    truncate_with_ellipsis(rendered, MAX_LOGGED_COMMAND_LENGTH)
}

fn truncate_with_ellipsis(mut s: String, max: usize) -> String {
    if s.chars().count() <= max {
        return s;
    }
    let cut = s
        .char_indices()
        .nth(max)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s.truncate(cut);
    s.push_str("...");
    s
}
