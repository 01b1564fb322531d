// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{Document, doc, oid::ObjectId};
use docdb_client_rs::{
    cfg::config::ServerAddress,
    events::command::{
        CommandEventEmitter, CommandEventListener, CommandFailedEvent,
        CommandStartedEvent, CommandSucceededEvent, MAX_LOGGED_COMMAND_LENGTH,
        truncated_json,
    },
    sdam::description::{ConnectionDescription, ConnectionId, ServerId},
};

#[derive(Default)]
struct Capture {
    started: Mutex<Vec<CommandStartedEvent>>,
    succeeded: Mutex<Vec<CommandSucceededEvent>>,
    failed: Mutex<Vec<CommandFailedEvent>>,
}

impl CommandEventListener for Capture {
    fn started(&self, event: &CommandStartedEvent) {
        self.started.lock().expect("lock").push(event.clone());
    }

    fn succeeded(&self, event: &CommandSucceededEvent) {
        self.succeeded.lock().expect("lock").push(event.clone());
    }

    fn failed(&self, event: &CommandFailedEvent) {
        self.failed.lock().expect("lock").push(event.clone());
    }
}

fn connection_description() -> ConnectionDescription {
    let address = ServerAddress::new("db0.example", 27017);
    let server_id = ServerId::new(ObjectId::new(), address.clone());
    ConnectionDescription::preliminary(ConnectionId::new(server_id, 3), address)
}

#[test]
fn started_and_terminal_events_correlate_by_request_id() {
    let capture = Arc::new(Capture::default());
    let emitter = CommandEventEmitter::new(vec![capture.clone() as Arc<dyn CommandEventListener>]);
    let desc = connection_description();

    let command = doc! { "find": "users", "filter": { "x": 1 } };
    emitter.started(7, 99, &desc, "app", "find", &command);
    emitter.succeeded(
        7,
        99,
        &desc,
        "find",
        false,
        Duration::from_millis(2),
        &doc! { "ok": 1 },
    );

    let started = capture.started.lock().expect("lock");
    let succeeded = capture.succeeded.lock().expect("lock");
    assert_eq!(started.len(), 1);
    assert_eq!(succeeded.len(), 1);
    assert_eq!(started[0].request_id, 99);
    assert_eq!(succeeded[0].request_id, 99);
    assert_eq!(started[0].operation_id, 7);
    assert_eq!(started[0].command, command);
    assert_eq!(started[0].db, "app");
}

#[test]
fn sensitive_commands_are_redacted() {
    let capture = Arc::new(Capture::default());
    let emitter = CommandEventEmitter::new(vec![capture.clone() as Arc<dyn CommandEventListener>]);
    let desc = connection_description();

    let command = doc! { "saslStart": 1, "mechanism": "SCRAM-SHA-256", "payload": "secret" };
    assert!(emitter.is_sensitive("saslStart", &command));

    emitter.started(1, 10, &desc, "admin", "saslStart", &command);
    emitter.succeeded(
        1,
        10,
        &desc,
        "saslStart",
        true,
        Duration::from_millis(1),
        &doc! { "ok": 1, "payload": "secret" },
    );

    assert_eq!(
        capture.started.lock().expect("lock")[0].command,
        Document::new()
    );
    assert_eq!(
        capture.succeeded.lock().expect("lock")[0].reply,
        Document::new()
    );
}

#[test]
fn hello_with_speculative_authenticate_is_sensitive() {
    let emitter = CommandEventEmitter::default();

    let plain = doc! { "hello": 1, "helloOk": true };
    assert!(!emitter.is_sensitive("hello", &plain));

    let speculative = doc! {
        "hello": 1,
        "speculativeAuthenticate": { "saslStart": 1 },
    };
    assert!(emitter.is_sensitive("hello", &speculative));
    assert!(emitter.is_sensitive("isMaster", &speculative));
}

#[test]
fn non_sensitive_commands_keep_their_documents() {
    let emitter = CommandEventEmitter::default();
    assert!(!emitter.is_sensitive("find", &doc! { "find": "c" }));
    assert!(!emitter.is_sensitive("insert", &doc! { "insert": "c" }));
    assert!(emitter.is_sensitive("getnonce", &doc! { "getnonce": 1 }));
    assert!(emitter.is_sensitive("createUser", &doc! { "createUser": "u" }));
}

#[test]
fn logged_json_is_truncated_with_an_ellipsis() {
    let long = "z".repeat(4 * MAX_LOGGED_COMMAND_LENGTH);
    let rendered = truncated_json(&doc! { "insert": "c", "blob": long });
    assert!(rendered.chars().count() <= MAX_LOGGED_COMMAND_LENGTH + 3);
    assert!(rendered.ends_with("..."));

    let short = truncated_json(&doc! { "ping": 1 });
    assert!(!short.ends_with("..."));
    assert!(short.contains("ping"));
}

#[test]
fn failed_events_carry_the_failure_text() {
    let capture = Arc::new(Capture::default());
    let emitter = CommandEventEmitter::new(vec![capture.clone() as Arc<dyn CommandEventListener>]);
    let desc = connection_description();

    emitter.started(2, 11, &desc, "app", "find", &doc! { "find": "c" });
    emitter.failed(
        2,
        11,
        &desc,
        "find",
        Duration::from_millis(3),
        &anyhow::anyhow!("socket closed"),
    );

    let failed = capture.failed.lock().expect("lock");
    assert_eq!(failed.len(), 1);
    assert!(failed[0].failure.contains("socket closed"));
}
