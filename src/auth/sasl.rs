// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The mechanism-agnostic SASL conversation driver.
//!
//! A mechanism exposes the small capability set below; the orchestrator
//! owns the command traffic: `saslStart`, the `saslContinue` loop keyed by
//! the server's conversation id, and the final-challenge feed once the
//! server reports `done`. Every round runs under a freshly-started
//! maintenance deadline so no single round can eat the whole budget; the
//! overall operation deadline still bounds the sum.

use anyhow::{Result, anyhow, bail};
use bson::{Binary, Bson, Document, doc, spec::BinarySubtype};
use enum_dispatch::enum_dispatch;

use crate::{
    auth::{credential::Credential, plain::PlainClient, scram::ScramClient},
    cfg::enums::AuthMechanism,
    client::client::ClientConnection,
    context::operation::OperationContext,
    error::{ProtocolError, SecurityError},
    models::msg::request::CommandMessage,
};

/// Capability set a SASL mechanism implements; the orchestrator never
/// looks past it.
#[enum_dispatch]
pub trait SaslClient {
    fn mechanism(&self) -> AuthMechanism;

    /// The client-first payload carried by `saslStart`. Mechanisms without
    /// an initial response return an empty payload.
    fn initial_payload(&mut self) -> Result<Vec<u8>>;

    /// Feeds one server challenge. `None` means the mechanism has nothing
    /// further to say; mid-conversation that is a protocol violation.
    fn step(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>>;

    fn is_complete(&self) -> bool;

    /// Adds mechanism-specific fields to the `saslStart` document.
    fn decorate_start(&self, _command: &mut Document) {}

    /// Drops key material. Called exactly once, success or failure.
    fn dispose(&mut self) {}
}

/// The mechanism variants the orchestrator can drive.
#[enum_dispatch(SaslClient)]
pub enum SaslMechanismClient {
    Scram(ScramClient),
    Plain(PlainClient),
}

/// One parsed `saslStart`/`saslContinue` reply.
#[derive(Debug, Clone)]
pub struct SaslReply {
    pub conversation_id: Bson,
    pub done: bool,
    pub payload: Vec<u8>,
}

impl SaslReply {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let conversation_id = doc
            .get("conversationId")
            .cloned()
            .unwrap_or(Bson::Int32(0));
        let done = doc.get_bool("done").unwrap_or(false);
        let payload = match doc.get("payload") {
            Some(Bson::Binary(b)) => b.bytes.clone(),
            Some(Bson::String(s)) => s.clone().into_bytes(),
            None => Vec::new(),
            Some(other) => {
                bail!(ProtocolError::Sasl(format!(
                    "payload has unexpected type {:?}",
                    other.element_type()
                )))
            },
        };
        Ok(Self {
            conversation_id,
            done,
            payload,
        })
    }
}

fn binary(payload: Vec<u8>) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: payload,
    })
}

/// Builds the `saslStart` document for a mechanism and payload. Also used
/// verbatim as the speculative-authenticate payload (with `db` appended).
pub fn sasl_start_command(
    client: &impl SaslClient,
    payload: Vec<u8>,
) -> Document {
    let mut command = doc! {
        "saslStart": 1,
        "mechanism": client.mechanism().as_str(),
        "payload": binary(payload),
    };
    client.decorate_start(&mut command);
    command
}

fn sasl_continue_command(conversation_id: &Bson, payload: Vec<u8>) -> Document {
    doc! {
        "saslContinue": 1,
        "conversationId": conversation_id.clone(),
        "payload": binary(payload),
    }
}

async fn send_sasl(
    conn: &ClientConnection,
    ctx: &OperationContext,
    source: &str,
    command: Document,
) -> Result<SaslReply> {
    // Fresh per-round budget; the overall deadline still applies on top.
    let round_ctx = ctx.with_fresh_maintenance(conn.io_timeout());
    let reply = conn
        .run_command(&round_ctx, CommandMessage::new(source, command))
        .await?;
    SaslReply::from_document(&reply)
}

fn conversation_error(credential: &Credential, message: impl Into<String>) -> anyhow::Error {
    anyhow!(SecurityError::SaslConversation {
        user: credential.username.clone().unwrap_or_default(),
        source_db: credential.source.clone(),
        message: message.into(),
    })
}

/// Drives a SASL client to completion on one connection.
///
/// A speculative-authenticate reply delivered by the handshake replaces
/// the first round; otherwise the conversation opens with `saslStart`.
/// The client is disposed exactly once, whatever the outcome.
pub async fn run_sasl_conversation(
    conn: &ClientConnection,
    ctx: &OperationContext,
    credential: &Credential,
    client: &mut SaslMechanismClient,
    speculative_response: Option<Document>,
) -> Result<()> {
    let result = drive(conn, ctx, credential, client, speculative_response).await;
    client.dispose();
    result
}

async fn drive(
    conn: &ClientConnection,
    ctx: &OperationContext,
    credential: &Credential,
    client: &mut SaslMechanismClient,
    speculative_response: Option<Document>,
) -> Result<()> {
    let mut reply = match speculative_response {
        Some(doc) => SaslReply::from_document(&doc)?,
        None => {
            let payload = client.initial_payload()?;
            let command = sasl_start_command(client, payload);
            send_sasl(conn, ctx, &credential.source, command).await?
        },
    };

    while !reply.done {
        let Some(payload) = client.step(&reply.payload)? else {
            return Err(anyhow!(ProtocolError::Sasl(
                "mechanism produced no payload mid-conversation".to_string()
            )));
        };
        let command = sasl_continue_command(&reply.conversation_id, payload);
        reply = send_sasl(conn, ctx, &credential.source, command).await?;
    }

    if !client.is_complete() {
        // One final challenge feed after the server said done.
        client.step(&reply.payload)?;
        if !client.is_complete() {
            return Err(conversation_error(
                credential,
                "server completed the exchange before the client did",
            ));
        }
    }

    Ok(())
}
