// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use bson::{Document, RawDocumentBuf};
use bytes::Bytes;

use crate::{
    error::ProtocolError,
    models::{
        common::{HEADER_LEN, MessageLimits},
        header::MessageHeader,
        msg::flags::MessageFlags,
        nesting::NestingMeter,
        opcode::OpCode,
        payload::{FieldNameValidator, SplittablePayload, validate_document},
    },
};

/// An outgoing OP_MSG command: the command document as the payload-type-0
/// section, plus an optional splittable write batch emitted as a
/// payload-type-1 section.
#[derive(Debug)]
pub struct CommandMessage {
    pub db: String,
    pub body: Document,
    pub payload: Option<SplittablePayload>,
    pub flags: MessageFlags,
}

impl CommandMessage {
    pub fn new(db: impl Into<String>, body: Document) -> Self {
        Self {
            db: db.into(),
            body,
            payload: None,
            flags: MessageFlags::empty(),
        }
    }

    pub fn with_payload(mut self, payload: SplittablePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Marks the message fire-and-forget: the server will not reply.
    pub fn without_reply(mut self) -> Self {
        self.flags |= MessageFlags::MORE_TO_COME;
        self
    }

    /// Command name is the first key of the body by wire convention.
    pub fn command_name(&self) -> &str {
        self.body
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn expects_reply(&self) -> bool {
        !self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    /// Encodes the whole message (header included). The payload section, if
    /// any, streams documents until a limit is reached and records the
    /// reached position on the payload so the caller can ask
    /// `has_another_split()` afterwards.
    pub fn encode(&mut self, request_id: i32, limits: &MessageLimits) -> Result<Bytes> {
        let mut body = self.body.clone();
        body.insert("$db", self.db.clone());
        let raw = RawDocumentBuf::from_document(&body)?;

        let mut meter = NestingMeter::default();
        validate_document(&raw, FieldNameValidator::Passthrough, &mut meter)?;

        let mut out = Vec::with_capacity(HEADER_LEN + 5 + raw.as_bytes().len());
        out.resize(HEADER_LEN, 0);
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.push(0u8);
        out.extend_from_slice(raw.as_bytes());

        if let Some(payload) = self.payload.as_mut() {
            let used = out.len();
            payload.encode_section(&mut out, limits, used)?;
        }

        let total = out.len() as i32;
        if total > limits.max_message_size {
            bail!(ProtocolError::Framing(format!(
                "encoded message of {total} bytes exceeds the {} byte limit",
                limits.max_message_size
            )));
        }

        let header = MessageHeader::new(total, request_id, 0, OpCode::Msg);
        header.write_to_buf(&mut out[..HEADER_LEN])?;
        Ok(Bytes::from(out))
    }

    /// Whether the encoded payload left items for a follow-up message.
    pub fn has_another_split(&self) -> bool {
        self.payload
            .as_ref()
            .is_some_and(SplittablePayload::has_another_split)
    }

    /// Produces the follow-up message carrying the payload suffix.
    pub fn next_split(self) -> Result<Self> {
        let payload = self
            .payload
            .ok_or_else(|| anyhow!("message has no payload to split"))?;
        Ok(Self {
            db: self.db,
            body: self.body,
            payload: Some(payload.next_split()?),
            flags: self.flags,
        })
    }
}
