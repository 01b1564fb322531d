// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use bson::{RawDocument, RawDocumentBuf};

use crate::{
    error::ProtocolError,
    models::{
        compressed::decode_envelope,
        header::MessageHeader,
        msg::response::MsgResponse,
        opcode::OpCode,
        reply::ReplyResponse,
    },
};

/// A decoded inbound message, whatever opcode it arrived under.
#[derive(Debug)]
pub enum ServerMessage {
    Msg(MsgResponse),
    Reply(ReplyResponse),
}

impl ServerMessage {
    /// Decodes a message body by opcode, unwrapping any number of
    /// OP_COMPRESSED layers first. The header's request/response ids are
    /// untouched by unwrapping, which is what keeps correlation stable
    /// across compressed traffic.
    pub fn decode(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut opcode = header.opcode()?.into();
        let mut owned: Option<Vec<u8>> = None;

        loop {
            let bytes: &[u8] = owned.as_deref().unwrap_or(body);
            match opcode {
                DecodeOp::Compressed => {
                    let (original, data) = decode_envelope(bytes)?;
                    opcode = match OpCode::from_i32(original) {
                        Some(op) => op.into(),
                        None => bail!(ProtocolError::ReplyDecode(format!(
                            "compressed envelope names unknown opcode {original}"
                        ))),
                    };
                    owned = Some(data);
                },
                DecodeOp::Msg => return Ok(Self::Msg(MsgResponse::decode(bytes)?)),
                DecodeOp::Reply => return Ok(Self::Reply(ReplyResponse::decode(bytes)?)),
                DecodeOp::Other(op) => bail!(ProtocolError::ReplyDecode(format!(
                    "server sent unexpected {op:?}"
                ))),
            }
        }
    }

    pub fn document(&self) -> Result<&RawDocument> {
        match self {
            Self::Msg(m) => Ok(m.document()),
            Self::Reply(r) => r.document(),
        }
    }

    pub fn into_document(self) -> Result<RawDocumentBuf> {
        match self {
            Self::Msg(m) => Ok(m.into_document()),
            Self::Reply(r) => r.into_document(),
        }
    }

    /// Only OP_MSG replies can announce a follow-up on the same request id.
    pub fn more_to_come(&self) -> bool {
        match self {
            Self::Msg(m) => m.more_to_come(),
            Self::Reply(_) => false,
        }
    }
}

enum DecodeOp {
    Msg,
    Reply,
    Compressed,
    Other(OpCode),
}

impl From<OpCode> for DecodeOp {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Msg => DecodeOp::Msg,
            OpCode::Reply => DecodeOp::Reply,
            OpCode::Compressed => DecodeOp::Compressed,
            other => DecodeOp::Other(other),
        }
    }
}
