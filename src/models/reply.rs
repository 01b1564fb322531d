// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Legacy OP_REPLY decode. Only pre-hello traffic (the initial greeting to
//! very old servers) still answers in this format.

use anyhow::{Result, anyhow, bail};
use bitflags::bitflags;
use bson::{RawDocument, RawDocumentBuf};
use zerocopy::{
    FromBytes as ZFromBytes, I32, I64, Immutable, IntoBytes, KnownLayout, LittleEndian,
};

use crate::error::ProtocolError;

/// Fixed part of an OP_REPLY body.
pub const REPLY_HEADER_LEN: usize = 20;

bitflags! {
    /// OP_REPLY response flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplyFlags: u32 {
        const CURSOR_NOT_FOUND = 1;
        const QUERY_FAILURE = 1 << 1;
    }
}

/// Wire-safe, zero-copy fixed reply header.
#[repr(C)]
#[derive(Debug, Clone, Default, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReplyHeader {
    pub response_flags: I32<LittleEndian>,
    pub cursor_id: I64<LittleEndian>,
    pub starting_from: I32<LittleEndian>,
    pub number_returned: I32<LittleEndian>,
}

/// A decoded OP_REPLY body.
#[derive(Debug)]
pub struct ReplyResponse {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    documents: Vec<RawDocumentBuf>,
}

impl ReplyResponse {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < REPLY_HEADER_LEN {
            bail!(ProtocolError::ReplyDecode(format!(
                "reply body of {} bytes is shorter than the {REPLY_HEADER_LEN}-byte reply header",
                body.len()
            )));
        }
        let header = ReplyHeader::ref_from_bytes(&body[..REPLY_HEADER_LEN])
            .map_err(|e| anyhow!("{e}"))?;

        let number_returned = header.number_returned.get();
        if number_returned < 0 {
            bail!(ProtocolError::ReplyDecode(format!(
                "negative numberReturned: {number_returned}"
            )));
        }

        let mut documents = Vec::with_capacity(number_returned as usize);
        let mut offset = REPLY_HEADER_LEN;
        for _ in 0..number_returned {
            let len_bytes: [u8; 4] = body
                .get(offset..offset + 4)
                .ok_or_else(|| {
                    anyhow!(ProtocolError::ReplyDecode(
                        "document count overruns the reply body".to_string()
                    ))
                })?
                .try_into()?;
            let len = i32::from_le_bytes(len_bytes) as usize;
            let slice = body.get(offset..offset + len).ok_or_else(|| {
                anyhow!(ProtocolError::ReplyDecode(
                    "document extends past the reply end".to_string()
                ))
            })?;
            documents.push(RawDocumentBuf::from_bytes(slice.to_vec())?);
            offset += len;
        }

        Ok(Self {
            flags: ReplyFlags::from_bits_truncate(header.response_flags.get() as u32),
            cursor_id: header.cursor_id.get(),
            starting_from: header.starting_from.get(),
            documents,
        })
    }

    pub fn cursor_not_found(&self) -> bool {
        self.flags.contains(ReplyFlags::CURSOR_NOT_FOUND)
    }

    pub fn query_failure(&self) -> bool {
        self.flags.contains(ReplyFlags::QUERY_FAILURE)
    }

    pub fn documents(&self) -> &[RawDocumentBuf] {
        &self.documents
    }

    /// The single command-result document of a command-style reply.
    pub fn document(&self) -> Result<&RawDocument> {
        self.documents
            .first()
            .map(|d| d.as_ref())
            .ok_or_else(|| {
                anyhow!(ProtocolError::ReplyDecode(
                    "reply carries no documents".to_string()
                ))
            })
    }

    pub fn into_document(mut self) -> Result<RawDocumentBuf> {
        if self.documents.is_empty() {
            bail!(ProtocolError::ReplyDecode(
                "reply carries no documents".to_string()
            ));
        }
        Ok(self.documents.swap_remove(0))
    }
}
