// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use bson::{RawDocument, RawDocumentBuf};

use crate::{error::ProtocolError, models::msg::flags::MessageFlags};

/// A payload-type-1 section found in a reply: length-prefixed identifier
/// followed by a concatenation of documents.
#[derive(Debug, Clone)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<RawDocumentBuf>,
}

/// A decoded OP_MSG body.
#[derive(Debug)]
pub struct MsgResponse {
    flags: MessageFlags,
    document: RawDocumentBuf,
    sequences: Vec<DocumentSequence>,
}

fn decode_err(msg: impl Into<String>) -> anyhow::Error {
    anyhow!(ProtocolError::ReplyDecode(msg.into()))
}

fn read_i32(body: &[u8], at: usize) -> Result<i32> {
    let bytes: [u8; 4] = body
        .get(at..at + 4)
        .ok_or_else(|| decode_err(format!("truncated int32 at offset {at}")))?
        .try_into()?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_document(body: &[u8], at: usize) -> Result<RawDocumentBuf> {
    let len = read_i32(body, at)?;
    if len < 5 {
        bail!(decode_err(format!("document length {len} below minimum")));
    }
    let end = at + len as usize;
    let slice = body
        .get(at..end)
        .ok_or_else(|| decode_err("document extends past the message end"))?;
    Ok(RawDocumentBuf::from_bytes(slice.to_vec())?)
}

impl MsgResponse {
    /// Decodes an OP_MSG body: flag bits, then one payload-type-0 command
    /// document and any number of payload-type-1 sequences. A checksum
    /// trailer, when flagged, is sliced off without verification.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let raw_flags = read_i32(body, 0)? as u32;
        let flags = MessageFlags::from_bits_truncate(raw_flags);

        let end = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            body.len()
                .checked_sub(4)
                .ok_or_else(|| decode_err("checksum flagged but absent"))?
        } else {
            body.len()
        };

        let mut offset = 4usize;
        let mut document: Option<RawDocumentBuf> = None;
        let mut sequences = Vec::new();

        while offset < end {
            let kind = body[offset];
            offset += 1;
            match kind {
                0 => {
                    let doc = read_document(body, offset)?;
                    offset += doc.as_bytes().len();
                    if document.replace(doc).is_some() {
                        bail!(decode_err("multiple payload-type-0 sections"));
                    }
                },
                1 => {
                    let size = read_i32(body, offset)? as usize;
                    let section_end = offset + size;
                    if section_end > end {
                        bail!(decode_err("payload section extends past the message end"));
                    }
                    let mut cursor = offset + 4;
                    let nul = body[cursor..section_end]
                        .iter()
                        .position(|b| *b == 0)
                        .ok_or_else(|| decode_err("unterminated sequence identifier"))?;
                    let identifier =
                        std::str::from_utf8(&body[cursor..cursor + nul])?.to_string();
                    cursor += nul + 1;

                    let mut documents = Vec::new();
                    while cursor < section_end {
                        let doc = read_document(body, cursor)?;
                        cursor += doc.as_bytes().len();
                        documents.push(doc);
                    }
                    sequences.push(DocumentSequence {
                        identifier,
                        documents,
                    });
                    offset = section_end;
                },
                other => bail!(decode_err(format!("unknown section kind {other}"))),
            }
        }

        let document =
            document.ok_or_else(|| decode_err("reply carries no payload-type-0 section"))?;
        Ok(Self {
            flags,
            document,
            sequences,
        })
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Further replies to the same request will follow on this stream.
    pub fn more_to_come(&self) -> bool {
        self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    pub fn document(&self) -> &RawDocument {
        &self.document
    }

    pub fn into_document(self) -> RawDocumentBuf {
        self.document
    }

    pub fn sequences(&self) -> &[DocumentSequence] {
        &self.sequences
    }
}
