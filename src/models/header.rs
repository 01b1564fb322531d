// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use tracing::debug;
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, I32,
};

use crate::{
    error::ProtocolError,
    models::{
        common::HEADER_LEN,
        opcode::{OpCode, UnknownOpCode},
    },
};

/// Wire-safe, zero-copy message header. All fields little-endian.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MessageHeader {
    /// Total message length in bytes, this header included.
    pub message_length: I32<LittleEndian>,
    /// Process-unique id of this message.
    pub request_id: I32<LittleEndian>,
    /// For replies, the request id being answered; zero otherwise.
    pub response_to: I32<LittleEndian>,
    /// One of the [`OpCode`] values.
    pub op_code: I32<LittleEndian>,
}

impl MessageHeader {
    pub fn new(message_length: i32, request_id: i32, response_to: i32, op: OpCode) -> Self {
        Self {
            message_length: I32::new(message_length),
            request_id: I32::new(request_id),
            response_to: I32::new(response_to),
            op_code: I32::new(op as i32),
        }
    }

    /// Reads a header out of the first [`HEADER_LEN`] bytes of `buf` and
    /// validates it against the connection's message-size limit. Violations
    /// are framing errors; they are also surfaced to the debugging hook via
    /// the `docdb::wire` target before being returned.
    pub fn read_from_buf(buf: &[u8], max_message_size: i32) -> Result<Self> {
        let header = Self::ref_from_bytes(
            buf.get(..HEADER_LEN).ok_or_else(|| {
                anyhow!(ProtocolError::Framing(format!(
                    "message header needs {HEADER_LEN} bytes, have {}",
                    buf.len()
                )))
            })?,
        )
        .map_err(|e| anyhow!("{e}"))?
        .clone();
        header.validate(max_message_size)?;
        Ok(header)
    }

    pub fn validate(&self, max_message_size: i32) -> Result<()> {
        let len = self.message_length.get();
        if len < HEADER_LEN as i32 || len > max_message_size {
            let err = ProtocolError::Framing(format!(
                "message length {len} outside [{HEADER_LEN}, {max_message_size}]"
            ));
            debug!(target: "docdb::wire", header = ?self, "rejected frame");
            bail!(err);
        }
        Ok(())
    }

    pub fn opcode(&self) -> Result<OpCode, UnknownOpCode> {
        OpCode::try_from(self.op_code.get())
    }

    /// Number of body bytes following the header.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.message_length.get() as usize).saturating_sub(HEADER_LEN)
    }

    pub fn write_to_buf(&self, buf: &mut [u8]) -> Result<()> {
        self.write_to_prefix(buf)
            .map_err(|_| anyhow!("header buffer too small: {}", buf.len()))
    }
}
