// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Opcodes carried in the fourth field of every 16-byte message header.
//!
//! Only four of them are ever produced or consumed by this crate: OP_MSG is
//! the primary command format, OP_COMPRESSED wraps any other opcode,
//! OP_REPLY answers legacy OP_QUERY traffic. The remaining legacy opcodes
//! are recognized so that decode errors can name them.

use std::convert::TryFrom;

use thiserror::Error;

/// All opcodes assigned by the wire protocol.
#[repr(i32)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    Compressed = 2012,
    #[default]
    Msg = 2013,
}

impl OpCode {
    #[inline]
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Self::Reply,
            2001 => Self::Update,
            2002 => Self::Insert,
            2004 => Self::Query,
            2005 => Self::GetMore,
            2006 => Self::Delete,
            2007 => Self::KillCursors,
            2012 => Self::Compressed,
            2013 => Self::Msg,
            _ => return None,
        })
    }
}

/// Returned when the header carries an opcode this crate has never heard of.
#[derive(Debug, Error)]
#[error("invalid opcode: {0}")]
pub struct UnknownOpCode(pub i32);

impl TryFrom<i32> for OpCode {
    type Error = UnknownOpCode;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        OpCode::from_i32(v).ok_or(UnknownOpCode(v))
    }
}
