// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::{AtomicI64, Ordering};

/// Fixed message header length: length, request id, response-to, opcode.
pub const HEADER_LEN: usize = 16;

/// Default limits advertised by servers that omit the fields.
pub const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48_000_000;
pub const DEFAULT_MAX_BATCH_COUNT: i32 = 100_000;

/// Per-connection framing limits, copied out of the handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    /// Largest single document the server accepts.
    pub max_document_size: i32,
    /// Largest whole wire message, header included.
    pub max_message_size: i32,
    /// Largest number of write items per payload section.
    pub max_batch_count: i32,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
        }
    }
}

// One process-wide counter feeds both operation ids and wire request ids,
// so either is unique against the other in logs. Wrap-around after 2^63
// increments is a practical non-issue.
static ID_COUNTER: AtomicI64 = AtomicI64::new(1);

/// Next process-unique operation id.
pub fn next_operation_id() -> i64 {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Next process-unique wire request id. Shares the operation-id counter;
/// truncation to i32 keeps monotonicity within any realistic window.
pub fn next_request_id() -> i32 {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed) as i32
}
