// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bitflags::bitflags;

bitflags! {
    /// OP_MSG flag bits. Bit 1 (`MORE_TO_COME`) on a reply means further
    /// replies to the same request id will follow; on a request it marks the
    /// message as fire-and-forget.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 1;
        const MORE_TO_COME = 1 << 1;
        const EXHAUST_ALLOWED = 1 << 16;
    }
}
