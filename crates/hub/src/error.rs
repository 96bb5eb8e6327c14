// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Marker error for cooperatively cancelled operations.
///
/// Returned by [`crate::idler::Idler::idle`] and propagated by long-running
/// loops (queue drains, graph serialization) so callers can tell an expected
/// cancellation apart from a genuine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// WebSocket close codes the hub sends when it force-closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure requested by the hub.
    Normal,
    /// The hub is shutting down.
    GoingAway,
    /// Client setup failed after the transport was already established.
    InternalError,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::InternalError => 1011,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
