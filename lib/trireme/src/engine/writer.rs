// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packets the datapath originates itself: UDP handshake packets,
//! their retransmissions and flushed UDP queues.

use alloc::string::String;
use core::fmt;
use core::fmt::Display;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteError {
    Io(String),
    Closed,
}

impl Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "packet write failed: {msg}"),
            Self::Closed => write!(f, "packet writer closed"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Injects a complete IPv4 packet into the network, tagged with
/// `mark` so the intercept rules let it through.
pub trait PacketWriter: Send + Sync {
    fn write_packet(&self, pkt: &[u8], mark: u32) -> Result<(), WriteError>;
}

/// Drops everything written to it.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullWriter;

impl PacketWriter for NullWriter {
    fn write_packet(&self, _pkt: &[u8], _mark: u32) -> Result<(), WriteError> {
        Ok(())
    }
}
