// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Service hooks run around the authorization logic.

use super::packet::Packet;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessorError(pub String);

impl Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "service processor: {}", self.0)
    }
}

impl std::error::Error for ProcessorError {}

/// A packet processor sees every parsed packet before the datapath
/// acts on it, and every packet the datapath accepts before it is
/// handed back. An error from either hook drops the packet.
pub trait PacketProcessor: Send + Sync {
    fn pre_process(&self, _pkt: &Packet) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Returns `true` if the packet was changed.
    fn post_process(&self, _pkt: &mut Packet) -> Result<bool, ProcessorError> {
        Ok(false)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullProcessor;

impl PacketProcessor for NullProcessor {}
