// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Datapath configuration.

use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The tag compression scheme advertised in the claims header.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None = 0,
    V1 = 1,
    V2 = 2,
}

impl CompressionType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::None),
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

impl Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::V1 => "v1",
            Self::V2 => "v2",
        };
        write!(f, "{s}")
    }
}

pub const DEF_CONNECTION_TIMEOUT_SECS: u64 = 24;
pub const DEF_MAX_CONNECTIONS: u32 = 8192;
pub const DEF_TRACKER_SHARDS: u32 = 16;
pub const DEF_UDP_QUEUE_LEN: usize = 50;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DatapathConfig {
    /// Require the transmit-side rules to accept the peer we
    /// connected to, not merely to not reject it.
    pub mutual_authorization: bool,
    /// Emit a packet report for every processed packet.
    pub packet_tracing: bool,
    pub tcp_connection_timeout_secs: u64,
    pub udp_connection_timeout_secs: u64,
    /// The capacity of each connection tracker.
    pub max_connections: u32,
    pub tracker_shards: u32,
    /// The number of application packets buffered per UDP connection
    /// while its handshake is in progress.
    pub udp_queue_len: usize,
    pub udp_retransmit_interval_ms: u64,
    pub udp_retransmit_attempts: u32,
    pub token_validity_secs: u64,
    pub compression: CompressionType,
    /// Advertise encryption and exchange ephemeral keys.
    pub encryption: bool,
    /// How often expiry and retransmission run.
    pub expiry_interval_ms: u64,
    pub application_queues: Vec<u16>,
    pub network_queues: Vec<u16>,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            mutual_authorization: true,
            packet_tracing: false,
            tcp_connection_timeout_secs: DEF_CONNECTION_TIMEOUT_SECS,
            udp_connection_timeout_secs: DEF_CONNECTION_TIMEOUT_SECS,
            max_connections: DEF_MAX_CONNECTIONS,
            tracker_shards: DEF_TRACKER_SHARDS,
            udp_queue_len: DEF_UDP_QUEUE_LEN,
            udp_retransmit_interval_ms: 1000,
            udp_retransmit_attempts: 3,
            token_validity_secs: 60,
            compression: CompressionType::None,
            encryption: false,
            expiry_interval_ms: 1000,
            application_queues: vec![0, 1, 2, 3],
            network_queues: vec![4, 5, 6, 7],
        }
    }
}
