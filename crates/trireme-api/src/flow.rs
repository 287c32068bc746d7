// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow identification.

use super::Direction;
use core::fmt;
use core::fmt::Display;
use core::net::Ipv4Addr;
use serde::Deserialize;
use serde::Serialize;

pub const PROTO_TCP: u8 = 0x6;
pub const PROTO_UDP: u8 = 0x11;

/// The transport protocols the datapath understands.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Protocol {
    TCP,
    UDP,
    Unknown(u8),
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Unknown(255)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::Unknown(p) => write!(f, "Unknown({p})"),
        }
    }
}

impl From<u8> for Protocol {
    fn from(proto: u8) -> Self {
        match proto {
            PROTO_TCP => Self::TCP,
            PROTO_UDP => Self::UDP,
            _ => Self::Unknown(proto),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        match proto {
            Protocol::TCP => PROTO_TCP,
            Protocol::UDP => PROTO_UDP,
            Protocol::Unknown(v) => v,
        }
    }
}

/// The flow identifier: the 5-tuple of an IPv4 packet.
///
/// This is the key of every connection cache. The [`Display`] form
/// is the deterministic flow hash string used in logs and telemetry.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct FlowId {
    pub proto: Protocol,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowId {
    /// The identifier of the reply direction of this flow.
    pub fn mirror(&self) -> Self {
        Self {
            proto: self.proto,
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }

    /// The endpoint that belongs to the local processing unit, given
    /// where the packet came from.
    pub fn local_endpoint(&self, dir: Direction) -> (Ipv4Addr, u16) {
        match dir {
            Direction::Out => (self.src_ip, self.src_port),
            Direction::In => (self.dst_ip, self.dst_port),
        }
    }

    /// The endpoint of the peer, given where the packet came from.
    pub fn remote_endpoint(&self, dir: Direction) -> (Ipv4Addr, u16) {
        match dir {
            Direction::Out => (self.dst_ip, self.dst_port),
            Direction::In => (self.src_ip, self.src_port),
        }
    }

    /// The key used to correlate a SYN-ACK with the SYN that started
    /// the flow when the full 5-tuple is not reliable (NAT, port
    /// forwarding). An application SYN and the network SYN-ACK
    /// answering it produce the same key.
    pub fn source_port_key(&self, dir: Direction) -> SourcePortKey {
        let (ip, port) = self.local_endpoint(dir);
        SourcePortKey { proto: self.proto, ip, port }
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port,
        )
    }
}

/// See [`FlowId::source_port_key`].
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct SourcePortKey {
    pub proto: Protocol,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Display for SourcePortKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.proto, self.ip, self.port)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    fn flow() -> FlowId {
        FlowId {
            proto: Protocol::TCP,
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: 40000,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 80,
        }
    }

    #[test]
    fn flow_hash_strings() {
        let f = flow();
        assert_eq!(f.to_string(), "TCP:10.0.0.1:40000:10.0.0.2:80");
        assert_eq!(f.mirror().to_string(), "TCP:10.0.0.2:80:10.0.0.1:40000");
        assert_eq!(f.mirror().mirror(), f);
    }

    #[test]
    fn syn_and_synack_share_source_port_key() {
        let syn = flow();
        let synack = syn.mirror();
        assert_eq!(
            syn.source_port_key(Direction::Out),
            synack.source_port_key(Direction::In)
        );
        assert_ne!(
            syn.source_port_key(Direction::Out),
            syn.source_port_key(Direction::In)
        );
    }
}
