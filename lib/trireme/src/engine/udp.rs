// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! UDP headers and the handshake marker.

use core::fmt;
use core::fmt::Display;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const UDP_HDR_SZ: usize = core::mem::size_of::<UdpHdrRaw>();
pub const UDP_HDR_CSUM_OFFSET: usize = 6;

/// The marker prefixing the payload of every UDP handshake packet.
pub const UDP_MARKER_LEN: usize = 20;

/// Identifies a handshake packet; occupies bytes 2..20 of the marker.
pub const UDP_MARKER_MAGIC: [u8; 18] = *b"trireme-handshake!";

/// Marker protocol version.
pub const UDP_MARKER_VERSION: u8 = 1;

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct UdpHdrRaw {
    pub src_port: [u8; 2],
    pub dst_port: [u8; 2],
    pub length: [u8; 2],
    pub csum: [u8; 2],
}

impl UdpHdrRaw {
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port)
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes(self.length)
    }

    pub fn set_length(&mut self, len: u16) {
        self.length = len.to_be_bytes();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UdpPacketType {
    Syn,
    SynAck,
    Ack,
    Rst,
}

impl UdpPacketType {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Syn),
            2 => Some(Self::SynAck),
            3 => Some(Self::Ack),
            4 => Some(Self::Rst),
            _ => None,
        }
    }

    fn bits(&self) -> u8 {
        match self {
            Self::Syn => 1,
            Self::SynAck => 2,
            Self::Ack => 3,
            Self::Rst => 4,
        }
    }
}

impl Display for UdpPacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Syn => "SYN",
            Self::SynAck => "SYN-ACK",
            Self::Ack => "ACK",
            Self::Rst => "RST",
        };
        write!(f, "{s}")
    }
}

/// The decoded first bytes of a UDP handshake payload.
///
/// Byte 0 carries the encrypt bit (bit 0), the packet type (bits 3..1)
/// and the marker version (bits 6..4). Byte 1 is reserved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UdpMarker {
    pub kind: UdpPacketType,
    pub encrypt: bool,
}

impl UdpMarker {
    pub fn new(kind: UdpPacketType, encrypt: bool) -> Self {
        Self { kind, encrypt }
    }

    /// Decode the marker at the start of a UDP payload.
    ///
    /// Returns `None` for ordinary data: short payloads, a magic
    /// mismatch, or an unknown type or version.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < UDP_MARKER_LEN
            || payload[2..UDP_MARKER_LEN] != UDP_MARKER_MAGIC
        {
            return None;
        }

        let b = payload[0];
        if (b >> 4) & 0x07 != UDP_MARKER_VERSION {
            return None;
        }

        let kind = UdpPacketType::from_bits((b >> 1) & 0x07)?;
        Some(Self { kind, encrypt: b & 0x01 != 0 })
    }

    pub fn emit(&self) -> [u8; UDP_MARKER_LEN] {
        let mut out = [0u8; UDP_MARKER_LEN];
        out[0] = (UDP_MARKER_VERSION << 4)
            | (self.kind.bits() << 1)
            | u8::from(self.encrypt);
        out[2..].copy_from_slice(&UDP_MARKER_MAGIC);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn marker_layout() {
        let m = UdpMarker::new(UdpPacketType::SynAck, true);
        let bytes = m.emit();
        assert_eq!(bytes[0], 0b0001_0101);
        assert_eq!(bytes[1], 0);
        assert_eq!(UdpMarker::parse(&bytes), Some(m));
    }

    #[test]
    fn data_is_not_a_marker() {
        assert_eq!(UdpMarker::parse(b"hello"), None);
        assert_eq!(UdpMarker::parse(&[0u8; 64]), None);

        // Right magic, unknown type.
        let mut bytes = UdpMarker::new(UdpPacketType::Ack, false).emit();
        bytes[0] = (UDP_MARKER_VERSION << 4) | (7 << 1);
        assert_eq!(UdpMarker::parse(&bytes), None);
    }
}
