// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A mutable view over one intercepted IPv4 datagram.
//!
//! The datapath hides its handshake inside ordinary TCP and UDP
//! traffic, so a [`Packet`] supports exactly the surgery required for
//! that: appending and removing the auth option, inserting and
//! removing bytes at the start of the payload, shifting sequence
//! numbers to account for those bytes, and recomputing every length
//! and checksum afterwards.
//!
//! # Sequence numbers
//!
//! Every byte injected on the sending side is removed on the
//! receiving side, and the sequence shift applied by
//! [`Packet::adjust_for_injected_bytes()`] is exactly undone by
//! [`Packet::undo_injected_bytes()`]. The two TCP stacks therefore
//! never see each other's tokens and agree on the byte stream as if
//! the datapath were not there.

use super::checksum::HeaderChecksum;
use super::ip4;
use super::ip4::IPV4_HDR_CSUM_OFFSET;
use super::ip4::IPV4_HDR_SZ;
use super::ip4::IPV4_VERSION;
use super::ip4::Ipv4HdrRaw;
use super::tcp;
use super::tcp::TCP_AUTH_OPTION;
use super::tcp::TCP_HDR_CSUM_OFFSET;
use super::tcp::TCP_HDR_MAX_SZ;
use super::tcp::TCP_HDR_SZ;
use super::tcp::TcpFlags;
use super::tcp::TcpHdrRaw;
use super::udp::UDP_HDR_CSUM_OFFSET;
use super::udp::UDP_HDR_SZ;
use super::udp::UdpHdrRaw;
use super::udp::UdpMarker;
use crate::api::Direction;
use crate::api::FlowId;
use crate::api::PROTO_TCP;
use crate::api::PROTO_UDP;
use crate::api::Protocol;
use crate::api::SourcePortKey;
use core::fmt;
use core::fmt::Display;
use zerocopy::FromBytes;

/// The largest datagram an IPv4 total length can describe.
pub const IPV4_MAX_LEN: usize = u16::MAX as usize;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The buffer ended before the named header did.
    Truncated { layer: &'static str, need: usize, have: usize },

    /// A header length or total length field is inconsistent with
    /// the buffer.
    BadLength { layer: &'static str, expected: usize, actual: usize },

    /// Only IPv4 is intercepted.
    BadVersion(u8),

    /// Anything other than TCP or UDP. The caller decides whether
    /// such traffic passes.
    UnsupportedProtocol(u8),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated { layer, need, have } => {
                write!(f, "truncated {layer} header: need {need}, have {have}")
            }

            Self::BadLength { layer, expected, actual } => write!(
                f,
                "bad {layer} length: expected {expected}, actual {actual}"
            ),

            Self::BadVersion(v) => write!(f, "bad IP version: {v}"),

            Self::UnsupportedProtocol(p) => {
                write!(f, "unsupported protocol: {p}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketError {
    /// The TCP header has no room left for another option.
    OptionsFull,

    /// The auth option was expected but not found.
    MissingOption,

    /// The operation only applies to the other protocol.
    WrongProtocol { expected: Protocol, actual: Protocol },

    /// A payload range reaches past the end of the payload.
    OutOfRange { offset: usize, len: usize, payload_len: usize },

    /// The result would not fit in an IPv4 datagram.
    TooLarge(usize),
}

impl Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OptionsFull => write!(f, "no room for TCP option"),
            Self::MissingOption => write!(f, "auth option not present"),
            Self::WrongProtocol { expected, actual } => {
                write!(f, "expected {expected} packet, got {actual}")
            }
            Self::OutOfRange { offset, len, payload_len } => write!(
                f,
                "range {offset}+{len} outside payload of {payload_len} bytes"
            ),
            Self::TooLarge(len) => write!(f, "packet too large: {len}"),
        }
    }
}

impl std::error::Error for PacketError {}

/// A parsed IPv4 TCP or UDP datagram that owns its bytes.
///
/// The header lengths are cached at parse time and kept up to date by
/// every mutation, so the buffer is always a well-formed datagram
/// apart from its checksums, which are only valid after
/// [`Packet::update_checksums()`].
#[derive(Clone, Debug)]
pub struct Packet {
    buf: Vec<u8>,
    dir: Direction,
    mark: u32,
    proto: Protocol,
    ip_hdr_len: usize,
    l4_hdr_len: usize,
}

impl Packet {
    /// Parse `buf` as an IPv4 datagram.
    ///
    /// Bytes past the IP total length (link-layer padding) are
    /// discarded.
    pub fn parse(mut buf: Vec<u8>, dir: Direction) -> Result<Self, ParseError> {
        let (ip, _) = Ipv4HdrRaw::ref_from_prefix(&buf[..]).map_err(|_| {
            ParseError::Truncated {
                layer: "IPv4",
                need: IPV4_HDR_SZ,
                have: buf.len(),
            }
        })?;

        if ip.version() != IPV4_VERSION {
            return Err(ParseError::BadVersion(ip.version()));
        }

        let ip_hdr_len = ip.hdr_len();
        if ip_hdr_len < IPV4_HDR_SZ || ip_hdr_len > buf.len() {
            return Err(ParseError::BadLength {
                layer: "IPv4 header",
                expected: ip_hdr_len,
                actual: buf.len(),
            });
        }

        let total_len = usize::from(ip.total_len());
        if total_len < ip_hdr_len || total_len > buf.len() {
            return Err(ParseError::BadLength {
                layer: "IPv4 total",
                expected: total_len,
                actual: buf.len(),
            });
        }

        let proto = Protocol::from(ip.proto);
        buf.truncate(total_len);
        let l4 = &buf[ip_hdr_len..];

        let l4_hdr_len = match proto {
            Protocol::TCP => {
                let (tcp, _) =
                    TcpHdrRaw::ref_from_prefix(l4).map_err(|_| {
                        ParseError::Truncated {
                            layer: "TCP",
                            need: TCP_HDR_SZ,
                            have: l4.len(),
                        }
                    })?;

                let len = tcp.hdr_len();
                if len < TCP_HDR_SZ || len > l4.len() {
                    return Err(ParseError::BadLength {
                        layer: "TCP header",
                        expected: len,
                        actual: l4.len(),
                    });
                }
                len
            }

            Protocol::UDP => {
                let (udp, _) =
                    UdpHdrRaw::ref_from_prefix(l4).map_err(|_| {
                        ParseError::Truncated {
                            layer: "UDP",
                            need: UDP_HDR_SZ,
                            have: l4.len(),
                        }
                    })?;

                let len = usize::from(udp.length());
                if len != l4.len() {
                    return Err(ParseError::BadLength {
                        layer: "UDP",
                        expected: len,
                        actual: l4.len(),
                    });
                }
                UDP_HDR_SZ
            }

            Protocol::Unknown(p) => {
                return Err(ParseError::UnsupportedProtocol(p));
            }
        };

        Ok(Self { buf, dir, mark: 0, proto, ip_hdr_len, l4_hdr_len })
    }

    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn l4_start(&self) -> usize {
        self.ip_hdr_len
    }

    fn payload_start(&self) -> usize {
        self.ip_hdr_len + self.l4_hdr_len
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_start()..]
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.payload_start()
    }

    /// The flow this packet belongs to, as seen on the wire.
    pub fn flow(&self) -> FlowId {
        let be16 = |i: usize| u16::from_be_bytes([self.buf[i], self.buf[i + 1]]);
        let l4 = self.l4_start();
        FlowId {
            proto: self.proto,
            src_ip: [self.buf[12], self.buf[13], self.buf[14], self.buf[15]]
                .into(),
            src_port: be16(l4),
            dst_ip: [self.buf[16], self.buf[17], self.buf[18], self.buf[19]]
                .into(),
            dst_port: be16(l4 + 2),
        }
    }

    pub fn reverse_flow(&self) -> FlowId {
        self.flow().mirror()
    }

    pub fn source_port_key(&self) -> SourcePortKey {
        self.flow().source_port_key(self.dir)
    }

    fn expect(&self, proto: Protocol) -> Result<(), PacketError> {
        if self.proto != proto {
            return Err(PacketError::WrongProtocol {
                expected: proto,
                actual: self.proto,
            });
        }
        Ok(())
    }

    /// The TCP flags, or no flags at all for UDP.
    pub fn tcp_flags(&self) -> TcpFlags {
        match self.proto {
            Protocol::TCP => {
                TcpFlags::from_bits_retain(self.buf[self.l4_start() + 13])
            }
            _ => TcpFlags::empty(),
        }
    }

    fn tcp_u32(&self, off: usize) -> u32 {
        let i = self.l4_start() + off;
        u32::from_be_bytes([
            self.buf[i],
            self.buf[i + 1],
            self.buf[i + 2],
            self.buf[i + 3],
        ])
    }

    fn set_tcp_u32(&mut self, off: usize, val: u32) {
        let i = self.l4_start() + off;
        self.buf[i..i + 4].copy_from_slice(&val.to_be_bytes());
    }

    pub fn tcp_seq(&self) -> u32 {
        self.tcp_u32(4)
    }

    pub fn tcp_ack(&self) -> u32 {
        self.tcp_u32(8)
    }

    /// The options area of the TCP header.
    pub fn tcp_options(&self) -> &[u8] {
        match self.proto {
            Protocol::TCP => {
                &self.buf[self.l4_start() + TCP_HDR_SZ..self.payload_start()]
            }
            _ => &[],
        }
    }

    pub fn has_auth_option(&self) -> bool {
        tcp::has_auth_option(self.tcp_options())
    }

    /// The UDP handshake marker, if this is a handshake packet.
    pub fn udp_marker(&self) -> Option<UdpMarker> {
        match self.proto {
            Protocol::UDP => UdpMarker::parse(self.payload()),
            _ => None,
        }
    }

    /// Append the auth option after the existing TCP options.
    pub fn append_auth_option(&mut self) -> Result<(), PacketError> {
        self.expect(Protocol::TCP)?;
        if self.l4_hdr_len + TCP_AUTH_OPTION.len() > TCP_HDR_MAX_SZ {
            return Err(PacketError::OptionsFull);
        }

        let at = self.payload_start();
        self.splice(at, 0, &TCP_AUTH_OPTION)?;
        self.l4_hdr_len += TCP_AUTH_OPTION.len();
        self.sync_lengths()
    }

    /// Remove the auth option wherever it sits in the options area.
    pub fn remove_auth_option(&mut self) -> Result<(), PacketError> {
        self.expect(Protocol::TCP)?;
        let opts_start = self.l4_start() + TCP_HDR_SZ;
        let pos = tcp::find_auth_option(self.tcp_options())
            .ok_or(PacketError::MissingOption)?;

        self.splice(opts_start + pos, TCP_AUTH_OPTION.len(), &[])?;
        self.l4_hdr_len -= TCP_AUTH_OPTION.len();
        self.sync_lengths()
    }

    /// Insert `bytes` into the payload at `offset`.
    pub fn insert_payload(
        &mut self,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), PacketError> {
        self.check_range(offset, 0)?;
        let at = self.payload_start() + offset;
        self.splice(at, 0, bytes)?;
        self.sync_lengths()
    }

    /// Remove and return `len` payload bytes starting at `offset`.
    pub fn remove_payload(
        &mut self,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, PacketError> {
        self.check_range(offset, len)?;
        let at = self.payload_start() + offset;
        let removed = self.buf.drain(at..at + len).collect();
        self.sync_lengths()?;
        Ok(removed)
    }

    /// Replace the whole payload.
    pub fn set_payload(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        let at = self.payload_start();
        let len = self.payload_len();
        self.splice(at, len, bytes)?;
        self.sync_lengths()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), PacketError> {
        let payload_len = self.payload_len();
        match offset.checked_add(len) {
            Some(end) if end <= payload_len => Ok(()),
            _ => Err(PacketError::OutOfRange { offset, len, payload_len }),
        }
    }

    fn splice(
        &mut self,
        at: usize,
        remove: usize,
        insert: &[u8],
    ) -> Result<(), PacketError> {
        let new_len = self.buf.len() - remove + insert.len();
        if new_len > IPV4_MAX_LEN {
            return Err(PacketError::TooLarge(new_len));
        }
        self.buf.splice(at..at + remove, insert.iter().copied());
        Ok(())
    }

    /// Rewrite the IP total length and the transport length fields
    /// from the current buffer.
    fn sync_lengths(&mut self) -> Result<(), PacketError> {
        let total = u16::try_from(self.buf.len())
            .map_err(|_| PacketError::TooLarge(self.buf.len()))?;
        let (ip, rest) = self.buf.split_at_mut(self.ip_hdr_len);
        if let Ok((ip, _)) = Ipv4HdrRaw::mut_from_prefix(ip) {
            ip.set_total_len(total);
        }

        match self.proto {
            Protocol::TCP => {
                if let Ok((tcp, _)) = TcpHdrRaw::mut_from_prefix(rest) {
                    tcp.set_hdr_len(self.l4_hdr_len);
                }
            }

            Protocol::UDP => {
                let len = rest.len() as u16;
                if let Ok((udp, _)) = UdpHdrRaw::mut_from_prefix(rest) {
                    udp.set_length(len);
                }
            }

            Protocol::Unknown(_) => {}
        }

        Ok(())
    }

    /// Shift the sequence and acknowledgement numbers back by the
    /// number of bytes injected ahead of them.
    pub fn adjust_for_injected_bytes(&mut self, seq: u32, ack: u32) {
        if self.proto != Protocol::TCP {
            return;
        }
        self.set_tcp_u32(4, self.tcp_seq().wrapping_sub(seq));
        self.set_tcp_u32(8, self.tcp_ack().wrapping_sub(ack));
    }

    /// The exact inverse of [`Packet::adjust_for_injected_bytes()`].
    pub fn undo_injected_bytes(&mut self, seq: u32, ack: u32) {
        if self.proto != Protocol::TCP {
            return;
        }
        self.set_tcp_u32(4, self.tcp_seq().wrapping_add(seq));
        self.set_tcp_u32(8, self.tcp_ack().wrapping_add(ack));
    }

    /// Recompute the IP header checksum and the TCP or UDP checksum.
    pub fn update_checksums(&mut self) {
        let ip_len = self.ip_hdr_len;
        let ip_csum = ip4::header_checksum(&self.buf[..ip_len]);
        self.buf[IPV4_HDR_CSUM_OFFSET..IPV4_HDR_CSUM_OFFSET + 2]
            .copy_from_slice(&ip_csum.bytes());

        let (csum_off, proto) = match self.proto {
            Protocol::TCP => (TCP_HDR_CSUM_OFFSET, PROTO_TCP),
            Protocol::UDP => (UDP_HDR_CSUM_OFFSET, PROTO_UDP),
            Protocol::Unknown(_) => return,
        };

        let flow = self.flow();
        let l4 = &self.buf[ip_len..];
        let mut csum =
            ip4::pseudo_header(flow.src_ip, flow.dst_ip, proto, l4.len() as u16);
        csum.add_bytes(&l4[..csum_off]);
        csum.add_bytes(&l4[csum_off + 2..]);
        let mut bytes = HeaderChecksum::from(csum).bytes();

        // A computed UDP checksum of zero is transmitted as all ones.
        if self.proto == Protocol::UDP && bytes == [0, 0] {
            bytes = [0xFF, 0xFF];
        }

        let at = ip_len + csum_off;
        self.buf[at..at + 2].copy_from_slice(&bytes);
    }

    /// Build a UDP handshake packet from the headers of this one.
    ///
    /// The IP and UDP headers are copied (swapped when `reverse` is
    /// set, for answering the peer) and the payload becomes the
    /// marker followed by `token`. The result travels towards the
    /// network.
    pub fn udp_handshake(
        &self,
        reverse: bool,
        marker: UdpMarker,
        token: &[u8],
    ) -> Result<Packet, PacketError> {
        self.expect(Protocol::UDP)?;
        let hdrs = self.payload_start();
        let mut buf = Vec::with_capacity(hdrs + marker.emit().len() + token.len());
        buf.extend_from_slice(&self.buf[..hdrs]);
        buf.extend_from_slice(&marker.emit());
        buf.extend_from_slice(token);

        if reverse {
            let (ip, rest) = buf.split_at_mut(self.ip_hdr_len);
            let mut src = [0u8; 4];
            src.copy_from_slice(&ip[12..16]);
            ip.copy_within(16..20, 12);
            ip[16..20].copy_from_slice(&src);

            let ports = [rest[2], rest[3], rest[0], rest[1]];
            rest[..4].copy_from_slice(&ports);
        }

        let mut pkt = Packet {
            buf,
            dir: Direction::Out,
            mark: self.mark,
            proto: Protocol::UDP,
            ip_hdr_len: self.ip_hdr_len,
            l4_hdr_len: UDP_HDR_SZ,
        };
        pkt.sync_lengths()?;
        pkt.update_checksums();
        Ok(pkt)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::udp::UdpPacketType;

    // 10.0.0.1:40000 -> 10.0.0.2:80, SYN, seq 1000, MSS option.
    #[rustfmt::skip]
    const SYN: [u8; 44] = [
        // IPv4
        0x45, 0x00, 0x00, 0x2c, 0x00, 0x01, 0x40, 0x00,
        0x40, 0x06, 0x00, 0x00, 10, 0, 0, 1, 10, 0, 0, 2,
        // TCP
        0x9c, 0x40, 0x00, 0x50, 0x00, 0x00, 0x03, 0xe8,
        0x00, 0x00, 0x00, 0x00, 0x60, 0x02, 0xff, 0xff,
        0x00, 0x00, 0x00, 0x00,
        // MSS 1460
        0x02, 0x04, 0x05, 0xb4,
    ];

    // 10.0.0.1:5000 -> 10.0.0.2:53, "hello".
    #[rustfmt::skip]
    const UDP: [u8; 33] = [
        0x45, 0x00, 0x00, 0x21, 0x00, 0x02, 0x40, 0x00,
        0x40, 0x11, 0x00, 0x00, 10, 0, 0, 1, 10, 0, 0, 2,
        0x13, 0x88, 0x00, 0x35, 0x00, 0x0d, 0x00, 0x00,
        b'h', b'e', b'l', b'l', b'o',
    ];

    fn syn() -> Packet {
        Packet::parse(SYN.to_vec(), Direction::Out).unwrap()
    }

    #[test]
    fn parse_tcp() {
        let pkt = syn();
        assert_eq!(pkt.proto(), Protocol::TCP);
        assert_eq!(pkt.flow().to_string(), "TCP:10.0.0.1:40000:10.0.0.2:80");
        assert_eq!(pkt.tcp_flags(), TcpFlags::SYN);
        assert_eq!(pkt.tcp_seq(), 1000);
        assert_eq!(pkt.tcp_options(), &[0x02, 0x04, 0x05, 0xb4]);
        assert_eq!(pkt.payload_len(), 0);
        assert!(!pkt.has_auth_option());
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Packet::parse(SYN[..10].to_vec(), Direction::Out),
            Err(ParseError::Truncated { layer: "IPv4", .. })
        ));

        let mut v6 = SYN.to_vec();
        v6[0] = 0x65;
        assert_eq!(
            Packet::parse(v6, Direction::Out).unwrap_err(),
            ParseError::BadVersion(6)
        );

        let mut icmp = SYN.to_vec();
        icmp[9] = 1;
        assert_eq!(
            Packet::parse(icmp, Direction::Out).unwrap_err(),
            ParseError::UnsupportedProtocol(1)
        );

        let mut long = SYN.to_vec();
        long[3] = 0x40;
        assert!(matches!(
            Packet::parse(long, Direction::Out),
            Err(ParseError::BadLength { layer: "IPv4 total", .. })
        ));
    }

    #[test]
    fn link_padding_is_trimmed() {
        let mut padded = UDP.to_vec();
        padded.extend_from_slice(&[0; 7]);
        let pkt = Packet::parse(padded, Direction::In).unwrap();
        assert_eq!(pkt.len(), UDP.len());
        assert_eq!(pkt.payload(), b"hello");
    }

    #[test]
    fn auth_option_and_token_surgery() {
        let mut pkt = syn();
        let token = [0xAAu8; 24];

        pkt.append_auth_option().unwrap();
        pkt.insert_payload(0, &token).unwrap();
        pkt.adjust_for_injected_bytes(24 + 69, 0);
        pkt.update_checksums();

        assert!(pkt.has_auth_option());
        assert_eq!(pkt.len(), SYN.len() + 4 + 24);
        assert_eq!(pkt.payload(), &token);
        assert_eq!(pkt.tcp_seq(), 1000u32.wrapping_sub(93));
        assert_eq!(&pkt.bytes()[2..4], &(pkt.len() as u16).to_be_bytes());

        // Strip on the far side.
        let mut rcv = Packet::parse(pkt.into_bytes(), Direction::In).unwrap();
        assert!(rcv.has_auth_option());
        assert_eq!(rcv.remove_payload(0, 24).unwrap(), token);
        rcv.remove_auth_option().unwrap();
        rcv.undo_injected_bytes(24 + 69, 0);
        rcv.update_checksums();

        let mut expected = Packet::parse(SYN.to_vec(), Direction::In).unwrap();
        expected.update_checksums();
        assert_eq!(rcv.bytes(), expected.bytes());
    }

    #[test]
    fn sequence_adjust_wraps_and_reverts() {
        let mut pkt = syn();
        pkt.adjust_for_injected_bytes(2000, 69);
        assert_eq!(pkt.tcp_seq(), 1000u32.wrapping_sub(2000));
        assert_eq!(pkt.tcp_ack(), 0u32.wrapping_sub(69));
        pkt.undo_injected_bytes(2000, 69);
        assert_eq!(pkt.tcp_seq(), 1000);
        assert_eq!(pkt.tcp_ack(), 0);
    }

    #[test]
    fn options_full() {
        let mut pkt = syn();
        for _ in 0..9 {
            pkt.append_auth_option().unwrap();
        }
        assert_eq!(pkt.append_auth_option(), Err(PacketError::OptionsFull));
    }

    #[test]
    fn missing_option() {
        let mut pkt = syn();
        assert_eq!(pkt.remove_auth_option(), Err(PacketError::MissingOption));
    }

    #[test]
    fn payload_range_checked() {
        let mut pkt = syn();
        assert!(matches!(
            pkt.remove_payload(0, 1),
            Err(PacketError::OutOfRange { .. })
        ));
        assert!(matches!(
            pkt.insert_payload(3, b"x"),
            Err(PacketError::OutOfRange { .. })
        ));
    }

    #[test]
    fn udp_handshake_reverse() {
        let pkt = Packet::parse(UDP.to_vec(), Direction::In).unwrap();
        let marker = UdpMarker::new(UdpPacketType::SynAck, false);
        let hs = pkt.udp_handshake(true, marker, b"token").unwrap();

        assert_eq!(hs.dir(), Direction::Out);
        assert_eq!(hs.flow(), pkt.reverse_flow());
        assert_eq!(hs.udp_marker(), Some(marker));
        assert_eq!(&hs.payload()[20..], b"token");
        assert_eq!(hs.len(), 20 + 8 + 20 + 5);

        let again = Packet::parse(hs.bytes().to_vec(), Direction::In).unwrap();
        assert_eq!(again.flow(), hs.flow());
    }

    #[test]
    fn tcp_ops_refuse_udp() {
        let mut pkt = Packet::parse(UDP.to_vec(), Direction::Out).unwrap();
        assert!(matches!(
            pkt.append_auth_option(),
            Err(PacketError::WrongProtocol { .. })
        ));
        assert_eq!(pkt.tcp_flags(), TcpFlags::empty());
    }
}
