// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Building raw IPv4 packets with smoltcp.

use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Address;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use smoltcp::wire::TcpPacket;
use smoltcp::wire::TcpSeqNumber;
use smoltcp::wire::UdpPacket;
use std::net::Ipv4Addr;

pub const IPV4_HDR_LEN: usize = 20;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

/// The TCP flags a test segment carries.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub psh: bool,
    pub fin: bool,
    pub rst: bool,
}

pub const SYN: Flags =
    Flags { syn: true, ack: false, psh: false, fin: false, rst: false };
pub const SYN_ACK: Flags =
    Flags { syn: true, ack: true, psh: false, fin: false, rst: false };
pub const ACK: Flags =
    Flags { syn: false, ack: true, psh: false, fin: false, rst: false };
pub const PSH_ACK: Flags =
    Flags { syn: false, ack: true, psh: true, fin: false, rst: false };
pub const FIN_ACK: Flags =
    Flags { syn: false, ack: true, psh: false, fin: true, rst: false };

/// One end of a flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: &str, port: u16) -> Self {
        Self { ip: ip.parse().unwrap(), port }
    }
}

fn ip_addr(ip: Ipv4Addr) -> IpAddress {
    IpAddress::Ipv4(Ipv4Address::from_bytes(&ip.octets()))
}

fn ipv4(src: Endpoint, dst: Endpoint, proto: IpProtocol, l4_len: usize) -> Vec<u8> {
    let repr = Ipv4Repr {
        src_addr: Ipv4Address::from_bytes(&src.ip.octets()),
        dst_addr: Ipv4Address::from_bytes(&dst.ip.octets()),
        next_header: proto,
        payload_len: l4_len,
        hop_limit: 64,
    };

    let mut buf = vec![0u8; IPV4_HDR_LEN + l4_len];
    repr.emit(&mut Ipv4Packet::new_unchecked(&mut buf), &Default::default());
    buf
}

/// A TCP segment from `src` to `dst`. An `ack` of zero leaves the
/// acknowledgement number unset.
pub fn tcp(
    src: Endpoint,
    dst: Endpoint,
    flags: Flags,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = ipv4(src, dst, IpProtocol::Tcp, TCP_HDR_LEN + payload.len());

    let mut seg = TcpPacket::new_unchecked(&mut buf[IPV4_HDR_LEN..]);
    seg.set_src_port(src.port);
    seg.set_dst_port(dst.port);
    seg.set_seq_number(TcpSeqNumber(seq as i32));
    seg.set_ack_number(TcpSeqNumber(ack as i32));
    seg.set_header_len(TCP_HDR_LEN as u8);
    seg.clear_flags();
    seg.set_syn(flags.syn);
    seg.set_ack(flags.ack);
    seg.set_psh(flags.psh);
    seg.set_fin(flags.fin);
    seg.set_rst(flags.rst);
    seg.set_window_len(64240);
    seg.set_urgent_at(0);
    seg.payload_mut().copy_from_slice(payload);
    seg.fill_checksum(&ip_addr(src.ip), &ip_addr(dst.ip));

    buf
}

/// A UDP datagram from `src` to `dst`.
pub fn udp(src: Endpoint, dst: Endpoint, payload: &[u8]) -> Vec<u8> {
    let len = UDP_HDR_LEN + payload.len();
    let mut buf = ipv4(src, dst, IpProtocol::Udp, len);

    let mut dgram = UdpPacket::new_unchecked(&mut buf[IPV4_HDR_LEN..]);
    dgram.set_src_port(src.port);
    dgram.set_dst_port(dst.port);
    dgram.set_len(len as u16);
    dgram.payload_mut().copy_from_slice(payload);
    dgram.fill_checksum(&ip_addr(src.ip), &ip_addr(dst.ip));

    buf
}

/// An ICMP echo request, which the datapath never inspects.
pub fn icmp_echo(src: Endpoint, dst: Endpoint) -> Vec<u8> {
    let mut buf = ipv4(src, dst, IpProtocol::Icmp, 8);
    buf[IPV4_HDR_LEN..].copy_from_slice(&[8, 0, 0xf7, 0xff, 0, 0, 0, 0]);
    buf
}

/// The TCP sequence number of a raw IPv4 segment.
pub fn tcp_seq(pkt: &[u8]) -> u32 {
    let at = ip_hdr_len(pkt) + 4;
    u32::from_be_bytes([pkt[at], pkt[at + 1], pkt[at + 2], pkt[at + 3]])
}

/// The TCP acknowledgement number of a raw IPv4 segment.
pub fn tcp_ack(pkt: &[u8]) -> u32 {
    let at = ip_hdr_len(pkt) + 8;
    u32::from_be_bytes([pkt[at], pkt[at + 1], pkt[at + 2], pkt[at + 3]])
}

/// The transport payload of a raw IPv4 TCP or UDP packet.
pub fn l4_payload(pkt: &[u8]) -> &[u8] {
    let ip_len = ip_hdr_len(pkt);
    let l4_len = match pkt[9] {
        6 => usize::from(pkt[ip_len + 12] >> 4) * 4,
        _ => UDP_HDR_LEN,
    };
    &pkt[ip_len + l4_len..]
}

fn ip_hdr_len(pkt: &[u8]) -> usize {
    usize::from(pkt[0] & 0x0f) * 4
}
