// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 headers.

use super::checksum::Checksum;
use super::checksum::HeaderChecksum;
use core::net::Ipv4Addr;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const IPV4_HDR_SZ: usize = core::mem::size_of::<Ipv4HdrRaw>();
pub const IPV4_HDR_MAX_SZ: usize = 60;
pub const IPV4_VERSION: u8 = 4;
pub const IPV4_HDR_CSUM_OFFSET: usize = 10;

/// Note: For now we keep this unaligned to be safe.
#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct Ipv4HdrRaw {
    pub ver_hdr_len: u8,
    pub dscp_ecn: u8,
    pub total_len: [u8; 2],
    pub ident: [u8; 2],
    pub frag_and_flags: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4HdrRaw {
    pub fn version(&self) -> u8 {
        self.ver_hdr_len >> 4
    }

    /// Header length in bytes, options included.
    pub fn hdr_len(&self) -> usize {
        usize::from(self.ver_hdr_len & 0x0F) * 4
    }

    pub fn total_len(&self) -> u16 {
        u16::from_be_bytes(self.total_len)
    }

    pub fn set_total_len(&mut self, len: u16) {
        self.total_len = len.to_be_bytes();
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }

    pub fn set_src(&mut self, ip: Ipv4Addr) {
        self.src = ip.octets();
    }

    pub fn set_dst(&mut self, ip: Ipv4Addr) {
        self.dst = ip.octets();
    }
}

/// Compute the header checksum over `hdr`, ignoring whatever value
/// currently occupies the checksum field.
pub fn header_checksum(hdr: &[u8]) -> HeaderChecksum {
    let mut csum = Checksum::compute(&hdr[..IPV4_HDR_CSUM_OFFSET]);
    csum.add_bytes(&hdr[IPV4_HDR_CSUM_OFFSET + 2..]);
    HeaderChecksum::from(csum)
}

/// The pseudo-header sum used as the starting point of the TCP and
/// UDP checksums.
pub fn pseudo_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: u8,
    l4_len: u16,
) -> Checksum {
    let len = l4_len.to_be_bytes();
    let mut csum = Checksum::compute(&src.octets());
    csum.add_bytes(&dst.octets());
    csum.add_bytes(&[0, proto, len[0], len[1]]);
    csum
}

#[cfg(test)]
mod test {
    use super::*;

    // 192.168.0.1 -> 192.168.0.199, TCP, 60 bytes total.
    const HDR: [u8; 20] = [
        0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0xb1,
        0xe6, 0xac, 0x10, 0x0a, 0x63, 0xac, 0x10, 0x0a, 0x0c,
    ];

    #[test]
    fn parse_fields() {
        let (hdr, _) = Ipv4HdrRaw::ref_from_prefix(&HDR[..]).unwrap();
        assert_eq!(hdr.version(), IPV4_VERSION);
        assert_eq!(hdr.hdr_len(), IPV4_HDR_SZ);
        assert_eq!(hdr.total_len(), 60);
        assert_eq!(hdr.proto, 6);
        assert_eq!(hdr.src(), Ipv4Addr::new(172, 16, 10, 99));
        assert_eq!(hdr.dst(), Ipv4Addr::new(172, 16, 10, 12));
    }

    #[test]
    fn checksum_matches_wire() {
        assert_eq!(header_checksum(&HDR).bytes(), [0xb1, 0xe6]);
    }
}
