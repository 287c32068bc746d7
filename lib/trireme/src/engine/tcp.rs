// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP headers and the handshake authentication option.

use core::fmt;
use core::fmt::Display;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const TCP_HDR_SZ: usize = core::mem::size_of::<TcpHdrRaw>();
pub const TCP_HDR_MAX_SZ: usize = 60;
pub const TCP_HDR_CSUM_OFFSET: usize = 16;

pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;

/// The option kind announcing an authenticated handshake segment.
pub const TCP_AUTH_OPTION_KIND: u8 = 34;

/// The full option appended to SYN, SYN-ACK and ACK segments that
/// carry a token.
pub const TCP_AUTH_OPTION: [u8; 4] = [TCP_AUTH_OPTION_KIND, 4, 0, 0];

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

impl TcpFlags {
    /// Classify a segment for the handshake state machine.
    ///
    /// FIN and RST segments are never part of the handshake. The
    /// remaining non-SYN/ACK bits are ignored.
    pub fn segment(&self) -> Segment {
        if self.intersects(Self::FIN | Self::RST) {
            return Segment::Teardown;
        }

        let hs = *self & (Self::SYN | Self::ACK);
        if hs == Self::SYN {
            Segment::Syn
        } else if hs == Self::SYN | Self::ACK {
            Segment::SynAck
        } else if hs == Self::ACK {
            Segment::Ack
        } else {
            Segment::Other
        }
    }
}

/// Print the flags in "UAPRSF" order, with `.` for unset bits.
impl Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = [
            (Self::URG, 'U'),
            (Self::ACK, 'A'),
            (Self::PSH, 'P'),
            (Self::RST, 'R'),
            (Self::SYN, 'S'),
            (Self::FIN, 'F'),
        ];

        for (flag, c) in pairs {
            let c = if self.contains(flag) { c } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// The handshake role of a TCP segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Segment {
    Syn,
    SynAck,
    Ack,
    Teardown,
    Other,
}

impl Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Syn => "SYN",
            Self::SynAck => "SYN-ACK",
            Self::Ack => "ACK",
            Self::Teardown => "TEARDOWN",
            Self::Other => "OTHER",
        };
        write!(f, "{s}")
    }
}

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct TcpHdrRaw {
    pub src_port: [u8; 2],
    pub dst_port: [u8; 2],
    pub seq: [u8; 4],
    pub ack: [u8; 4],
    pub offset: u8,
    pub flags: u8,
    pub win: [u8; 2],
    pub csum: [u8; 2],
    pub urg: [u8; 2],
}

impl TcpHdrRaw {
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port)
    }

    pub fn seq(&self) -> u32 {
        u32::from_be_bytes(self.seq)
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.seq = seq.to_be_bytes();
    }

    pub fn ack(&self) -> u32 {
        u32::from_be_bytes(self.ack)
    }

    pub fn set_ack(&mut self, ack: u32) {
        self.ack = ack.to_be_bytes();
    }

    /// Header length in bytes, options included.
    pub fn hdr_len(&self) -> usize {
        usize::from(self.offset >> 4) * 4
    }

    pub fn set_hdr_len(&mut self, len: usize) {
        let words = (len / 4) as u8;
        self.offset = (words << 4) | (self.offset & 0x0F);
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_retain(self.flags)
    }
}

/// Search the options area of a TCP header for the auth option.
///
/// `opts` is the header past its fixed 20 bytes. A malformed option
/// list simply ends the walk.
pub fn has_auth_option(opts: &[u8]) -> bool {
    find_auth_option(opts).is_some()
}

/// The offset of the auth option within `opts`.
pub fn find_auth_option(opts: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            TCP_OPT_END => return None,
            TCP_OPT_NOP => i += 1,
            kind => {
                let len = usize::from(*opts.get(i + 1)?);
                if len < 2 {
                    return None;
                }

                if kind == TCP_AUTH_OPTION_KIND
                    && opts.get(i..i + len) == Some(&TCP_AUTH_OPTION[..])
                {
                    return Some(i);
                }

                i += len;
            }
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn segment_classification() {
        assert_eq!(TcpFlags::SYN.segment(), Segment::Syn);
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).segment(), Segment::SynAck);
        assert_eq!(TcpFlags::ACK.segment(), Segment::Ack);
        assert_eq!((TcpFlags::ACK | TcpFlags::PSH).segment(), Segment::Ack);
        assert_eq!((TcpFlags::FIN | TcpFlags::ACK).segment(), Segment::Teardown);
        assert_eq!(TcpFlags::RST.segment(), Segment::Teardown);
        assert_eq!(TcpFlags::empty().segment(), Segment::Other);
    }

    #[test]
    fn flags_display() {
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).to_string(), ".A..S.");
        assert_eq!(TcpFlags::empty().to_string(), "......");
    }

    #[test]
    fn option_walk() {
        // MSS, NOP, NOP, SACK permitted.
        let plain = [2, 4, 0x05, 0xb4, 1, 1, 4, 2];
        assert!(!has_auth_option(&plain));

        let mut with_auth = plain.to_vec();
        with_auth.extend_from_slice(&TCP_AUTH_OPTION);
        assert!(has_auth_option(&with_auth));
        assert_eq!(find_auth_option(&with_auth), Some(plain.len()));

        // End of option list hides anything after it.
        let ended = [0, 0, 0, 0, 34, 4, 0, 0];
        assert!(!has_auth_option(&ended));

        // A zero length option must not loop forever.
        assert!(!has_auth_option(&[2, 0, 34, 4]));
    }
}
