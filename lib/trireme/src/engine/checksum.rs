// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types for calculating the internet checksum.
//!
//! The [`Checksum`] type provides a rolling one's complement sum that
//! is finalized into a [`HeaderChecksum`], the value stored in the
//! header bytes.
//!
//! # Checksums and Endianness
//!
//! The checksum is not a logical integer; it is a pair of bytes. The
//! bytes being summed are in network order and the result is written
//! back in network order, so every pair of bytes is treated as a
//! native 16-bit integer (`{to,from}_ne_bytes()`) and no byte-order
//! conversion is ever performed on the checksum field. See RFC 1071
//! §1.B.
//!
//! # Relevant RFCs
//!
//! * 1071 Computing the Internet Checksum
//!
//! * 1624 Computation of the Internet Checksum via Incremental Update

/// The checksum value, as it is contained in a network header.
///
/// This holds the bytes with one's complement applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderChecksum {
    inner: [u8; 2],
}

impl HeaderChecksum {
    /// Return the bytes of this header checksum.
    pub fn bytes(&self) -> [u8; 2] {
        self.inner
    }

    /// Wrap the checksum bytes of a header.
    pub fn wrap(hc: [u8; 2]) -> Self {
        Self { inner: hc }
    }
}

impl From<Checksum> for HeaderChecksum {
    /// Finalize the rolling checksum and put it into header form by
    /// performing one's complement.
    fn from(mut csum: Checksum) -> HeaderChecksum {
        Self { inner: (!csum.finalize()).to_ne_bytes() }
    }
}

/// A rolling one's complement checksum calculation.
///
/// Carries are accumulated in the upper half of the `u32` and only
/// folded when the sum is finalized.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    pub fn new() -> Self {
        Self::from(0)
    }

    /// Update the sum by adding the contents of `bytes`.
    ///
    /// Only the last chunk added before finalizing may have an odd
    /// length.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.inner = csum_add(self.inner, bytes);
    }

    /// Create a new rolling checksum, starting with `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        Self { inner: csum_add(0, bytes) }
    }

    /// Update the sum by subtracting the contents of `bytes`.
    pub fn sub_bytes(&mut self, bytes: &[u8]) {
        self.inner = csum_sub(self.inner, bytes);
    }

    /// Fold the accumulated carries and return the sum.
    pub fn finalize(&mut self) -> u16 {
        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        (self.inner & 0xFFFF) as u16
    }
}

impl From<HeaderChecksum> for Checksum {
    fn from(hc: HeaderChecksum) -> Self {
        Self { inner: (!u16::from_ne_bytes(hc.bytes())) as u32 }
    }
}

impl From<u32> for Checksum {
    fn from(csum: u32) -> Self {
        Self { inner: csum }
    }
}

impl core::ops::Add for Checksum {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self { inner: self.inner + other.inner }
    }
}

impl core::ops::AddAssign for Checksum {
    fn add_assign(&mut self, other: Self) {
        self.inner += other.inner
    }
}

fn csum_add(mut csum: u32, bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        csum += u16::from_ne_bytes([pair[0], pair[1]]) as u32;
    }

    if let [last] = chunks.remainder() {
        // An odd trailing byte is padded with zero on the right.
        csum += u16::from_ne_bytes([*last, 0]) as u32;
    }

    csum
}

fn csum_sub(mut csum: u32, bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        csum += (!u16::from_ne_bytes([pair[0], pair[1]])) as u32;
    }

    if let [last] = chunks.remainder() {
        csum += (!u16::from_ne_bytes([*last, 0])) as u32;
    }

    csum
}

#[cfg(test)]
mod test {
    use super::*;

    // The example from RFC 1071 §3.
    #[test]
    fn rfc1071_example() {
        let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        let mut csum = Checksum::compute(&bytes);
        assert_eq!(csum.finalize(), u16::from_ne_bytes([0xdd, 0xf2]));
    }

    #[test]
    fn incremental_matches_full() {
        let mut before = [0x45u8, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00];
        let mut csum = Checksum::compute(&before);
        csum.sub_bytes(&before[2..4]);
        before[2..4].copy_from_slice(&[0x00, 0x54]);
        csum.add_bytes(&before[2..4]);

        let full = HeaderChecksum::from(Checksum::compute(&before));
        assert_eq!(HeaderChecksum::from(csum), full);
    }

    #[test]
    fn odd_length_pads_right() {
        let mut a = Checksum::compute(&[0xab]);
        let mut b = Checksum::compute(&[0xab, 0x00]);
        assert_eq!(a.finalize(), b.finalize());
    }
}
