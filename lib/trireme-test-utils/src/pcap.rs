// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines for building packet capture files of raw IPv4 packets.

use pcap_parser::Linktype;
use pcap_parser::ToVec;
use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::pcap::PcapHeader;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Build a packet capture file from a series of packets.
pub struct PcapBuilder {
    file: File,
    ts_sec: u32,
}

impl PcapBuilder {
    /// Create a new pcap builder, writing all captures to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let mut file = File::create(path).unwrap();

        let mut hdr = PcapHeader {
            magic_number: 0xa1b2c3d4,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: 65535,
            network: Linktype::RAW,
        };

        file.write_all(&hdr.to_vec().unwrap()).unwrap();

        Self { file, ts_sec: 7777 }
    }

    /// Add a packet to the capture.
    pub fn add_pkt(&mut self, pkt: &[u8]) {
        let mut block = LegacyPcapBlock {
            ts_sec: self.ts_sec,
            ts_usec: 0,
            caplen: pkt.len() as u32,
            origlen: pkt.len() as u32,
            data: pkt,
        };
        self.ts_sec += 1;

        self.file.write_all(&block.to_vec().unwrap()).unwrap();
    }
}
