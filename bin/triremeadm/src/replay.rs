// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Replay a packet capture through a pair of in-process datapaths.
//!
//! The capture holds the conversation as the applications see it.
//! Each packet enters the datapath of the side owning its source
//! address as an application packet, and whatever that datapath lets
//! through enters the other side as a network packet. Packets the
//! datapaths write themselves, UDP handshakes and released queues,
//! are carried across the same way.

use crate::AdmError;
use crate::SlogLog;
use pcap_parser::Linktype;
use pcap_parser::pcap;
use slog::Logger;
use std::net::Ipv4Addr;
use std::sync::Arc;
use trireme::api::DatapathConfig;
use trireme::api::Direction;
use trireme::api::FlowId;
use trireme::api::FlowRecord;
use trireme::api::PacketReport;
use trireme::api::PuPolicy;
use trireme::api::Verdict;
use trireme::engine::collector::AggregatingCollector;
use trireme::engine::datapath::Datapath;
use trireme::engine::datapath::ProcessError;
use trireme::engine::datapath::ProcessResult;
use trireme::engine::packet::Packet;
use trireme::engine::secrets::Secrets;
use trireme::engine::writer::PacketWriter;
use trireme::engine::writer::WriteError;
use trireme::provider::Providers;
use trireme::sync::KMutex;

/// Rounds of carrying written packets across before giving up on the
/// two sides settling.
const MAX_PUMP_ROUNDS: usize = 16;

const ETHER_HDR_LEN: usize = 14;
const ETHER_TYPE_IPV4: [u8; 2] = [0x08, 0x00];

/// Read the IPv4 packets out of a pcap capture.
///
/// Raw IP and Ethernet captures are understood; Ethernet frames not
/// carrying IPv4 are skipped.
pub fn read_capture(bytes: &[u8]) -> Result<Vec<Vec<u8>>, AdmError> {
    let (mut rest, hdr) = pcap::parse_pcap_header(bytes)
        .map_err(|e| AdmError::Pcap(format!("header: {e:?}")))?;

    let ethernet = if hdr.network == Linktype::ETHERNET {
        true
    } else if hdr.network == Linktype::RAW || hdr.network == Linktype::IPV4 {
        false
    } else {
        return Err(AdmError::Linktype(hdr.network.0));
    };

    let mut pkts = vec![];
    while !rest.is_empty() {
        let frame = if hdr.is_bigendian() {
            pcap::parse_pcap_frame_be(rest)
        } else {
            pcap::parse_pcap_frame(rest)
        };
        let (next, block) = frame.map_err(|e| {
            AdmError::Pcap(format!("frame {}: {e:?}", pkts.len() + 1))
        })?;
        rest = next;

        if !ethernet {
            pkts.push(block.data.to_vec());
            continue;
        }

        if block.data.len() > ETHER_HDR_LEN && block.data[12..14] == ETHER_TYPE_IPV4
        {
            pkts.push(block.data[ETHER_HDR_LEN..].to_vec());
        }
    }

    Ok(pkts)
}

/// Collects what a datapath writes.
#[derive(Default)]
struct Outbox(KMutex<Vec<Vec<u8>>>);

impl Outbox {
    fn take(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.0.lock())
    }
}

impl PacketWriter for Outbox {
    fn write_packet(&self, pkt: &[u8], _mark: u32) -> Result<(), WriteError> {
        self.0.lock().push(pkt.to_vec());
        Ok(())
    }
}

struct Side {
    name: &'static str,
    dp: Datapath,
    collector: Arc<AggregatingCollector>,
    outbox: Arc<Outbox>,
    ips: Vec<Ipv4Addr>,
}

impl Side {
    fn new(
        name: &'static str,
        cfg: DatapathConfig,
        secrets: Arc<dyn Secrets>,
        policy: &PuPolicy,
        log: &Logger,
    ) -> Result<Self, AdmError> {
        let collector = Arc::new(AggregatingCollector::new());
        let outbox = Arc::new(Outbox::default());
        let providers = Providers {
            log: Box::new(SlogLog(log.new(slog::o!("side" => name)))),
        };
        let dp = Datapath::new(
            cfg,
            secrets,
            collector.clone(),
            outbox.clone(),
            providers,
        )?;
        dp.enforce(policy);

        Ok(Self { name, dp, collector, outbox, ips: policy.ips.clone() })
    }

    fn owns(&self, ip: Ipv4Addr) -> bool {
        self.ips.contains(&ip)
    }
}

/// What a datapath did with a packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outcome {
    pub verdict: Verdict,
    pub detail: String,
}

impl Outcome {
    fn new(res: &Result<ProcessResult, ProcessError>) -> Self {
        let detail = match res {
            Ok(ProcessResult::Bypass) => "passed".to_string(),
            Ok(ProcessResult::Modified(p)) => format!("rewritten, {} bytes", p.len()),
            Ok(ProcessResult::Drop { reason }) => reason.to_string(),
            Err(e) => e.to_string(),
        };
        let verdict = match res {
            Ok(r) => r.verdict(),
            Err(_) => Verdict::Drop,
        };
        Self { verdict, detail }
    }
}

/// One captured packet and what became of it.
#[derive(Clone, Debug)]
pub struct Step {
    /// Position in the capture, from 1.
    pub index: usize,
    pub flow: Option<FlowId>,
    /// The side that sent it, if either owns the source address.
    pub from: Option<&'static str>,
    /// The sender's application-side verdict.
    pub sent: Option<Outcome>,
    /// The receiver's network-side verdict, if the packet got that
    /// far.
    pub received: Option<Outcome>,
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub steps: Vec<Step>,
    /// Flow records of both sides, client first.
    pub flows: Vec<(&'static str, FlowRecord)>,
    pub packets: Vec<(&'static str, PacketReport)>,
    pub stats: Vec<(&'static str, Vec<(&'static str, u64)>)>,
}

pub struct Replay {
    client: Side,
    server: Side,
    steps: Vec<Step>,
}

impl Replay {
    pub fn new(
        cfg: DatapathConfig,
        secrets: Arc<dyn Secrets>,
        client: &PuPolicy,
        server: &PuPolicy,
        log: &Logger,
    ) -> Result<Self, AdmError> {
        Ok(Self {
            client: Side::new("client", cfg.clone(), secrets.clone(), client, log)?,
            server: Side::new("server", cfg, secrets, server, log)?,
            steps: vec![],
        })
    }

    /// Run one captured IPv4 packet through the pair.
    pub fn packet(&mut self, pkt: &[u8]) -> &Step {
        let index = self.steps.len() + 1;
        let flow = Packet::parse(pkt.to_vec(), Direction::Out).ok().map(|p| p.flow());

        let (from, to) = match source_ip(pkt) {
            Some(ip) if self.client.owns(ip) => (&self.client, &self.server),
            Some(ip) if self.server.owns(ip) => (&self.server, &self.client),
            _ => {
                self.steps.push(Step {
                    index,
                    flow,
                    from: None,
                    sent: None,
                    received: None,
                });
                return &self.steps[index - 1];
            }
        };

        let res = from.dp.process_application_packet(pkt, 0);
        let sent = Outcome::new(&res);
        let received = forwardable(res, pkt).map(|wire| {
            Outcome::new(&to.dp.process_network_packet(&wire, 0))
        });
        let name = from.name;

        self.pump();
        self.steps.push(Step {
            index,
            flow,
            from: Some(name),
            sent: Some(sent),
            received,
        });
        &self.steps[index - 1]
    }

    /// Carry packets the datapaths wrote to the other side until
    /// neither writes more.
    fn pump(&self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            let c = self.client.outbox.take();
            let s = self.server.outbox.take();
            if c.is_empty() && s.is_empty() {
                return;
            }

            for pkt in c {
                let _ = self.server.dp.process_network_packet(&pkt, 0);
            }
            for pkt in s {
                let _ = self.client.dp.process_network_packet(&pkt, 0);
            }
        }
    }

    pub fn finish(self) -> ReplayReport {
        let mut report = ReplayReport { steps: self.steps, ..Default::default() };

        for side in [&self.client, &self.server] {
            for rec in side.collector.flush() {
                report.flows.push((side.name, rec));
            }
            for pkt in side.collector.flush_packets() {
                report.packets.push((side.name, pkt));
            }

            let mut stats = vec![];
            side.dp.for_each_stat(&mut |name, val| stats.push((name, val)));
            report.stats.push((side.name, stats));
        }

        report
    }
}

fn source_ip(pkt: &[u8]) -> Option<Ipv4Addr> {
    if pkt.len() < 20 || pkt[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(pkt[12], pkt[13], pkt[14], pkt[15]))
}

/// The bytes a passed packet leaves with.
fn forwardable(
    res: Result<ProcessResult, ProcessError>,
    orig: &[u8],
) -> Option<Vec<u8>> {
    match res {
        Ok(ProcessResult::Bypass) => Some(orig.to_vec()),
        Ok(ProcessResult::Modified(p)) => Some(p.into_bytes()),
        _ => None,
    }
}
