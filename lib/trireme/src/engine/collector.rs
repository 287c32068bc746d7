// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow and packet telemetry sinks.

use crate::api::FlowAction;
use crate::api::FlowId;
use crate::api::FlowRecord;
use crate::api::PacketReport;
use crate::api::RejectReason;
use crate::sync::KMutex;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

/// Where the datapath sends flow records and packet traces.
///
/// Called from queue workers with no connection lock held;
/// implementations must not block for long.
pub trait EventCollector: Send + Sync {
    fn collect_flow_event(&self, record: FlowRecord);

    fn collect_packet_event(&self, _report: PacketReport) {}
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullCollector;

impl EventCollector for NullCollector {
    fn collect_flow_event(&self, _record: FlowRecord) {}
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct AggregateKey {
    flow: FlowId,
    action: FlowAction,
    reason: Option<RejectReason>,
    source_id: String,
    destination_id: String,
    policy_id: Option<String>,
}

impl AggregateKey {
    fn new(r: &FlowRecord) -> Self {
        Self {
            flow: r.flow,
            action: r.action,
            reason: r.reason,
            source_id: r.source_id.clone(),
            destination_id: r.destination_id.clone(),
            policy_id: r.policy.as_ref().map(|p| p.policy_id.clone()),
        }
    }
}

/// Folds identical flow records into one record with a count, until
/// [`AggregatingCollector::flush`] hands them over.
///
/// Packet traces are not aggregated and are kept in arrival order.
#[derive(Debug, Default)]
pub struct AggregatingCollector {
    flows: KMutex<BTreeMap<AggregateKey, FlowRecord>>,
    packets: KMutex<Vec<PacketReport>>,
}

impl AggregatingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of distinct records pending.
    pub fn pending(&self) -> usize {
        self.flows.lock().len()
    }

    /// Take every pending flow record.
    pub fn flush(&self) -> Vec<FlowRecord> {
        let flows = core::mem::take(&mut *self.flows.lock());
        flows.into_values().collect()
    }

    pub fn flush_packets(&self) -> Vec<PacketReport> {
        core::mem::take(&mut *self.packets.lock())
    }
}

impl EventCollector for AggregatingCollector {
    fn collect_flow_event(&self, record: FlowRecord) {
        let mut flows = self.flows.lock();
        flows
            .entry(AggregateKey::new(&record))
            .and_modify(|r| r.count += record.count)
            .or_insert(record);
    }

    fn collect_packet_event(&self, report: PacketReport) {
        self.packets.lock().push(report);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::FlowPolicy;
    use crate::api::Protocol;

    fn record(src_port: u16, action: FlowAction) -> FlowRecord {
        FlowRecord {
            flow: FlowId {
                proto: Protocol::TCP,
                src_ip: "10.0.0.1".parse().unwrap(),
                src_port,
                dst_ip: "10.0.0.2".parse().unwrap(),
                dst_port: 80,
            },
            source_id: "client".into(),
            destination_id: "server".into(),
            context_id: "server".into(),
            action,
            reason: None,
            policy: Some(FlowPolicy::default_accept()),
            observed: None,
            count: 1,
        }
    }

    #[test]
    fn identical_records_fold() {
        let c = AggregatingCollector::new();
        c.collect_flow_event(record(1000, FlowAction::Accept));
        c.collect_flow_event(record(1000, FlowAction::Accept));
        c.collect_flow_event(record(1000, FlowAction::Reject));
        c.collect_flow_event(record(1001, FlowAction::Accept));
        assert_eq!(c.pending(), 3);

        let flushed = c.flush();
        assert_eq!(flushed.iter().map(|r| r.count).sum::<u64>(), 4);
        let folded = flushed
            .iter()
            .find(|r| r.flow.src_port == 1000 && r.action == FlowAction::Accept)
            .unwrap();
        assert_eq!(folded.count, 2);
        assert_eq!(c.pending(), 0);
    }
}
