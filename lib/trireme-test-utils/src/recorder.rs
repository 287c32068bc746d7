// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Sinks that remember what the datapath handed them.

use std::sync::Mutex;
use trireme::api::FlowAction;
use trireme::api::FlowRecord;
use trireme::api::PacketReport;
use trireme::engine::collector::EventCollector;
use trireme::engine::intercept::VerdictMessage;
use trireme::engine::intercept::VerdictSink;
use trireme::engine::writer::PacketWriter;
use trireme::engine::writer::WriteError;

#[derive(Default)]
pub struct RecordingCollector {
    flows: Mutex<Vec<FlowRecord>>,
    packets: Mutex<Vec<PacketReport>>,
}

impl RecordingCollector {
    pub fn flows(&self) -> Vec<FlowRecord> {
        self.flows.lock().unwrap().clone()
    }

    pub fn accepted(&self) -> Vec<FlowRecord> {
        self.flows()
            .into_iter()
            .filter(|r| r.action == FlowAction::Accept)
            .collect()
    }

    pub fn rejected(&self) -> Vec<FlowRecord> {
        self.flows()
            .into_iter()
            .filter(|r| r.action == FlowAction::Reject)
            .collect()
    }

    pub fn packets(&self) -> Vec<PacketReport> {
        self.packets.lock().unwrap().clone()
    }
}

impl EventCollector for RecordingCollector {
    fn collect_flow_event(&self, record: FlowRecord) {
        self.flows.lock().unwrap().push(record);
    }

    fn collect_packet_event(&self, report: PacketReport) {
        self.packets.lock().unwrap().push(report);
    }
}

/// Keeps every packet the datapath writes, in order.
#[derive(Default)]
pub struct RecordingWriter {
    written: Mutex<Vec<(Vec<u8>, u32)>>,
    fail: Mutex<bool>,
}

impl RecordingWriter {
    /// Take everything written so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().drain(..).map(|(p, _)| p).collect()
    }

    pub fn take_with_marks(&self) -> Vec<(Vec<u8>, u32)> {
        self.written.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    /// Make every following write fail.
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl PacketWriter for RecordingWriter {
    fn write_packet(&self, pkt: &[u8], mark: u32) -> Result<(), WriteError> {
        if *self.fail.lock().unwrap() {
            return Err(WriteError::Io("injected failure".into()));
        }
        self.written.lock().unwrap().push((pkt.to_vec(), mark));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    verdicts: Mutex<Vec<VerdictMessage>>,
}

impl RecordingSink {
    pub fn verdicts(&self) -> Vec<VerdictMessage> {
        let mut v = self.verdicts.lock().unwrap().clone();
        v.sort_by_key(|m| m.id);
        v
    }
}

impl VerdictSink for RecordingSink {
    fn set_verdict(&self, msg: VerdictMessage) {
        self.verdicts.lock().unwrap().push(msg);
    }
}
