// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod pcap;
pub mod pkt;
pub mod recorder;

// Let's make our lives easier and pub use a bunch of stuff.
pub use pkt::Endpoint;
pub use recorder::RecordingCollector;
pub use recorder::RecordingSink;
pub use recorder::RecordingWriter;
pub use std::sync::Arc;
pub use trireme::api::ActionType;
pub use trireme::api::DatapathConfig;
pub use trireme::api::Direction;
pub use trireme::api::FlowAction;
pub use trireme::api::FlowId;
pub use trireme::api::FlowPolicy;
pub use trireme::api::KeyValueOperator;
pub use trireme::api::Protocol;
pub use trireme::api::PuPolicy;
pub use trireme::api::RejectReason;
pub use trireme::api::TagSelector;
pub use trireme::engine::connection::TcpState;
pub use trireme::engine::connection::UdpState;
pub use trireme::engine::datapath::Datapath;
pub use trireme::engine::datapath::DropReason;
pub use trireme::engine::datapath::ProcessError;
pub use trireme::engine::datapath::ProcessResult;
pub use trireme::engine::secrets::PskSecrets;
pub use trireme::provider::Providers;

/// The pre-shared key every test datapath signs with.
pub const PSK: &[u8] = b"test-secret";

pub const WEB_IP: &str = "10.0.0.1";
pub const DB_IP: &str = "10.0.0.2";

/// The client end of the test flows.
pub fn web_ep(port: u16) -> Endpoint {
    Endpoint::new(WEB_IP, port)
}

/// The server end of the test flows.
pub fn db_ep(port: u16) -> Endpoint {
    Endpoint::new(DB_IP, port)
}

pub fn flow_id(proto: Protocol, src: Endpoint, dst: Endpoint) -> FlowId {
    FlowId {
        proto,
        src_ip: src.ip,
        src_port: src.port,
        dst_ip: dst.ip,
        dst_port: dst.port,
    }
}

pub fn accept(policy_id: &str) -> FlowPolicy {
    FlowPolicy::new(ActionType::ACCEPT, policy_id)
}

pub fn reject(policy_id: &str) -> FlowPolicy {
    FlowPolicy::new(ActionType::REJECT, policy_id)
}

/// `app=<value>` selecting `policy`.
pub fn app_rule(value: &str, policy: FlowPolicy) -> TagSelector {
    TagSelector::new(vec![KeyValueOperator::equal("app", &[value])], policy)
}

/// The client PU: may talk to `app=db`.
pub fn web_policy() -> PuPolicy {
    PuPolicy {
        management_id: "web".into(),
        identity: vec!["app=web".into(), "env=prod".into()],
        transmitter_rules: vec![app_rule("db", accept("web-to-db"))],
        ips: vec![WEB_IP.parse().unwrap()],
        ..Default::default()
    }
}

/// The server PU: accepts `app=web`.
pub fn db_policy() -> PuPolicy {
    PuPolicy {
        management_id: "db".into(),
        identity: vec!["app=db".into(), "env=prod".into()],
        receiver_rules: vec![app_rule("web", accept("db-from-web"))],
        ips: vec![DB_IP.parse().unwrap()],
        ..Default::default()
    }
}

/// One datapath with recording telemetry and packet output.
pub struct Node {
    pub dp: Arc<Datapath>,
    pub collector: Arc<RecordingCollector>,
    pub writer: Arc<RecordingWriter>,
}

impl Node {
    pub fn new(cfg: DatapathConfig, policy: &PuPolicy) -> Self {
        let collector = Arc::new(RecordingCollector::default());
        let writer = Arc::new(RecordingWriter::default());
        let secrets = Arc::new(PskSecrets::new(PSK).unwrap());
        let dp = Datapath::new(
            cfg,
            secrets,
            collector.clone(),
            writer.clone(),
            Providers::println(),
        )
        .unwrap();
        dp.enforce(policy);

        Self { dp: Arc::new(dp), collector, writer }
    }

    /// A packet from the local application.
    pub fn app(&self, pkt: &[u8]) -> Result<ProcessResult, ProcessError> {
        self.dp.process_application_packet(pkt, 0)
    }

    /// A packet from the network.
    pub fn net(&self, pkt: &[u8]) -> Result<ProcessResult, ProcessError> {
        self.dp.process_network_packet(pkt, 0)
    }
}

/// The client and server datapaths of one test.
pub fn web_and_db(cfg: DatapathConfig) -> (Node, Node) {
    (Node::new(cfg.clone(), &web_policy()), Node::new(cfg, &db_policy()))
}

/// The bytes to forward for a packet the datapath let through:
/// the rewritten packet, or `orig` when it was passed untouched.
pub fn forwarded(res: Result<ProcessResult, ProcessError>, orig: &[u8]) -> Vec<u8> {
    match res {
        Ok(ProcessResult::Modified(pkt)) => pkt.into_bytes(),
        Ok(ProcessResult::Bypass) => orig.to_vec(),
        other => panic!("expected the packet to pass, got {other:?}"),
    }
}

/// Expects that a packet result is a drop for `reason`.
#[macro_export]
macro_rules! expect_drop {
    ($res:expr, $reason:expr) => {
        match $res {
            Ok($crate::ProcessResult::Drop { reason }) => {
                assert_eq!(reason, $reason)
            }
            other => panic!("expected drop ({:?}), got {:?}", $reason, other),
        }
    };
}
