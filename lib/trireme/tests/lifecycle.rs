// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection lifetime, context management, tracing, service hooks
//! and the intercept queues.

use core::time::Duration;
use trireme::api::PacketStage;
use trireme::api::Verdict;
use trireme::engine::intercept::QueueSet;
use trireme::engine::intercept::QueuedPacket;
use trireme::engine::packet::Packet;
use trireme::engine::processor::PacketProcessor;
use trireme::engine::processor::ProcessorError;
use trireme::engine::udp::UdpMarker;
use trireme::time::Moment;
use trireme_test_utils::pkt;
use trireme_test_utils::pkt::SYN;
use trireme_test_utils::pkt::SYN_ACK;
use trireme_test_utils::*;

const LATER: Duration = Duration::from_secs(3600);

fn tcp_syn() -> Vec<u8> {
    pkt::tcp(web_ep(40000), db_ep(80), SYN, 1000, 0, &[])
}

fn tcp_flow() -> FlowId {
    flow_id(Protocol::TCP, web_ep(40000), db_ep(80))
}

fn udp_query() -> Vec<u8> {
    pkt::udp(web_ep(5000), db_ep(53), b"q")
}

fn udp_flow() -> FlowId {
    flow_id(Protocol::UDP, web_ep(5000), db_ep(53))
}

fn all_trackers_empty(node: &Node) -> bool {
    node.dp.tracker_entries().iter().all(|(_, n)| *n == 0)
}

/// Complete a UDP handshake from web to db.
fn udp_established(web: &Node, db: &Node) {
    web.app(&udp_query()).unwrap();
    let syn = web.writer.take().remove(0);
    db.net(&syn).unwrap();
    let synack = db.writer.take().remove(0);
    web.net(&synack).unwrap();
    let out = web.writer.take();
    db.net(&out[0]).unwrap();
    assert_eq!(db.dp.udp_state(&udp_flow()), Some(UdpState::AckReceived));
}

#[test]
fn idle_handshake_expires() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    let syn = tcp_syn();
    forwarded(web.app(&syn), &syn);
    assert!(!all_trackers_empty(&web));

    // Nothing is idle yet.
    web.dp.expire_at(Moment::now());
    assert_eq!(web.dp.tcp_state(&tcp_flow()), Some(TcpState::SynSend));

    web.dp.expire_at(Moment::now() + LATER);
    assert_eq!(web.dp.tcp_state(&tcp_flow()), None);
    assert!(all_trackers_empty(&web));
    assert_eq!(web.dp.stats().expired_in_handshake, 1);
    assert_eq!(web.dp.stats().expired_established, 0);
}

/// `wire` with one bit of its token signature flipped.
fn tampered(wire: &[u8]) -> Vec<u8> {
    let mut bytes = wire.to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    let mut pkt = Packet::parse(bytes, Direction::In).unwrap();
    pkt.update_checksums();
    pkt.into_bytes()
}

#[test]
fn forged_syn_does_not_disturb_genuine_one() {
    let (web, db) = web_and_db(DatapathConfig::default());
    let syn = tcp_syn();
    let wire = forwarded(web.app(&syn), &syn);

    // A forged SYN first leaves nothing behind.
    expect_drop!(
        db.net(&tampered(&wire)),
        DropReason::Reject(RejectReason::InvalidToken)
    );
    assert_eq!(db.dp.tcp_state(&tcp_flow()), None);
    assert!(all_trackers_empty(&db));

    forwarded(db.net(&wire), &wire);
    assert_eq!(db.dp.tcp_state(&tcp_flow()), Some(TcpState::SynReceived));

    // A forged copy after the genuine SYN keeps the connection.
    expect_drop!(
        db.net(&tampered(&wire)),
        DropReason::Reject(RejectReason::InvalidToken)
    );
    assert_eq!(db.dp.tcp_state(&tcp_flow()), Some(TcpState::SynReceived));

    let synack = pkt::tcp(db_ep(80), web_ep(40000), SYN_ACK, 9000, 1001, &[]);
    let answer = forwarded(db.app(&synack), &synack);
    assert_eq!(db.dp.tcp_state(&tcp_flow()), Some(TcpState::SynAckSend));
    forwarded(web.net(&answer), &answer);
    assert_eq!(web.dp.tcp_state(&tcp_flow()), Some(TcpState::SynAckReceived));
}

#[test]
fn established_udp_expires() {
    let (web, db) = web_and_db(DatapathConfig::default());
    udp_established(&web, &db);

    web.dp.expire_at(Moment::now() + LATER);
    db.dp.expire_at(Moment::now() + LATER);
    assert!(all_trackers_empty(&web));
    assert!(all_trackers_empty(&db));
    assert_eq!(web.dp.stats().expired_established, 1);
    assert_eq!(db.dp.stats().expired_established, 1);

    // The flow needs a new handshake.
    expect_drop!(db.net(&udp_query()), DropReason::NoConnection);
}

#[test]
fn unenforce_forgets_connections() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    expect_drop!(web.app(&udp_query()), DropReason::Queued);
    let syn = tcp_syn();
    forwarded(web.app(&syn), &syn);
    assert_eq!(web.dp.context_ids(), vec!["web".to_string()]);

    assert!(web.dp.unenforce("web"));
    assert!(!web.dp.unenforce("web"));
    assert!(web.dp.context_ids().is_empty());
    assert!(all_trackers_empty(&web));
    assert_eq!(web.dp.pending_retransmits(), 0);

    expect_drop!(web.app(&tcp_syn()), DropReason::NoContext);
}

#[test]
fn policy_update_applies_to_new_flows() {
    let (web, db) = web_and_db(DatapathConfig::default());
    let syn = tcp_syn();
    let wire = forwarded(web.app(&syn), &syn);
    forwarded(db.net(&wire), &wire);

    let mut closed = db_policy();
    closed.receiver_rules = vec![app_rule("web", reject("closed"))];
    db.dp.enforce(&closed);
    assert_eq!(db.dp.context_ids(), vec!["db".to_string()]);

    let other = pkt::tcp(web_ep(40001), db_ep(80), SYN, 1, 0, &[]);
    let wire = forwarded(web.app(&other), &other);
    expect_drop!(db.net(&wire), DropReason::Reject(RejectReason::PolicyDrop));
}

#[test]
fn contexts_resolve_by_mark_and_port() {
    let cfg = DatapathConfig::default();
    let marked = PuPolicy {
        management_id: "marked".into(),
        marks: vec![0x100],
        ..Default::default()
    };
    let host = PuPolicy {
        management_id: "host-svc".into(),
        ports: vec![80],
        ..Default::default()
    };
    let node = Node::new(cfg, &marked);
    node.dp.enforce(&host);

    // The mark wins over everything else.
    let res = node.dp.process_application_packet(&tcp_syn(), 0x100);
    assert!(matches!(res, Ok(ProcessResult::Modified(_))));

    // db:80 is a local port of the host service.
    let res = node.net(&tcp_syn());
    expect_drop!(res, DropReason::Reject(RejectReason::InvalidToken));
    let rec = node.collector.rejected();
    assert_eq!(rec[0].context_id, "host-svc");
}

#[test]
fn non_transport_packets_pass() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    let icmp = pkt::icmp_echo(web_ep(0), db_ep(0));
    assert!(matches!(web.app(&icmp), Ok(ProcessResult::Bypass)));
    assert!(matches!(web.net(&icmp), Ok(ProcessResult::Bypass)));
    assert_eq!(web.dp.stats().other_proto, 2);

    assert!(matches!(web.app(&[0x45, 0x00]), Err(ProcessError::Parse(_))));
    assert_eq!(web.dp.stats().parse_err, 1);
}

#[test]
fn packet_tracing() {
    let cfg = DatapathConfig { packet_tracing: true, ..Default::default() };
    let (web, db) = web_and_db(cfg);

    let syn = tcp_syn();
    let wire = forwarded(web.app(&syn), &syn);
    expect_drop!(db.net(&syn), DropReason::Reject(RejectReason::InvalidToken));
    forwarded(db.net(&wire), &wire);

    let reports = web.collector.packets();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].dir, Direction::Out);
    assert_eq!(reports[0].flow, tcp_flow());
    assert_eq!(reports[0].length, syn.len());
    assert_eq!(reports[0].stage, PacketStage::Outgoing);
    assert!(reports[0].tcp_flags.contains('S'));
    assert!(!reports[0].dropped);

    let reports = db.collector.packets();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].stage, PacketStage::Auth);
    assert!(reports[0].dropped);
    assert_eq!(reports[1].stage, PacketStage::Outgoing);
    assert_eq!(reports[1].length, wire.len());

    // Off by default.
    let quiet = Node::new(DatapathConfig::default(), &web_policy());
    forwarded(quiet.app(&syn), &syn);
    assert!(quiet.collector.packets().is_empty());
}

/// Refuses telnet, and marks everything it accepts as changed.
struct NoTelnet;

impl PacketProcessor for NoTelnet {
    fn pre_process(&self, pkt: &Packet) -> Result<(), ProcessorError> {
        if pkt.flow().dst_port == 23 {
            return Err(ProcessorError("telnet".into()));
        }
        Ok(())
    }

    fn post_process(&self, pkt: &mut Packet) -> Result<bool, ProcessorError> {
        if pkt.flow().src_port == 6666 {
            return Err(ProcessorError("cursed port".into()));
        }
        Ok(true)
    }
}

#[test]
fn service_processor_hooks() {
    let cfg = DatapathConfig { packet_tracing: true, ..Default::default() };
    let collector = Arc::new(RecordingCollector::default());
    let dp = Datapath::new(
        cfg,
        Arc::new(PskSecrets::new(PSK).unwrap()),
        collector.clone(),
        Arc::new(RecordingWriter::default()),
        Providers::silent(),
    )
    .unwrap()
    .with_processor(Arc::new(NoTelnet));
    dp.enforce(&web_policy());

    let telnet = pkt::tcp(web_ep(40000), db_ep(23), SYN, 1, 0, &[]);
    assert!(matches!(
        dp.process_application_packet(&telnet, 0),
        Err(ProcessError::Processor(_))
    ));

    // Data outside any handshake is accepted, and the hook's change
    // turns the bypass into a rewrite.
    let seg = pkt::tcp(web_ep(40000), db_ep(80), pkt::PSH_ACK, 1, 1, b"x");
    match dp.process_application_packet(&seg, 0) {
        Ok(ProcessResult::Modified(p)) => assert_eq!(p.bytes(), &seg[..]),
        other => panic!("expected Modified, got {other:?}"),
    }

    let cursed = pkt::tcp(web_ep(6666), db_ep(80), pkt::PSH_ACK, 1, 1, b"x");
    assert!(matches!(
        dp.process_application_packet(&cursed, 0),
        Err(ProcessError::Processor(_))
    ));

    let stats = dp.stats();
    assert_eq!(stats.service_pre_drop, 1);
    assert_eq!(stats.service_post_drop, 1);

    let reports = collector.packets();
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].stage, PacketStage::Service);
    assert!(reports[0].error.as_ref().unwrap().contains("telnet"));
    assert_eq!(reports[2].stage, PacketStage::Service);
}

#[test]
fn intercept_queues_carry_handshake() {
    let cfg = DatapathConfig {
        application_queues: vec![0],
        network_queues: vec![1],
        ..Default::default()
    };
    let (web, db) = web_and_db(cfg);
    let web_sink = Arc::new(RecordingSink::default());
    let db_sink = Arc::new(RecordingSink::default());
    let web_q = QueueSet::start(web.dp.clone(), web_sink.clone(), 8).unwrap();
    let db_q = QueueSet::start(db.dp.clone(), db_sink.clone(), 8).unwrap();

    let syn = tcp_syn();
    web_q
        .submit(QueuedPacket { id: 1, queue: 0, mark: 0, data: syn.clone() })
        .unwrap();
    web_q.shutdown();

    let v = web_sink.verdicts();
    assert_eq!(v.len(), 1);
    assert_eq!(v[0].verdict, Verdict::Accept);
    assert_ne!(v[0].data, syn);

    db_q.submit(QueuedPacket { id: 7, queue: 1, mark: 0, data: v[0].data.clone() })
        .unwrap();
    db_q.submit(QueuedPacket { id: 8, queue: 1, mark: 0, data: syn.clone() })
        .unwrap();
    db_q.shutdown();

    let v = db_sink.verdicts();
    assert_eq!(v.len(), 2);
    assert_eq!(v[0].id, 7);
    assert_eq!(v[0].verdict, Verdict::Accept);
    assert_eq!(v[0].data, syn);
    assert_eq!(v[1].verdict, Verdict::Drop);
}

#[test]
fn maintenance_thread_retransmits() {
    let cfg = DatapathConfig {
        udp_retransmit_interval_ms: 20,
        udp_retransmit_attempts: 100,
        expiry_interval_ms: 10,
        ..Default::default()
    };
    let web = Node::new(cfg, &web_policy());
    expect_drop!(web.app(&udp_query()), DropReason::Queued);
    web.dp.start().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while web.dp.stats().udp_retransmits == 0 {
        assert!(std::time::Instant::now() < deadline, "no retransmit");
        std::thread::sleep(Duration::from_millis(10));
    }
    web.dp.stop();

    let sent = web.writer.take();
    assert!(sent.len() >= 2);
    assert!(sent.iter().all(|p| UdpMarker::parse(pkt::l4_payload(p)).is_some()));
}

#[test]
fn clear_drops_all_state() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    expect_drop!(web.app(&udp_query()), DropReason::Queued);
    let syn = tcp_syn();
    forwarded(web.app(&syn), &syn);

    web.dp.clear();
    assert!(all_trackers_empty(&web));
    assert_eq!(web.dp.pending_retransmits(), 0);
    assert_eq!(web.dp.context_ids(), vec!["web".to_string()]);
}
