// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP handshakes between two datapaths: the client `web`
//! (10.0.0.1) and the server `db` (10.0.0.2).

use trireme::api::FlowRecord;
use trireme::engine::packet::Packet;
use trireme_test_utils::pcap::PcapBuilder;
use trireme_test_utils::pkt;
use trireme_test_utils::pkt::ACK;
use trireme_test_utils::pkt::FIN_ACK;
use trireme_test_utils::pkt::PSH_ACK;
use trireme_test_utils::pkt::SYN;
use trireme_test_utils::pkt::SYN_ACK;
use trireme_test_utils::*;

const CLIENT_PORT: u16 = 40000;
const SERVER_PORT: u16 = 5432;
const CLIENT_ISN: u32 = 1000;
const SERVER_ISN: u32 = 9000;

fn client() -> Endpoint {
    web_ep(CLIENT_PORT)
}

fn server() -> Endpoint {
    db_ep(SERVER_PORT)
}

fn flow() -> FlowId {
    flow_id(Protocol::TCP, client(), server())
}

fn syn() -> Vec<u8> {
    pkt::tcp(client(), server(), SYN, CLIENT_ISN, 0, &[])
}

fn synack() -> Vec<u8> {
    pkt::tcp(server(), client(), SYN_ACK, SERVER_ISN, CLIENT_ISN + 1, &[])
}

fn ack() -> Vec<u8> {
    pkt::tcp(client(), server(), ACK, CLIENT_ISN + 1, SERVER_ISN + 1, &[])
}

fn data(payload: &[u8]) -> Vec<u8> {
    pkt::tcp(client(), server(), PSH_ACK, CLIENT_ISN + 1, SERVER_ISN + 1, payload)
}

/// Run the three-way handshake, checking that each side's stack
/// receives exactly what the other side's stack sent.
fn handshake(web: &Node, db: &Node, pcap: &mut PcapBuilder) {
    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    pcap.add_pkt(&wire);
    assert_ne!(wire, syn);
    assert_eq!(web.dp.tcp_state(&flow()), Some(TcpState::SynSend));
    assert_eq!(db.dp.tcp_state(&flow()), None);

    let delivered = forwarded(db.net(&wire), &wire);
    assert_eq!(delivered, syn);
    assert_eq!(db.dp.tcp_state(&flow()), Some(TcpState::SynReceived));

    let synack = synack();
    let wire = forwarded(db.app(&synack), &synack);
    pcap.add_pkt(&wire);
    assert_eq!(db.dp.tcp_state(&flow()), Some(TcpState::SynAckSend));

    let delivered = forwarded(web.net(&wire), &wire);
    assert_eq!(delivered, synack);
    assert_eq!(web.dp.tcp_state(&flow()), Some(TcpState::SynAckReceived));

    let ack = ack();
    let wire = forwarded(web.app(&ack), &ack);
    pcap.add_pkt(&wire);
    assert_eq!(web.dp.tcp_state(&flow()), Some(TcpState::AckSend));

    let delivered = forwarded(db.net(&wire), &wire);
    assert_eq!(delivered, ack);
}

fn only_record(records: Vec<FlowRecord>) -> FlowRecord {
    assert_eq!(records.len(), 1, "expected one record, got {records:?}");
    records.into_iter().next().unwrap()
}

#[test]
fn handshake_accepted_and_transparent() {
    let mut pcap = PcapBuilder::new("tcp_handshake.pcap");
    let (web, db) = web_and_db(DatapathConfig::default());
    handshake(&web, &db, &mut pcap);

    let rec = only_record(web.collector.flows());
    assert_eq!(rec.action, FlowAction::Accept);
    assert_eq!(rec.flow, flow());
    assert_eq!(rec.source_id, "web");
    assert_eq!(rec.destination_id, "db");
    assert_eq!(rec.context_id, "web");
    assert_eq!(rec.policy.as_ref().unwrap().policy_id, "web-to-db");

    let rec = only_record(db.collector.flows());
    assert_eq!(rec.action, FlowAction::Accept);
    assert_eq!(rec.source_id, "web");
    assert_eq!(rec.destination_id, "db");
    assert_eq!(rec.context_id, "db");
    assert_eq!(rec.policy.as_ref().unwrap().policy_id, "db-from-web");

    // The next segment establishes the client side; data then flows
    // untouched both ways.
    let payload = b"SELECT 1;";
    let seg = data(payload);
    assert!(matches!(web.app(&seg), Ok(ProcessResult::Bypass)));
    assert!(matches!(db.net(&seg), Ok(ProcessResult::Bypass)));
    pcap.add_pkt(&seg);
    assert_eq!(pkt::l4_payload(&seg), payload);

    let reply = pkt::tcp(server(), client(), PSH_ACK, SERVER_ISN + 1, CLIENT_ISN + 10, b"1");
    assert!(matches!(db.app(&reply), Ok(ProcessResult::Bypass)));
    assert!(matches!(web.net(&reply), Ok(ProcessResult::Bypass)));

    assert_eq!(web.collector.flows().len(), 1);
    assert_eq!(db.collector.flows().len(), 1);
    assert_eq!(web.dp.stats().flows_accepted, 1);
    assert_eq!(db.dp.stats().flows_accepted, 1);
}

#[test]
fn injected_bytes_hidden_from_sequence_space() {
    let (web, db) = web_and_db(DatapathConfig::default());

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    let token_len = pkt::l4_payload(&wire).len();
    let ack_size = web.dp.tokens().ack_size();
    assert_eq!(
        pkt::tcp_seq(&wire),
        CLIENT_ISN.wrapping_sub((token_len + ack_size) as u32)
    );
    forwarded(db.net(&wire), &wire);

    let synack = synack();
    let wire = forwarded(db.app(&synack), &synack);
    let token_len = pkt::l4_payload(&wire).len();
    assert_eq!(pkt::tcp_seq(&wire), SERVER_ISN.wrapping_sub(token_len as u32));
    assert_eq!(pkt::tcp_ack(&wire), (CLIENT_ISN + 1).wrapping_sub(ack_size as u32));
    forwarded(web.net(&wire), &wire);

    let ack = ack();
    let wire = forwarded(web.app(&ack), &ack);
    assert_eq!(pkt::l4_payload(&wire).len(), ack_size);
    assert_eq!(pkt::tcp_seq(&wire), (CLIENT_ISN + 1).wrapping_sub(ack_size as u32));
}

#[test]
fn receiver_policy_rejects() {
    let (web, _) = web_and_db(DatapathConfig::default());
    let mut closed = db_policy();
    closed.receiver_rules = vec![app_rule("web", reject("no-web"))];
    let db = Node::new(DatapathConfig::default(), &closed);

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    expect_drop!(db.net(&wire), DropReason::Reject(RejectReason::PolicyDrop));

    let rec = only_record(db.collector.rejected());
    assert_eq!(rec.reason, Some(RejectReason::PolicyDrop));
    assert_eq!(rec.flow, flow());
    assert_eq!((rec.flow.dst_ip, rec.flow.dst_port), (server().ip, SERVER_PORT));
    assert_eq!(rec.source_id, "web");
    assert_eq!(rec.destination_id, "db");
    assert_eq!(rec.policy.as_ref().unwrap().policy_id, "no-web");

    // A rejected SYN leaves nothing behind.
    assert_eq!(db.dp.tcp_state(&flow()), None);
    assert_eq!(db.dp.stats().flows_rejected, 1);
}

#[test]
fn unmatched_peer_rejected_by_default() {
    let (web, _) = web_and_db(DatapathConfig::default());
    let mut picky = db_policy();
    picky.receiver_rules = vec![app_rule("api", accept("db-from-api"))];
    let db = Node::new(DatapathConfig::default(), &picky);

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    expect_drop!(db.net(&wire), DropReason::Reject(RejectReason::PolicyDrop));
    let rec = only_record(db.collector.rejected());
    assert_eq!(rec.reason, Some(RejectReason::PolicyDrop));
    assert_eq!(rec.flow, flow());
    assert!(rec.policy.unwrap().is_default());
}

#[test]
fn transmitter_policy_rejects_synack() {
    let mut web_p = web_policy();
    web_p.transmitter_rules = vec![app_rule("db", reject("web-not-db"))];
    let web = Node::new(DatapathConfig::default(), &web_p);
    let db = Node::new(DatapathConfig::default(), &db_policy());

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    forwarded(db.net(&wire), &wire);
    let synack = synack();
    let wire = forwarded(db.app(&synack), &synack);

    expect_drop!(web.net(&wire), DropReason::Reject(RejectReason::PolicyDrop));
    let rec = only_record(web.collector.rejected());
    assert_eq!(rec.source_id, "web");
    assert_eq!(rec.destination_id, "db");
    assert!(web.collector.accepted().is_empty());
}

#[test]
fn mutual_authorization_off_accepts_unmatched_server() {
    let cfg = DatapathConfig { mutual_authorization: false, ..Default::default() };
    let mut web_p = web_policy();
    web_p.transmitter_rules.clear();
    let web = Node::new(cfg.clone(), &web_p);
    let db = Node::new(cfg, &db_policy());

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    forwarded(db.net(&wire), &wire);
    let synack = synack();
    let wire = forwarded(db.app(&synack), &synack);
    assert_eq!(forwarded(web.net(&wire), &wire), synack);
    assert_eq!(web.collector.accepted().len(), 1);
}

#[test]
fn syn_without_token_rejected() {
    let db = Node::new(DatapathConfig::default(), &db_policy());
    expect_drop!(db.net(&syn()), DropReason::Reject(RejectReason::InvalidToken));
    assert_eq!(only_record(db.collector.rejected()).source_id, "default");
}

#[test]
fn syn_without_option_rejected() {
    let (web, db) = web_and_db(DatapathConfig::default());
    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);

    // Same token, but delivered as a plain payload without the option.
    let bare = pkt::tcp(
        client(),
        server(),
        SYN,
        pkt::tcp_seq(&wire),
        0,
        pkt::l4_payload(&wire),
    );
    expect_drop!(db.net(&bare), DropReason::Reject(RejectReason::InvalidFormat));
}

#[test]
fn tampered_syn_rejected() {
    let (web, db) = web_and_db(DatapathConfig::default());
    let syn = syn();
    let mut wire = forwarded(web.app(&syn), &syn);

    // Flip a bit of the signature, then fix up the checksum the way a
    // forwarding hop would not have to.
    let last = wire.len() - 1;
    wire[last] ^= 0x01;
    let mut pkt = Packet::parse(wire, Direction::In).unwrap();
    pkt.update_checksums();
    let wire = pkt.into_bytes();

    expect_drop!(db.net(&wire), DropReason::Reject(RejectReason::InvalidToken));
}

#[test]
fn wrong_secret_rejected() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    let collector = Arc::new(RecordingCollector::default());
    let dp = Datapath::new(
        DatapathConfig::default(),
        Arc::new(PskSecrets::new(b"other-secret").unwrap()),
        collector.clone(),
        Arc::new(RecordingWriter::default()),
        Providers::silent(),
    )
    .unwrap();
    dp.enforce(&db_policy());

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    expect_drop!(
        dp.process_network_packet(&wire, 0),
        DropReason::Reject(RejectReason::InvalidToken)
    );
    assert_eq!(collector.rejected().len(), 1);
}

#[test]
fn synack_without_token_rejected() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    let syn = syn();
    forwarded(web.app(&syn), &syn);

    expect_drop!(web.net(&synack()), DropReason::Reject(RejectReason::MissingToken));
    let rec = only_record(web.collector.rejected());
    assert_eq!(rec.reason, Some(RejectReason::MissingToken));
}

#[test]
fn synack_for_another_syn_rejected() {
    let (web, db) = web_and_db(DatapathConfig::default());
    let twin = Node::new(DatapathConfig::default(), &web_policy());

    // db answers the SYN of web...
    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    forwarded(db.net(&wire), &wire);
    let synack = synack();
    let answer = forwarded(db.app(&synack), &synack);

    // ...which does not echo the nonce of a twin sending the same SYN.
    forwarded(twin.app(&syn), &syn);
    expect_drop!(twin.net(&answer), DropReason::Reject(RejectReason::InvalidToken));
    assert_eq!(twin.collector.rejected().len(), 1);
}

#[test]
fn ack_with_bad_token_rejected() {
    let (web, db) = web_and_db(DatapathConfig::default());
    let mut pcap = PcapBuilder::new("tcp_bad_ack.pcap");

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    forwarded(db.net(&wire), &wire);
    let synack = synack();
    let wire = forwarded(db.app(&synack), &synack);
    forwarded(web.net(&wire), &wire);

    let ack = ack();
    let mut wire = forwarded(web.app(&ack), &ack);
    let last = wire.len() - 1;
    wire[last] ^= 0xff;
    let mut p = Packet::parse(wire, Direction::In).unwrap();
    p.update_checksums();
    let wire = p.into_bytes();
    pcap.add_pkt(&wire);

    expect_drop!(db.net(&wire), DropReason::Reject(RejectReason::InvalidToken));
    assert!(db.collector.accepted().is_empty());
    assert_eq!(db.collector.rejected().len(), 1);
}

#[test]
fn ack_without_option_rejected() {
    let (web, db) = web_and_db(DatapathConfig::default());
    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    forwarded(db.net(&wire), &wire);
    let synack = synack();
    forwarded(db.app(&synack), &synack);

    expect_drop!(db.net(&ack()), DropReason::Reject(RejectReason::InvalidFormat));
}

#[test]
fn established_data_is_not_revalidated() {
    let mut pcap = PcapBuilder::new("tcp_established.pcap");
    let (web, db) = web_and_db(DatapathConfig::default());
    handshake(&web, &db, &mut pcap);

    // Once the ACK was verified the flow left the trackers: any
    // segment of the flow is passed, token or not.
    let forged = data(b"not from web");
    assert!(matches!(db.net(&forged), Ok(ProcessResult::Bypass)));
    assert_eq!(db.dp.tcp_state(&flow()), None);
}

#[test]
fn duplicate_synack_answered_again() {
    let (web, db) = web_and_db(DatapathConfig::default());

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    forwarded(db.net(&wire), &wire);
    let synack = synack();
    let synack_wire = forwarded(db.app(&synack), &synack);
    forwarded(web.net(&synack_wire), &synack_wire);
    let ack = ack();
    forwarded(web.app(&ack), &ack);

    // The ACK was lost and db retransmits its SYN-ACK.
    let again = forwarded(web.net(&synack_wire), &synack_wire);
    assert_eq!(again, synack);
    assert_eq!(web.dp.tcp_state(&flow()), Some(TcpState::SynAckReceived));

    // The stack answers it with another ACK, which carries a token.
    let wire = forwarded(web.app(&ack), &ack);
    assert_eq!(pkt::l4_payload(&wire).len(), web.dp.tokens().ack_size());

    // One accepted record, however many SYN-ACKs.
    assert_eq!(web.collector.accepted().len(), 1);
}

#[test]
fn app_synack_without_syn_dropped() {
    let db = Node::new(DatapathConfig::default(), &db_policy());
    expect_drop!(db.app(&synack()), DropReason::NoConnection);
}

#[test]
fn app_ack_before_synack_dropped() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    let syn = syn();
    forwarded(web.app(&syn), &syn);
    expect_drop!(web.app(&ack()), DropReason::Reject(RejectReason::InvalidState));
}

#[test]
fn net_synack_without_syn_passed() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    assert!(matches!(web.net(&synack()), Ok(ProcessResult::Bypass)));
}

#[test]
fn no_context_fails_closed() {
    let lonely = Node::new(DatapathConfig::default(), &PuPolicy {
        management_id: "elsewhere".into(),
        ips: vec!["10.9.9.9".parse().unwrap()],
        ..Default::default()
    });

    expect_drop!(lonely.app(&syn()), DropReason::NoContext);
    expect_drop!(lonely.net(&syn()), DropReason::NoContext);
}

#[test]
fn fin_tears_down_handshake_state() {
    let web = Node::new(DatapathConfig::default(), &web_policy());
    let syn = syn();
    forwarded(web.app(&syn), &syn);
    assert!(web.dp.tcp_state(&flow()).is_some());

    let fin = pkt::tcp(client(), server(), FIN_ACK, CLIENT_ISN + 1, 0, &[]);
    assert!(matches!(web.app(&fin), Ok(ProcessResult::Bypass)));
    assert_eq!(web.dp.tcp_state(&flow()), None);
    assert!(web.dp.tracker_entries().iter().all(|(_, n)| *n == 0));
}

#[test]
fn observed_rule_reported_not_enforced() {
    use trireme::api::ObserveAction;

    let (web, _) = web_and_db(DatapathConfig::default());
    let mut shadow = db_policy();
    let mut watch = reject("shadow-deny");
    watch.observe = ObserveAction::Continue;
    shadow.receiver_rules.insert(0, app_rule("web", watch));
    let db = Node::new(DatapathConfig::default(), &shadow);

    let syn = syn();
    let wire = forwarded(web.app(&syn), &syn);
    assert_eq!(forwarded(db.net(&wire), &wire), syn);
    let synack = synack();
    let wire = forwarded(db.app(&synack), &synack);
    forwarded(web.net(&wire), &wire);
    let ack = ack();
    let wire = forwarded(web.app(&ack), &ack);
    forwarded(db.net(&wire), &wire);

    let rec = only_record(db.collector.accepted());
    assert_eq!(rec.policy.unwrap().policy_id, "db-from-web");
    assert_eq!(rec.observed.unwrap().policy_id, "shadow-deny");
}

#[test]
fn compressed_tags_authorize() {
    use trireme::api::CompressionType;

    let cfg = DatapathConfig { compression: CompressionType::V2, ..Default::default() };
    let mut web_p = web_policy();
    web_p.compressed_tags = vec!["app=web".into()];
    let mut db_p = db_policy();
    db_p.compressed_tags = vec!["app=db".into()];
    let web = Node::new(cfg.clone(), &web_p);
    let db = Node::new(cfg, &db_p);

    let mut pcap = PcapBuilder::new("tcp_compressed.pcap");
    handshake(&web, &db, &mut pcap);
    assert_eq!(web.collector.accepted().len(), 1);
    assert_eq!(db.collector.accepted().len(), 1);
}
