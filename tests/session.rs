use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use rand_core::{OsRng, RngCore};
use trudp::header::verify_and_decode;
use trudp::{
    AckEvent, CommandId, Config, Error, Header, MessageType, PacketSink, Received, ReliableIf, SeqNo, Transport,
    TrudpSession,
};

/// An in-memory socket: sent datagrams pile up in `outbox` and time only moves when a test says so.
#[derive(Default)]
struct Net {
    now: i64,
    outbox: Vec<(SocketAddr, Vec<u8>)>,
}
impl Transport for Net {
    fn time(&mut self) -> i64 {
        self.now
    }
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.outbox.push((addr, datagram.to_vec()));
        Ok(datagram.len())
    }
}

#[derive(Default)]
struct Inbox {
    delivered: Vec<(Vec<u8>, SocketAddr)>,
    acks: Vec<(SeqNo, CommandId, Vec<u8>)>,
    unreachable: Vec<(SocketAddr, SeqNo)>,
    rejected: Vec<SocketAddr>,
}
impl PacketSink for Inbox {
    fn deliver(&mut self, payload: &[u8], from: SocketAddr) {
        self.delivered.push((payload.to_vec(), from));
    }
    fn ack(&mut self, event: AckEvent<'_>) {
        self.acks.push((event.id, event.command, event.payload.to_vec()));
    }
    fn unreachable(&mut self, peer: SocketAddr, id: SeqNo) {
        self.unreachable.push((peer, id));
    }
    fn rejected(&mut self, from: SocketAddr) {
        self.rejected.push(from);
    }
}

type Session = TrudpSession<Net, HashMap<SocketAddr, String>, Inbox>;

const CMD: CommandId = 3;

fn alice() -> SocketAddr {
    "127.0.0.1:9027".parse().unwrap()
}
fn bob() -> SocketAddr {
    "127.0.0.1:9029".parse().unwrap()
}

fn session_knowing(peer: SocketAddr, config: Config) -> Session {
    let mut peers = HashMap::new();
    peers.insert(peer, "peer".to_string());
    TrudpSession::new(Net::default(), peers, Inbox::default(), config)
}

fn take_outbox(session: &mut Session) -> Vec<Vec<u8>> {
    session.transport_mut().outbox.drain(..).map(|(_, d)| d).collect()
}

/// Feeds everything `from` has sent to `to`.
fn flush(from: &mut Session, from_addr: SocketAddr, to: &mut Session) {
    for datagram in take_outbox(from) {
        assert_eq!(to.recv_from(&datagram, from_addr), Received::Consumed);
    }
}

fn decode(datagram: &[u8]) -> (Header, Vec<u8>) {
    let (header, payload) = verify_and_decode(datagram).unwrap();
    (header, payload.to_vec())
}

fn data(id: SeqNo) -> Vec<u8> {
    let payload = format!("message {}", id);
    Header::new(id, MessageType::Data, payload.len() as u16, id).encode(payload.as_bytes())
}

fn shuffle<T>(items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = OsRng.next_u32() as usize % (i + 1);
        items.swap(i, j);
    }
}

#[test]
fn ids_count_up_from_zero() {
    let mut a = session_knowing(bob(), Config::default());
    for i in 0..5u8 {
        a.send_to(bob(), CMD, &[i]).unwrap();
    }
    let ids: Vec<SeqNo> = take_outbox(&mut a).iter().map(|d| decode(d).0.id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    let conn = a.connection(&bob()).unwrap();
    assert_eq!(conn.next_send_id, 5);
    assert_eq!(conn.send_list.len(), 5);
    assert_eq!(conn.stats.packets_send, 5);
    assert_eq!(a.stats().send_list_size, 5);
}

#[test]
fn hello_world_scenario() {
    let mut a = session_knowing(bob(), Config::default());
    let mut b = session_knowing(alice(), Config::default());

    let sent = a.send_to(bob(), CMD, b"Hello world - 1\0").unwrap();
    assert_eq!(sent, trudp::HEADER_SIZE + 16);
    let conn = a.connection(&bob()).unwrap();
    assert_eq!(conn.send_list.len(), 1);
    assert!(conn.send_list.get(0).is_some());

    let wire = take_outbox(&mut a);
    assert_eq!(wire.len(), 1);
    let (header, _) = decode(&wire[0]);
    assert_eq!((header.id, header.payload_length, header.message_type), (0, 16, MessageType::Data));

    b.recv_from(&wire[0], alice());
    let replies = take_outbox(&mut b);
    assert_eq!(replies.len(), 1);
    let (ack, payload) = decode(&replies[0]);
    assert_eq!((ack.message_type, ack.id, ack.timestamp), (MessageType::Ack, 0, header.timestamp));
    assert!(payload.is_empty());
    assert_eq!(b.sink().delivered, vec![(b"Hello world - 1\0".to_vec(), alice())]);
}

#[test]
fn ack_clears_the_send_list() {
    let mut a = session_knowing(bob(), Config::default());
    let mut b = session_knowing(alice(), Config::default());

    a.send_to(bob(), CMD, b"ping").unwrap();
    assert!(a.next_deadline().is_some());
    flush(&mut a, alice(), &mut b);
    a.transport_mut().now = 1_500;
    flush(&mut b, bob(), &mut a);

    let conn = a.connection(&bob()).unwrap();
    assert!(conn.send_list.is_empty());
    assert_eq!(conn.stats.ack_receive, 1);
    assert_eq!(conn.stats.triptime_last, 1_500);
    assert_eq!(a.next_deadline(), None);
    assert_eq!(a.stats().send_list_size, 0);
    assert_eq!(a.service(), None);
}

#[test]
fn in_order_delivery_under_reordering_and_duplicates() {
    const N: SeqNo = 64;
    let mut b = session_knowing(alice(), Config::default());

    let mut wire: Vec<Vec<u8>> = (0..N).map(data).collect();
    for _ in 0..N / 2 {
        let dup = OsRng.next_u32() % N;
        wire.push(data(dup));
    }
    shuffle(&mut wire);

    for datagram in &wire {
        b.recv_from(datagram, alice());
    }

    let delivered: Vec<Vec<u8>> = b.sink().delivered.iter().map(|(p, _)| p.clone()).collect();
    let expected: Vec<Vec<u8>> = (0..N).map(|id| format!("message {}", id).into_bytes()).collect();
    assert_eq!(delivered, expected);

    let conn = b.connection(&alice()).unwrap();
    assert_eq!(conn.expected_id, N);
    assert!(conn.receive_heap.is_empty());
    assert_eq!(conn.stats.packets_receive, wire.len() as u32);
    assert_eq!(b.stats().receive_heap_size, 0);
    assert_eq!(take_outbox(&mut b).len(), wire.len());
}

#[test]
fn ids_3_to_25_in_random_order() {
    let mut b = session_knowing(alice(), Config::default());
    for id in 0..3 {
        b.recv_from(&data(id), alice());
    }
    assert_eq!(b.connection(&alice()).unwrap().expected_id, 3);
    b.sink_mut().delivered.clear();
    take_outbox(&mut b);

    let mut ids: Vec<SeqNo> = (3..=25).collect();
    shuffle(&mut ids);
    for id in &ids {
        b.recv_from(&data(*id), alice());
    }

    let mut acked: Vec<SeqNo> = take_outbox(&mut b).iter().map(|d| decode(d).0.id).collect();
    assert_eq!(acked.len(), 23);
    acked.sort();
    assert_eq!(acked, (3..=25).collect::<Vec<_>>());

    let delivered: Vec<Vec<u8>> = b.sink().delivered.iter().map(|(p, _)| p.clone()).collect();
    let expected: Vec<Vec<u8>> = (3..=25).map(|id| format!("message {}", id).into_bytes()).collect();
    assert_eq!(delivered, expected);
    assert!(b.stats().receive_heap_size_max <= 22);
}

#[test]
fn stale_and_held_duplicates_are_acked_and_dropped() {
    let mut b = session_knowing(alice(), Config::default());
    b.recv_from(&data(0), alice());
    b.recv_from(&data(0), alice());
    b.recv_from(&data(5), alice());
    b.recv_from(&data(5), alice());

    let conn = b.connection(&alice()).unwrap();
    assert_eq!(conn.stats.packets_receive, 4);
    assert_eq!(conn.stats.packets_receive_dropped, 2);
    assert_eq!(conn.receive_heap.len(), 1);
    assert_eq!(b.sink().delivered.len(), 1);
    assert_eq!(take_outbox(&mut b).len(), 4);
}

#[test]
fn unacknowledged_message_is_resent_with_the_same_id() {
    let mut a = session_knowing(bob(), Config::default());
    a.send_to(bob(), CMD, b"are you there").unwrap();
    let (first, first_payload) = decode(&take_outbox(&mut a)[0]);

    let wait = Config::default().default_ack_wait as i64;
    a.transport_mut().now = wait - 1;
    assert_eq!(a.service(), Some(1));
    assert!(take_outbox(&mut a).is_empty());

    a.transport_mut().now = wait;
    assert_eq!(a.service(), Some(wait));
    let resent = take_outbox(&mut a);
    assert_eq!(resent.len(), 1);
    let (second, second_payload) = decode(&resent[0]);
    assert_eq!(second.id, first.id);
    assert_eq!(second_payload, first_payload);
    assert_eq!(second.timestamp, wait as u32);

    let conn = a.connection(&bob()).unwrap();
    assert_eq!(conn.send_list.get(first.id).unwrap().attempt, 1);
    assert_eq!(conn.stats.packets_attempt, 1);
    assert_eq!(conn.stats.packets_send, 1);
    assert_eq!(a.stats().send_list_attempts, 1);
}

#[test]
fn retry_is_unbounded_by_default() {
    let mut a = session_knowing(bob(), Config::default());
    a.send_to(bob(), CMD, b"x").unwrap();
    for _ in 0..50 {
        let wait = a.service().unwrap();
        let now = a.transport().now;
        a.transport_mut().now = now + wait;
    }
    a.service();
    assert_eq!(a.connection(&bob()).unwrap().send_list.get(0).unwrap().attempt, 50);
    assert!(a.sink().unreachable.is_empty());
}

#[test]
fn bounded_retry_reports_the_peer_unreachable() {
    let config = Config { max_attempts: Some(2), ..Config::default() };
    let mut a = session_knowing(bob(), config);
    a.send_to(bob(), CMD, b"x").unwrap();
    a.send_to(bob(), CMD, b"y").unwrap();
    take_outbox(&mut a);

    for _ in 0..2 {
        let wait = a.service().unwrap();
        let now = a.transport().now;
        a.transport_mut().now = now + wait;
        a.service();
    }
    assert_eq!(take_outbox(&mut a).len(), 4);

    let wait = a.service().unwrap();
    let now = a.transport().now;
    a.transport_mut().now = now + wait;
    a.service();

    assert_eq!(a.sink().unreachable, vec![(bob(), 0)]);
    let wire = take_outbox(&mut a);
    assert_eq!(wire.len(), 1);
    let (reset, _) = decode(&wire[0]);
    assert_eq!((reset.message_type, reset.id), (MessageType::Reset, 2));

    let conn = a.connection(&bob()).unwrap();
    assert_eq!(conn.send_list.len(), 1);
    assert!(conn.send_list.pending_reset().is_some());
    assert_eq!(conn.next_send_id, 0);
    assert_eq!(a.stats().send_list_size, 1);
}

#[test]
fn local_reset_restarts_both_counters() {
    let mut a = session_knowing(bob(), Config::default());
    let mut b = session_knowing(alice(), Config::default());
    for _ in 0..3 {
        a.send_to(bob(), CMD, b"before").unwrap();
    }
    take_outbox(&mut a);
    a.send_to(bob(), CMD, b"gap").unwrap();
    let held = take_outbox(&mut a);
    b.recv_from(&data(7), alice());
    b.recv_from(&held[0], alice());

    assert!(a.reset(bob(), false));
    assert!(b.reset(alice(), false));
    for (session, peer) in [(&a, bob()), (&b, alice())] {
        let conn = session.connection(&peer).unwrap();
        assert!(conn.send_list.is_empty());
        assert!(conn.receive_heap.is_empty());
        assert_eq!((conn.next_send_id, conn.expected_id), (0, 0));
    }
    assert_eq!(a.stats().send_list_size, 0);
    assert_eq!(b.stats().receive_heap_size, 0);

    b.sink_mut().delivered.clear();
    a.send_to(bob(), CMD, b"after").unwrap();
    let wire = take_outbox(&mut a);
    assert_eq!(decode(&wire[0]).0.id, 0);
    b.recv_from(&wire[0], alice());
    assert_eq!(b.sink().delivered, vec![(b"after".to_vec(), alice())]);

    assert!(a.reset(bob(), true));
    assert!(a.connection(&bob()).is_none());
    assert!(!a.reset(bob(), true));
}

#[test]
fn reset_message_restarts_the_remote_end() {
    let mut a = session_knowing(bob(), Config::default());
    let mut b = session_knowing(alice(), Config::default());

    for _ in 0..4 {
        a.send_to(bob(), CMD, b"old").unwrap();
    }
    flush(&mut a, alice(), &mut b);
    b.send_to(alice(), CMD, b"pending").unwrap();
    take_outbox(&mut b);
    flush(&mut b, bob(), &mut a);
    assert_eq!(b.connection(&alice()).unwrap().expected_id, 4);

    a.send_reset(bob()).unwrap();
    let reset = take_outbox(&mut a);
    let (header, _) = decode(&reset[0]);
    assert_eq!((header.message_type, header.id), (MessageType::Reset, 4));
    let conn = a.connection(&bob()).unwrap();
    assert_eq!((conn.next_send_id, conn.expected_id), (0, 0));
    assert_eq!(conn.send_list.len(), 1);

    b.recv_from(&reset[0], alice());
    let conn = b.connection(&alice()).unwrap();
    assert_eq!(conn.expected_id, 0);
    assert_eq!(conn.next_send_id, 0);
    assert!(conn.send_list.is_empty());

    // A retransmitted RESET is acknowledged again but not applied twice.
    b.send_to(alice(), CMD, b"new").unwrap();
    b.recv_from(&reset[0], alice());
    assert_eq!(b.connection(&alice()).unwrap().send_list.len(), 1);
    let acks: Vec<Vec<u8>> = take_outbox(&mut b).into_iter().filter(|d| decode(d).0.message_type == MessageType::Ack).collect();
    assert_eq!(acks.len(), 2);
    assert!(acks.iter().all(|d| decode(d).0.id == 4));

    a.send_to(bob(), CMD, b"first after reset").unwrap();
    assert_eq!(a.connection(&bob()).unwrap().send_list.len(), 2);
    b.sink_mut().delivered.clear();
    flush(&mut a, alice(), &mut b);
    assert_eq!(b.sink().delivered, vec![(b"first after reset".to_vec(), alice())]);

    for ack in &acks {
        a.recv_from(ack, bob());
    }
    flush(&mut b, bob(), &mut a);
    assert!(a.connection(&bob()).unwrap().send_list.is_empty());
    assert_eq!(a.stats().send_list_size, 0);
}

#[test]
fn data_restarts_at_zero_after_a_reset_mid_sequence() {
    let mut b = session_knowing(alice(), Config::default());
    for id in 0..7 {
        b.recv_from(&data(id), alice());
    }
    let reset = Header::new(7, MessageType::Reset, 0, 1234).encode(&[]);
    b.recv_from(&reset, alice());
    assert_eq!(b.connection(&alice()).unwrap().expected_id, 0);

    b.sink_mut().delivered.clear();
    let fresh = Header::new(0, MessageType::Data, 5, 1300).encode(b"fresh");
    b.recv_from(&fresh, alice());
    assert_eq!(b.sink().delivered, vec![(b"fresh".to_vec(), alice())]);
    assert_eq!(b.connection(&alice()).unwrap().expected_id, 1);
}

#[test]
fn reset_ack_leaves_round_trip_history_alone() {
    let mut a = session_knowing(bob(), Config::default());
    let mut b = session_knowing(alice(), Config::default());
    a.send_reset(bob()).unwrap();
    take_outbox(&mut a);

    for _ in 0..3 {
        let wait = a.service().unwrap();
        a.transport_mut().now += wait;
        a.service();
    }
    flush(&mut a, alice(), &mut b);
    flush(&mut b, bob(), &mut a);

    let conn = a.connection(&bob()).unwrap();
    assert!(conn.send_list.is_empty());
    assert_eq!(conn.stats.ack_receive, 0);
    assert_eq!(conn.stats.triptime_last_max, 0);
    assert_eq!(a.stats().send_list_size, 0);
}

#[test]
fn reset_is_retransmitted_with_its_original_timestamp() {
    let mut a = session_knowing(bob(), Config::default());
    a.transport_mut().now = 42;
    a.send_reset(bob()).unwrap();
    let (first, _) = decode(&take_outbox(&mut a)[0]);

    let wait = a.service().unwrap();
    a.transport_mut().now += wait;
    a.service();
    let (again, _) = decode(&take_outbox(&mut a)[0]);
    assert_eq!((again.message_type, again.id, again.timestamp), (MessageType::Reset, 0, first.timestamp));
}

#[test]
fn restart_detection_is_opt_in() {
    for reset_on_restart in [false, true] {
        let config = Config { reset_on_restart, ..Config::default() };
        let mut b = session_knowing(alice(), config);
        for id in 0..5 {
            b.recv_from(&data(id), alice());
        }
        b.recv_from(&data(0), alice());
        let conn = b.connection(&alice()).unwrap();
        if reset_on_restart {
            assert_eq!(conn.expected_id, 1);
            assert_eq!(b.sink().delivered.len(), 6);
        } else {
            assert_eq!(conn.expected_id, 5);
            assert_eq!(conn.stats.packets_receive_dropped, 1);
            assert_eq!(b.sink().delivered.len(), 5);
        }
    }
}

#[test]
fn unregistered_peers_are_rejected_without_state() {
    let stranger: SocketAddr = "10.1.2.3:4000".parse().unwrap();
    let mut b = session_knowing(alice(), Config::default());

    assert_eq!(b.recv_from(&data(0), stranger), Received::Consumed);
    assert!(b.connection(&stranger).is_none());
    assert!(b.sink().delivered.is_empty());
    assert_eq!(b.sink().rejected, vec![stranger]);
    assert_eq!(b.stats().rejected, 1);
    assert!(take_outbox(&mut b).is_empty());

    let reset = Header::new(0, MessageType::Reset, 0, 55).encode(&[]);
    assert_eq!(b.recv_from(&reset, stranger), Received::Consumed);
    assert!(b.connection(&stranger).is_none());
    assert_eq!(b.sink().rejected, vec![stranger, stranger]);
    assert!(take_outbox(&mut b).is_empty());

    let mut open = session_knowing(alice(), Config { accept_unregistered: true, ..Config::default() });
    open.recv_from(&data(0), stranger);
    assert_eq!(open.sink().delivered.len(), 1);
    assert!(open.connection(&stranger).is_some());
}

#[test]
fn acks_never_create_connections() {
    let stranger: SocketAddr = "10.1.2.3:4000".parse().unwrap();
    let mut b = session_knowing(alice(), Config::default());
    let ack = Header::new(0, MessageType::Ack, 0, 0).encode(&[]);

    for from in [stranger, alice()] {
        assert_eq!(b.recv_from(&ack, from), Received::Consumed);
        assert!(b.connection(&from).is_none());
    }
    assert_eq!(b.connections().count(), 0);
    assert!(b.sink().rejected.is_empty());
    assert!(take_outbox(&mut b).is_empty());
}

#[test]
fn peer_removed_from_the_table_is_no_longer_accepted() {
    let mut b = session_knowing(alice(), Config::default());
    b.recv_from(&data(0), alice());
    assert_eq!(b.connection(&alice()).unwrap().peer.as_ref().map(|p| p.name.as_str()), Some("peer"));

    b.peers_mut().clear();
    b.recv_from(&data(1), alice());
    assert_eq!(b.sink().delivered.len(), 1);
    assert_eq!(b.stats().rejected, 1);
}

#[test]
fn foreign_datagrams_pass_through() {
    let mut b = session_knowing(alice(), Config::default());
    let garbage = b"not a TR-UDP datagram at all";
    assert_eq!(b.recv_from(garbage, alice()), Received::Passthrough(&garbage[..]));
    assert_eq!(b.recv_from(&[1, 2, 3], alice()), Received::Passthrough(&[1u8, 2, 3][..]));

    let mut corrupted = data(0);
    corrupted[6] ^= 0x40;
    assert!(matches!(b.recv_from(&corrupted, alice()), Received::Passthrough(_)));

    assert_eq!(b.stats().passthrough, 3);
    assert!(b.connection(&alice()).is_none());
}

#[test]
fn application_commands_report_their_acks() {
    let mut a = session_knowing(bob(), Config::default());
    let mut b = session_knowing(alice(), Config::default());

    a.send_to(bob(), 130, b"app").unwrap();
    a.send_to(bob(), CMD, b"internal").unwrap();
    flush(&mut a, alice(), &mut b);
    flush(&mut b, bob(), &mut a);

    assert_eq!(a.sink().acks, vec![(0, 130, b"app".to_vec())]);
    assert!(a.connection(&bob()).unwrap().send_list.is_empty());
}

#[test]
fn unreliable_commands_bypass_the_protocol() {
    let mut peers = HashMap::new();
    peers.insert(bob(), "bob".to_string());
    let mut a = TrudpSession::with_policy(Net::default(), peers, Inbox::default(), ReliableIf(|cmd: CommandId| cmd != 9), Config::default());

    assert_eq!(a.send_to(bob(), 9, b"raw").unwrap(), 3);
    assert_eq!(a.transport().outbox, vec![(bob(), b"raw".to_vec())]);
    assert!(a.connection(&bob()).is_none());
}

#[test]
fn oversized_payload_is_refused_before_an_id_is_taken() {
    let mut a = session_knowing(bob(), Config { max_payload: 8, ..Config::default() });
    match a.send_to(bob(), CMD, &[0; 9]) {
        Err(Error::PayloadTooLarge { len: 9, max: 8 }) => {}
        other => panic!("unexpected result {:?}", other),
    }
    assert!(a.connection(&bob()).is_none());
    a.send_to(bob(), CMD, &[0; 8]).unwrap();
    assert_eq!(decode(&take_outbox(&mut a)[0]).0.id, 0);
}

#[test]
fn stats_dump_lists_connections() {
    let mut a = session_knowing(bob(), Config::default());
    a.send_to(bob(), CMD, b"x").unwrap();
    let report = a.stats_dump();
    assert!(report.contains("127.0.0.1:9029"));
}

#[test]
fn destroy_all_forgets_everything() {
    let mut a = session_knowing(bob(), Config::default());
    a.send_to(bob(), CMD, b"x").unwrap();
    a.send_to(alice(), CMD, b"y").unwrap();
    a.destroy_all();
    assert_eq!(a.connections().count(), 0);
    assert_eq!(a.stats().send_list_size, 0);
    assert_eq!(a.service(), None);
}
