use std::cmp::Ordering;
use std::net::SocketAddr;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::header::{self, Header, MessageType};
use crate::ip_map::{Cleared, ConnectionState, IpMap};
use crate::receive_heap::{Drained, ReceiveHeapEntry};
use crate::send_list::{ack_wait, SendEntry};
use crate::stats::{render_report, ChannelRow, SessionStats};
use crate::transport_layer::{AckEvent, CommandId, CommandPolicy, MeshCommands, PacketSink, PeerHandle, PeerTable, Transport};
use crate::SeqNo;

/// What [`TrudpSession::recv_from`] did with a datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received<'a> {
    /// The datagram was TR-UDP traffic and has been fully handled.
    Consumed,
    /// The datagram is not TR-UDP. The caller should parse it as some other packet.
    Passthrough(&'a [u8]),
}

/// Reliable, per-peer ordered messaging over one datagram socket.
///
/// A session owns its socket through `T`, consults the mesh's peer table through `P`, hands
/// in-order payloads and notifications to `S`, and asks `C` which commands need reliability.
/// It does no I/O on its own: feed it every received datagram through `recv_from`, and call
/// `service` whenever the time it last returned has elapsed.
pub struct TrudpSession<T, P, S, C = MeshCommands> {
    transport: T,
    peers: P,
    sink: S,
    policy: C,
    config: Config,
    ip_map: IpMap,
    stats: SessionStats,
}

impl<T: Transport, P: PeerTable, S: PacketSink> TrudpSession<T, P, S> {
    pub fn new(transport: T, peers: P, sink: S, config: Config) -> Self {
        Self::with_policy(transport, peers, sink, MeshCommands, config)
    }
}

impl<T: Transport, P: PeerTable, S: PacketSink, C: CommandPolicy> TrudpSession<T, P, S, C> {
    pub fn with_policy(transport: T, peers: P, sink: S, policy: C, config: Config) -> Self {
        Self {
            transport,
            peers,
            sink,
            policy,
            config,
            ip_map: IpMap::new(),
            stats: SessionStats::default(),
        }
    }

    /// Sends `payload` to `addr` carrying mesh command `command`.
    ///
    /// If the command is reliable the payload is given the peer's next sequence id, recorded in
    /// the peer's send list and retransmitted until acknowledged. The returned length then
    /// includes the TR-UDP header. Unreliable commands are written to the socket unchanged.
    ///
    /// A payload longer than `Config::max_payload` is refused before any id is allocated.
    /// If the socket refuses a reliable datagram the error is returned, but the message stays
    /// in the send list and will go out again when its timer fires.
    pub fn send_to(&mut self, addr: SocketAddr, command: CommandId, payload: &[u8]) -> Result<usize> {
        if !self.policy.is_reliable(command) {
            log::trace!("sending {} bytes of unreliable command {} to {}", payload.len(), command, addr);
            return Ok(self.transport.send_to(payload, addr)?);
        }
        let max = self.config.payload_limit();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge { len: payload.len(), max });
        }
        let now = self.transport.time();
        let id = self.ip_map.get_or_create(&addr, now).allocate_id();
        let entry = SendEntry::data(id, command, payload.to_vec(), header::timestamp(now));
        self.transmit_new(addr, entry, now)
    }

    /// Restarts the sequence of the connection to `addr` on both ends.
    ///
    /// The RESET takes the next id of the sequence it ends. Everything outstanding to and from
    /// `addr` is then dropped locally and both counters restart at 0, so the next DATA to `addr`
    /// carries id 0. The remote end resets its own state when the RESET arrives. The RESET is
    /// retransmitted like DATA until acknowledged.
    pub fn send_reset(&mut self, addr: SocketAddr) -> Result<usize> {
        let now = self.transport.time();
        let conn = self.ip_map.get_or_create(&addr, now);
        let id = conn.allocate_id();
        let cleared = conn.reset();
        self.account_cleared(cleared);
        log::debug!("sending RESET to {}", addr);
        self.transmit_new(addr, SendEntry::reset(id, header::timestamp(now)), now)
    }

    fn transmit_new(&mut self, addr: SocketAddr, mut entry: SendEntry, now: i64) -> Result<usize> {
        let datagram = entry.datagram();
        let conn = self.ip_map.get_or_create(&addr, now);
        let wait = ack_wait(&conn.stats, &self.config);
        conn.stats.wait = wait;
        conn.stats.record_send(entry.payload.len());
        conn.last_activity = now;
        entry.timer.start(now, wait);
        log::trace!(
            "sending {:?} id {} with {} payload bytes to {}, ack wait {}us",
            entry.message_type,
            entry.id,
            entry.payload.len(),
            addr,
            wait
        );
        if conn.send_list.insert(entry).is_none() {
            self.stats.send_list_added();
        }
        match self.transport.send_to(&datagram, addr) {
            Ok(n) => Ok(n),
            Err(e) => {
                log::warn!("socket send to {} failed, message stays queued for resend: {}", addr, e);
                Err(Error::Io(e))
            }
        }
    }

    /// Processes one datagram received from `from`.
    ///
    /// TR-UDP traffic is consumed: DATA is acknowledged and delivered to the sink in id order,
    /// ACKs retire send list entries, and RESETs restart the connection. Anything that fails the
    /// header checks is handed back untouched.
    ///
    /// DATA and RESET from an address the peer table does not know are dropped without creating
    /// any connection state, unless `Config::accept_unregistered` is set. ACKs need no peer
    /// table entry but are only honoured for connections this session already tracks.
    pub fn recv_from<'a>(&mut self, datagram: &'a [u8], from: SocketAddr) -> Received<'a> {
        let (header, payload) = match header::verify_and_decode(datagram) {
            Ok(v) => v,
            Err(e) => {
                log::trace!("passing through {} bytes from {}: {}", datagram.len(), from, e);
                self.stats.passthrough += 1;
                return Received::Passthrough(datagram);
            }
        };
        log::trace!(
            "received {:?} id {} with {} payload bytes from {}",
            header.message_type,
            header.id,
            header.payload_length,
            from
        );
        let peer = self.peers.lookup(&from);
        if header.message_type.is_reliable() && peer.is_none() && !self.config.accept_unregistered {
            log::warn!("dropping {:?} from {}: not in the peer table", header.message_type, from);
            self.stats.rejected += 1;
            self.sink.rejected(from);
            return Received::Consumed;
        }
        let now = self.transport.time();
        match header.message_type {
            MessageType::Data => self.on_data(&header, payload, from, peer, now),
            MessageType::Ack => self.on_ack(&header, from, peer, now),
            MessageType::Reset => self.on_reset(&header, from, peer, now),
        }
        Received::Consumed
    }

    fn send_ack(&mut self, header: &Header, to: SocketAddr) {
        let ack = header.to_ack().encode(&[]);
        log::trace!("sending ACK id {} to {}", header.id, to);
        if let Err(e) = self.transport.send_to(&ack, to) {
            log::warn!("failed to send ACK id {} to {}: {}", header.id, to, e);
        }
    }

    fn on_data(&mut self, header: &Header, payload: &[u8], from: SocketAddr, peer: Option<PeerHandle>, now: i64) {
        // Every structurally valid DATA is acknowledged, whatever becomes of it.
        self.send_ack(header, from);

        let conn = self.ip_map.get_or_create(&from, now);
        conn.peer = peer;
        conn.last_activity = now;

        if self.config.reset_on_restart && header.id == 0 && conn.expected_id != 0 && !conn.receive_heap.contains(0) {
            log::debug!("{} restarted its sequence at id 0 while {} was expected", from, conn.expected_id);
            let cleared = conn.reset();
            self.stats.send_list_removed(cleared.send_list);
            self.stats.receive_heap_removed(cleared.receive_heap);
        }

        conn.stats.record_receive(payload.len());
        match header.id.cmp(&conn.expected_id) {
            Ordering::Equal => {
                conn.expected_id = conn.expected_id.wrapping_add(1);
                self.sink.deliver(payload, from);
                while let Some(step) = conn.receive_heap.pop_ready(conn.expected_id) {
                    self.stats.receive_heap_removed(1);
                    match step {
                        Drained::Deliver(held) => {
                            log::trace!("delivering held id {} from {}", held.id, from);
                            conn.expected_id = conn.expected_id.wrapping_add(1);
                            self.sink.deliver(&held.payload, held.from);
                        }
                        Drained::Stale(held) => {
                            log::trace!("discarding stale held id {} from {}", held.id, from);
                        }
                    }
                }
            }
            Ordering::Less => {
                log::trace!("dropping repeated id {} from {}, expected {}", header.id, from, conn.expected_id);
                conn.stats.record_receive_dropped();
            }
            Ordering::Greater => {
                let held = ReceiveHeapEntry { id: header.id, payload: payload.to_vec(), from };
                if conn.receive_heap.push(held) {
                    log::trace!("holding id {} from {} until {} arrives", header.id, from, conn.expected_id);
                    self.stats.receive_heap_added();
                } else {
                    log::trace!("id {} from {} is already held", header.id, from);
                    conn.stats.record_receive_dropped();
                }
            }
        }
    }

    fn on_ack(&mut self, header: &Header, from: SocketAddr, peer: Option<PeerHandle>, now: i64) {
        let Some(conn) = self.ip_map.try_get_mut(&from) else {
            log::trace!("ignoring ACK id {} from untracked {}", header.id, from);
            return;
        };
        conn.peer = peer;
        conn.last_activity = now;
        let Some(entry) = conn.send_list.acknowledge(header.id, header.timestamp) else {
            log::trace!("ignoring ACK for id {} from {}: nothing outstanding", header.id, from);
            return;
        };
        self.stats.send_list_removed(1);
        if entry.message_type == MessageType::Reset {
            // A RESET keeps its first timestamp, so its ACK is no trip-time sample.
            log::debug!("RESET acknowledged by {}", from);
            return;
        }
        conn.stats.record_ack(header::timestamp(now), header.timestamp);
        log::trace!("id {} acknowledged by {} in {}us", header.id, from, conn.stats.triptime_last);

        if let Some(command) = entry.command {
            if self.policy.notifies_ack(command) {
                self.sink.ack(AckEvent { peer: from, id: entry.id, command, payload: &entry.payload });
            }
        }
    }

    fn on_reset(&mut self, header: &Header, from: SocketAddr, peer: Option<PeerHandle>, now: i64) {
        let conn = self.ip_map.get_or_create(&from, now);
        conn.peer = peer;
        conn.last_activity = now;
        if conn.last_reset == Some(header.timestamp) {
            log::trace!("RESET from {} already applied", from);
        } else {
            log::debug!("{} reset the connection", from);
            let cleared = conn.reset();
            conn.last_reset = Some(header.timestamp);
            conn.stats.record_receive(0);
            self.stats.send_list_removed(cleared.send_list);
            self.stats.receive_heap_removed(cleared.receive_heap);
        }
        self.send_ack(header, from);
    }

    /// Resends every message whose retransmit timer has fired.
    ///
    /// A resend reuses the message's id and payload with a fresh timestamp, increments its
    /// attempt count and re-arms its timer with the peer's current adaptive wait.
    /// With `Config::max_attempts` set, a message that has already been resent that many times
    /// makes the session give up on its peer instead: the sink is told the peer is unreachable
    /// and the connection is reset.
    ///
    /// Returns how many microseconds from now `service` should be called again, or `None` if
    /// nothing is waiting for an ACK.
    pub fn service(&mut self) -> Option<i64> {
        let now = self.transport.time();
        let mut outgoing = Vec::new();
        let mut exhausted = Vec::new();

        for conn in self.ip_map.iter_mut() {
            for entry in conn.send_list.due(now) {
                if self.config.max_attempts.map_or(false, |max| entry.attempt >= max) {
                    exhausted.push((conn.addr, entry.id, entry.message_type));
                    break;
                }
                let wait = ack_wait(&conn.stats, &self.config);
                entry.attempt += 1;
                entry.timer.start(now, wait);
                log::debug!(
                    "resending {:?} id {} to {} (attempt {}, next wait {}us)",
                    entry.message_type,
                    entry.id,
                    conn.addr,
                    entry.attempt,
                    wait
                );
                outgoing.push((conn.addr, entry.restamp(now)));
                conn.stats.record_attempt();
                conn.stats.wait = wait;
                conn.last_activity = now;
                self.stats.send_list_attempts += 1;
            }
        }

        for (addr, datagram) in outgoing {
            if let Err(e) = self.transport.send_to(&datagram, addr) {
                log::warn!("socket resend to {} failed: {}", addr, e);
            }
        }
        for (addr, id, message_type) in exhausted {
            self.give_up(addr, id, message_type);
        }

        let now = self.transport.time();
        self.ip_map.next_deadline().map(|deadline| (deadline - now).max(0))
    }

    fn give_up(&mut self, addr: SocketAddr, id: SeqNo, message_type: MessageType) {
        log::warn!("{} did not acknowledge {:?} id {} in time, giving up", addr, message_type, id);
        self.sink.unreachable(addr, id);
        if message_type == MessageType::Reset {
            // The peer did not even answer a RESET, so stop tracking it altogether.
            self.reset(addr, true);
        } else if let Err(e) = self.send_reset(addr) {
            log::warn!("failed to send RESET to {}: {}", addr, e);
        }
    }

    /// Drops all state for the connection to `addr` and restarts both of its sequence counters
    /// at 0. With `remove` the connection is also forgotten entirely.
    /// Nothing is sent to the peer; use [`send_reset`](Self::send_reset) for that.
    ///
    /// Returns `false` if no connection to `addr` was tracked.
    pub fn reset(&mut self, addr: SocketAddr, remove: bool) -> bool {
        match self.ip_map.reset(&addr, remove) {
            Some(cleared) => {
                self.account_cleared(cleared);
                true
            }
            None => false,
        }
    }

    /// Resets and forgets every connection.
    pub fn destroy_all(&mut self) {
        let cleared = self.ip_map.destroy_all();
        self.account_cleared(cleared);
    }

    fn account_cleared(&mut self, cleared: Cleared) {
        self.stats.send_list_removed(cleared.send_list);
        self.stats.receive_heap_removed(cleared.receive_heap);
    }

    /// Human-readable statistics for every tracked connection.
    pub fn stats_dump(&self) -> String {
        let mut rows: Vec<ChannelRow<'_>> = self
            .ip_map
            .iter()
            .map(|(key, conn)| ChannelRow {
                key,
                peer: conn.peer.as_ref().map(|p| p.name.as_str()),
                stats: &conn.stats,
                send_list: conn.send_list.len(),
                receive_heap: conn.receive_heap.len(),
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(b.key));
        render_report(&self.stats, rows)
    }

    /// The absolute transport time of the earliest pending retransmission.
    pub fn next_deadline(&self) -> Option<i64> {
        self.ip_map.next_deadline()
    }
    pub fn connection(&self, addr: &SocketAddr) -> Option<&ConnectionState> {
        self.ip_map.try_get(addr)
    }
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionState> {
        self.ip_map.iter().map(|(_, conn)| conn)
    }
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn transport(&self) -> &T {
        &self.transport
    }
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
    pub fn sink(&self) -> &S {
        &self.sink
    }
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
    pub fn peers(&self) -> &P {
        &self.peers
    }
    pub fn peers_mut(&mut self) -> &mut P {
        &mut self.peers
    }
}

impl<T, P, S, C> Drop for TrudpSession<T, P, S, C> {
    fn drop(&mut self) {
        self.ip_map.destroy_all();
    }
}
