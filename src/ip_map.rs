//! The connection state store: everything the session knows about each remote address.
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::receive_heap::ReceiveHeap;
use crate::send_list::SendList;
use crate::stats::ChannelStats;
use crate::transport_layer::PeerHandle;
use crate::SeqNo;

/// The `"ip:port"` key a connection is stored under.
pub fn addr_key(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

#[derive(Debug)]
pub struct ConnectionState {
    pub addr: SocketAddr,
    /// Id the next new DATA or RESET to this peer will carry.
    pub next_send_id: SeqNo,
    /// Id of the next DATA from this peer that can be delivered.
    pub expected_id: SeqNo,
    pub send_list: SendList,
    pub receive_heap: ReceiveHeap,
    pub stats: ChannelStats,
    /// The peer table's answer at the last inbound datagram. Refreshed on every receive, never
    /// trusted across receives.
    pub peer: Option<PeerHandle>,
    /// Transport time of the last datagram sent to or received from this peer.
    pub last_activity: i64,
    /// Wire timestamp of the last RESET applied from this peer. Survives resets.
    pub last_reset: Option<u32>,
}

/// How much a reset threw away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cleared {
    pub send_list: usize,
    pub receive_heap: usize,
}

impl std::ops::AddAssign for Cleared {
    fn add_assign(&mut self, rhs: Self) {
        self.send_list += rhs.send_list;
        self.receive_heap += rhs.receive_heap;
    }
}

impl ConnectionState {
    pub fn new(addr: SocketAddr, now: i64) -> Self {
        Self {
            addr,
            next_send_id: 0,
            expected_id: 0,
            send_list: SendList::new(),
            receive_heap: ReceiveHeap::new(),
            stats: ChannelStats::new(),
            peer: None,
            last_activity: now,
            last_reset: None,
        }
    }

    /// Takes the next outgoing id.
    pub fn allocate_id(&mut self) -> SeqNo {
        let id = self.next_send_id;
        self.next_send_id = self.next_send_id.wrapping_add(1);
        id
    }

    /// Stops every retransmit timer, empties both queues, restarts both counters at 0 and
    /// starts fresh statistics.
    pub fn reset(&mut self) -> Cleared {
        let cleared = Cleared { send_list: self.send_list.clear(), receive_heap: self.receive_heap.clear() };
        self.next_send_id = 0;
        self.expected_id = 0;
        self.stats = ChannelStats::new();
        cleared
    }
}

/// Connection state keyed by peer address.
#[derive(Debug, Default)]
pub struct IpMap {
    map: HashMap<String, ConnectionState>,
}

impl IpMap {
    pub fn new() -> Self {
        Self::default()
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get_or_create(&mut self, addr: &SocketAddr, now: i64) -> &mut ConnectionState {
        self.map.entry(addr_key(addr)).or_insert_with_key(|key| {
            log::debug!("new TR-UDP connection {}", key);
            ConnectionState::new(*addr, now)
        })
    }
    /// Lookup that never creates an entry.
    pub fn try_get(&self, addr: &SocketAddr) -> Option<&ConnectionState> {
        self.map.get(&addr_key(addr))
    }
    pub fn try_get_mut(&mut self, addr: &SocketAddr) -> Option<&mut ConnectionState> {
        self.map.get_mut(&addr_key(addr))
    }

    /// Resets the connection to `addr`, and removes it from the map as well if `remove` is set.
    /// Returns `None` if no connection to `addr` exists.
    pub fn reset(&mut self, addr: &SocketAddr, remove: bool) -> Option<Cleared> {
        let key = addr_key(addr);
        let cleared = self.map.get_mut(&key)?.reset();
        if remove {
            self.map.remove(&key);
        }
        log::debug!("reset TR-UDP connection {} (remove: {})", key, remove);
        Some(cleared)
    }

    /// Resets and removes every connection.
    pub fn destroy_all(&mut self) -> Cleared {
        let mut total = Cleared::default();
        for (_, mut conn) in self.map.drain() {
            total += conn.reset();
        }
        total
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConnectionState)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionState> {
        self.map.values_mut()
    }

    /// The earliest retransmit deadline across every connection.
    pub fn next_deadline(&self) -> Option<i64> {
        self.map.values().filter_map(|c| c.send_list.next_deadline()).min()
    }
}
