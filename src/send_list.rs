//! Outgoing messages that have been sent but not yet acknowledged.
//!
//! Every DATA and RESET message sits in its peer's [`SendList`] from the moment it is first put
//! on the wire until the matching ACK arrives. Each entry owns exactly one [`RetransmitTimer`];
//! the session polls those timers from [`TrudpSession::service`](crate::TrudpSession::service)
//! and resends whatever is due under the same id.
use std::collections::BTreeMap;

use crate::config::Config;
use crate::header::{self, Header, MessageType};
use crate::stats::ChannelStats;
use crate::transport_layer::CommandId;
use crate::SeqNo;

/// Above this many resends to one peer the wait multiplier grows.
pub const ATTEMPT_BACKOFF_THRESHOLD: u32 = 10;

/// A deadline owned by its send list entry. A stopped timer has no deadline.
///
/// Stopping is idempotent, so an ACK and a reset landing in the same tick cannot conflict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetransmitTimer {
    deadline: Option<i64>,
}

impl RetransmitTimer {
    pub fn start(&mut self, now: i64, wait: u32) {
        self.deadline = Some(now + wait as i64);
    }
    pub fn stop(&mut self) {
        self.deadline = None;
    }
    #[inline]
    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
    #[inline]
    pub fn is_due(&self, now: i64) -> bool {
        self.deadline.map_or(false, |d| d <= now)
    }
}

#[derive(Clone, Debug)]
pub struct SendEntry {
    pub id: SeqNo,
    pub message_type: MessageType,
    /// The mesh command the payload carries. `None` for RESET.
    pub command: Option<CommandId>,
    /// Number of times this message has been resent.
    pub attempt: u32,
    pub payload: Vec<u8>,
    /// Wire timestamp of the most recent transmission.
    /// RESET keeps the timestamp of its first transmission so the receiver can recognise repeats.
    pub timestamp: u32,
    pub timer: RetransmitTimer,
}

impl SendEntry {
    pub fn data(id: SeqNo, command: CommandId, payload: Vec<u8>, timestamp: u32) -> Self {
        Self {
            id,
            message_type: MessageType::Data,
            command: Some(command),
            attempt: 0,
            payload,
            timestamp,
            timer: RetransmitTimer::default(),
        }
    }
    pub fn reset(id: SeqNo, timestamp: u32) -> Self {
        Self {
            id,
            message_type: MessageType::Reset,
            command: None,
            attempt: 0,
            payload: Vec::new(),
            timestamp,
            timer: RetransmitTimer::default(),
        }
    }

    /// Prepares the entry for its next transmission at `now` and returns the datagram to send.
    pub fn restamp(&mut self, now: i64) -> Vec<u8> {
        if self.message_type != MessageType::Reset {
            self.timestamp = header::timestamp(now);
        }
        self.datagram()
    }

    pub fn datagram(&self) -> Vec<u8> {
        Header::new(self.id, self.message_type, self.payload.len() as u16, self.timestamp).encode(&self.payload)
    }
}

/// Per-peer map from sequence id to the unacknowledged message carrying it.
///
/// An outstanding RESET carries an id from the sequence it ended, so it is kept apart from the
/// DATA entries of the sequence that follows it. Only one RESET is ever outstanding.
#[derive(Debug, Default)]
pub struct SendList {
    entries: BTreeMap<SeqNo, SendEntry>,
    reset: Option<SendEntry>,
}

impl SendList {
    pub fn new() -> Self {
        Self::default()
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len() + self.reset.is_some() as usize
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.reset.is_none()
    }
    /// Records a new outgoing message. An existing entry in the same slot is replaced and its
    /// timer stopped; the old entry is returned.
    pub fn insert(&mut self, entry: SendEntry) -> Option<SendEntry> {
        let mut old = match entry.message_type {
            MessageType::Reset => self.reset.replace(entry)?,
            _ => self.entries.insert(entry.id, entry)?,
        };
        old.timer.stop();
        Some(old)
    }
    /// The outstanding DATA entry carrying `id`.
    pub fn get(&self, id: SeqNo) -> Option<&SendEntry> {
        self.entries.get(&id)
    }
    pub fn get_mut(&mut self, id: SeqNo) -> Option<&mut SendEntry> {
        self.entries.get_mut(&id)
    }
    /// The outstanding RESET, if any.
    pub fn pending_reset(&self) -> Option<&SendEntry> {
        self.reset.as_ref()
    }
    /// Removes the DATA entry for an acknowledged id with its timer stopped.
    pub fn remove(&mut self, id: SeqNo) -> Option<SendEntry> {
        let mut entry = self.entries.remove(&id)?;
        entry.timer.stop();
        Some(entry)
    }
    /// Retires whatever an ACK echoing `id` and `timestamp` answers.
    ///
    /// The RESET is matched on both fields since its timestamp never changes; anything else
    /// is matched on the id alone.
    pub fn acknowledge(&mut self, id: SeqNo, timestamp: u32) -> Option<SendEntry> {
        if self.reset.as_ref().map_or(false, |r| r.id == id && r.timestamp == timestamp) {
            let mut entry = self.reset.take()?;
            entry.timer.stop();
            return Some(entry);
        }
        self.remove(id)
    }
    /// Stops every timer and drops every entry. Returns how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.len();
        for entry in self.iter_mut() {
            entry.timer.stop();
        }
        self.entries.clear();
        self.reset = None;
        n
    }
    /// Every outstanding entry, the RESET first.
    pub fn iter(&self) -> impl Iterator<Item = &SendEntry> {
        self.reset.iter().chain(self.entries.values())
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SendEntry> {
        self.reset.iter_mut().chain(self.entries.values_mut())
    }
    /// The earliest armed deadline in this list.
    pub fn next_deadline(&self) -> Option<i64> {
        self.iter().filter_map(|e| e.timer.deadline()).min()
    }
    /// Entries whose timers have fired by `now`: the RESET first, then DATA lowest id first.
    pub fn due(&mut self, now: i64) -> impl Iterator<Item = &mut SendEntry> {
        self.iter_mut().filter(move |e| e.timer.is_due(now))
    }
}

/// Computes how long to wait for an ACK from a peer before resending.
///
/// A peer with round-trip history waits for the largest of its last ten round trips scaled by
/// 1.5, or by 1.75 once it has needed [`ATTEMPT_BACKOFF_THRESHOLD`] or more resends. A peer
/// without history waits `config.default_ack_wait`. The result is clamped to
/// `[config.min_ack_wait, config.max_ack_wait]`.
pub fn ack_wait(stats: &ChannelStats, config: &Config) -> u32 {
    let wait = if stats.ack_receive > 0 && stats.triptime_last_max > 0 {
        let factor = if stats.packets_attempt < ATTEMPT_BACKOFF_THRESHOLD { 1.5 } else { 1.75 };
        (stats.triptime_last_max as f64 * factor) as u32
    } else {
        config.default_ack_wait
    };
    wait.clamp(config.min_ack_wait, config.max_ack_wait.max(config.min_ack_wait))
}
