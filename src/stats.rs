//! Round-trip-time samples and traffic counters.
//!
//! [`ChannelStats`] lives inside each connection entry and drives the adaptive retransmit wait.
//! [`SessionStats`] aggregates the whole session for the diagnostic report.
use std::fmt;

/// Number of most recent ACK round trips remembered for `triptime_last_max`.
pub const LAST10_SIZE: usize = 10;

/// Per-peer statistics. All trip times are in microseconds.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub triptime_last: u32,
    pub triptime_min: u32,
    pub triptime_max: u32,
    pub triptime_avg: u32,
    /// Largest of the last [`LAST10_SIZE`] round trips.
    pub triptime_last_max: u32,
    /// New DATA and RESET messages sent. Retransmissions are counted in `packets_attempt`.
    pub packets_send: u32,
    pub packets_attempt: u32,
    /// DATA and RESET messages received, whatever became of them.
    pub packets_receive: u32,
    /// Received messages discarded as stale or duplicate.
    pub packets_receive_dropped: u32,
    pub ack_receive: u32,
    pub bytes_send: u64,
    pub bytes_receive: u64,
    /// The retransmit wait most recently computed for this peer, in microseconds.
    pub wait: u32,
    last_triptimes: [u32; LAST10_SIZE],
    last_idx: usize,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&mut self, payload_len: usize) {
        self.packets_send = self.packets_send.wrapping_add(1);
        self.bytes_send += payload_len as u64;
    }

    pub fn record_attempt(&mut self) {
        self.packets_attempt = self.packets_attempt.wrapping_add(1);
    }

    pub fn record_receive(&mut self, payload_len: usize) {
        self.packets_receive = self.packets_receive.wrapping_add(1);
        self.bytes_receive += payload_len as u64;
    }

    pub fn record_receive_dropped(&mut self) {
        self.packets_receive_dropped = self.packets_receive_dropped.wrapping_add(1);
    }

    /// Folds one ACK round trip into the statistics.
    ///
    /// `now` and `echoed` are 32-bit wire timestamps, so the difference is taken modulo 2^32.
    pub fn record_ack(&mut self, now: u32, echoed: u32) {
        let triptime = now.wrapping_sub(echoed);
        let count = self.ack_receive as u64;

        self.triptime_last = triptime;
        self.triptime_avg = ((self.triptime_avg as u64 * count + triptime as u64) / (count + 1)) as u32;
        if count == 0 || triptime < self.triptime_min {
            self.triptime_min = triptime;
        }
        if triptime > self.triptime_max {
            self.triptime_max = triptime;
        }

        self.last_triptimes[self.last_idx] = triptime;
        self.last_idx = (self.last_idx + 1) % LAST10_SIZE;
        self.triptime_last_max = self.last_triptimes.iter().copied().max().unwrap_or(0);

        self.ack_receive = self.ack_receive.wrapping_add(1);
    }

    /// The ring of recent round trips, oldest first, without the unfilled slots.
    pub fn last_triptimes(&self) -> impl Iterator<Item = u32> + '_ {
        let filled = (self.ack_receive as usize).min(LAST10_SIZE);
        let start = (self.last_idx + LAST10_SIZE - filled) % LAST10_SIZE;
        (0..filled).map(move |i| self.last_triptimes[(start + i) % LAST10_SIZE])
    }
}

/// Session-wide counters.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub send_list_size: usize,
    pub send_list_size_max: usize,
    pub send_list_attempts: u64,
    pub receive_heap_size: usize,
    pub receive_heap_size_max: usize,
    /// Datagrams that failed the header gates and were handed back to the caller.
    pub passthrough: u64,
    /// Valid TR-UDP datagrams dropped because the sender is not in the peer table.
    pub rejected: u64,
}

impl SessionStats {
    pub(crate) fn send_list_added(&mut self) {
        self.send_list_size += 1;
        self.send_list_size_max = self.send_list_size_max.max(self.send_list_size);
    }
    pub(crate) fn send_list_removed(&mut self, n: usize) {
        self.send_list_size = self.send_list_size.saturating_sub(n);
    }
    pub(crate) fn receive_heap_added(&mut self) {
        self.receive_heap_size += 1;
        self.receive_heap_size_max = self.receive_heap_size_max.max(self.receive_heap_size);
    }
    pub(crate) fn receive_heap_removed(&mut self, n: usize) {
        self.receive_heap_size = self.receive_heap_size.saturating_sub(n);
    }
}

/// One line of the diagnostic report.
pub struct ChannelRow<'a> {
    pub key: &'a str,
    pub peer: Option<&'a str>,
    pub stats: &'a ChannelStats,
    pub send_list: usize,
    pub receive_heap: usize,
}

fn ms(us: u32) -> f64 {
    us as f64 / 1000.0
}

/// The operator-facing statistics table.
pub struct Report<'a> {
    pub totals: &'a SessionStats,
    pub rows: Vec<ChannelRow<'a>>,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.totals;
        writeln!(f, "TR-UDP statistics")?;
        writeln!(
            f,
            "send list: {} (max {}), attempts: {}; receive heap: {} (max {}); passthrough: {}; rejected: {}",
            t.send_list_size, t.send_list_size_max, t.send_list_attempts, t.receive_heap_size, t.receive_heap_size_max, t.passthrough, t.rejected,
        )?;
        writeln!(
            f,
            "{:<22} {:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>5} {:>5}",
            "peer", "name", "send", "attempt", "recv", "dropped", "ack", "last ms", "avg ms", "min ms", "max ms", "wait ms", "sl", "rh",
        )?;
        for row in &self.rows {
            let s = row.stats;
            writeln!(
                f,
                "{:<22} {:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>5} {:>5}",
                row.key,
                row.peer.unwrap_or("-"),
                s.packets_send,
                s.packets_attempt,
                s.packets_receive,
                s.packets_receive_dropped,
                s.ack_receive,
                ms(s.triptime_last),
                ms(s.triptime_avg),
                ms(s.triptime_min),
                ms(s.triptime_max),
                ms(s.wait),
                row.send_list,
                row.receive_heap,
            )?;
        }
        Ok(())
    }
}

/// Renders the statistics table to a string.
pub fn render_report<'a>(totals: &'a SessionStats, rows: impl IntoIterator<Item = ChannelRow<'a>>) -> String {
    Report { totals, rows: rows.into_iter().collect() }.to_string()
}
