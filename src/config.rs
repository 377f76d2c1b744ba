use crate::header::HEADER_SIZE;

/// Largest datagram the session will put on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

pub const DEFAULT_ACK_WAIT_US: u32 = 500_000;
pub const MIN_ACK_WAIT_US: u32 = 732;
pub const MAX_ACK_WAIT_US: u32 = 10_000_000;

/// Tunables of a [`TrudpSession`](crate::TrudpSession).
///
/// All durations are in microseconds, the unit of [`Transport::time`](crate::Transport::time).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Retransmit wait used for a peer that has not acknowledged anything yet.
    pub default_ack_wait: u32,
    /// Lower bound of the adaptive retransmit wait.
    pub min_ack_wait: u32,
    /// Upper bound of the adaptive retransmit wait.
    pub max_ack_wait: u32,
    /// Largest payload `send_to` accepts. Must not exceed `MAX_DATAGRAM_SIZE - HEADER_SIZE`.
    pub max_payload: usize,
    /// Number of resends after which a peer is declared unreachable and its connection reset.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Accept TR-UDP traffic from addresses the peer table does not know.
    pub accept_unregistered: bool,
    /// Treat DATA with id 0 from a peer that is further along as a restart of that peer.
    pub reset_on_restart: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_ack_wait: DEFAULT_ACK_WAIT_US,
            min_ack_wait: MIN_ACK_WAIT_US,
            max_ack_wait: MAX_ACK_WAIT_US,
            max_payload: MAX_DATAGRAM_SIZE - HEADER_SIZE,
            max_attempts: None,
            accept_unregistered: false,
            reset_on_restart: false,
        }
    }
}

impl Config {
    /// `max_payload` clamped to what fits in one datagram and in the header's length field.
    pub fn payload_limit(&self) -> usize {
        self.max_payload.min(MAX_DATAGRAM_SIZE - HEADER_SIZE).min(u16::MAX as usize)
    }
}
