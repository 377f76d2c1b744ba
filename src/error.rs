use thiserror::Error;

/// Reasons a received datagram is not accepted as a TR-UDP message.
///
/// None of these are surfaced to the application. The session counts them and either drops the
/// datagram or hands it back to the caller as foreign traffic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Shorter than a header.
    #[error("datagram of {len} bytes is shorter than a TR-UDP header")]
    Truncated { len: usize },
    /// The payload length field disagrees with the number of bytes actually received.
    #[error("header declares {declared} payload bytes but {actual} were received")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("header checksum {stored:#04x} does not match computed {computed:#04x}")]
    Checksum { stored: u8, computed: u8 },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

/// Errors returned by the sending side of a session.
#[derive(Debug, Error)]
pub enum Error {
    /// The payload does not fit in one datagram.
    /// Nothing was recorded in the send list and no sequence number was consumed.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    /// The raw socket refused the datagram.
    /// For reliable messages the send list entry was still recorded, so the message will be
    /// retransmitted when its timer fires.
    #[error("socket send failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
