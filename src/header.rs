//! The fixed-size TR-UDP header that prefixes every datagram handled by this crate.
//!
//! ```text
//! byte 0      : checksum (u8)
//! byte 1      : version (low 4 bits) | message type (high 4 bits)
//! bytes 2-3   : payload length (u16, big-endian)
//! bytes 4-7   : id (u32, big-endian)
//! bytes 8-11  : timestamp (u32, big-endian)
//! bytes 12..  : payload, DATA only
//! ```
//!
//! The checksum is the truncated 8-bit sum of header bytes 1 through 11.
use crate::error::HeaderError;
use crate::SeqNo;

/// Size in bytes of an encoded [`Header`].
pub const HEADER_SIZE: usize = 12;
/// Protocol version written into every header and required of every received header.
pub const PROTOCOL_VERSION: u8 = 1;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Carries a payload and must be acknowledged.
    Data = 0,
    /// Zero-payload acknowledgement. Echoes the id and timestamp of what it acknowledges.
    Ack = 1,
    /// Zero-payload request to restart both sequence counters of a connection.
    Reset = 2,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> Result<Self, HeaderError> {
        match bits {
            0 => Ok(MessageType::Data),
            1 => Ok(MessageType::Ack),
            2 => Ok(MessageType::Reset),
            other => Err(HeaderError::UnknownType(other)),
        }
    }
    /// DATA and RESET are the message types that sit in a send list until acknowledged.
    pub fn is_reliable(self) -> bool {
        !matches!(self, MessageType::Ack)
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub checksum: u8,
    pub version: u8,
    pub message_type: MessageType,
    pub payload_length: u16,
    pub id: SeqNo,
    pub timestamp: u32,
}

impl Header {
    /// Builds a header for the current protocol version with a valid checksum.
    pub fn new(id: SeqNo, message_type: MessageType, payload_length: u16, timestamp: u32) -> Self {
        let mut header = Header {
            checksum: 0,
            version: PROTOCOL_VERSION,
            message_type,
            payload_length,
            id,
            timestamp,
        };
        header.checksum = checksum(&header.to_bytes());
        header
    }

    /// The ACK that answers this header: same id and timestamp, no payload.
    pub fn to_ack(&self) -> Self {
        Header::new(self.id, MessageType::Ack, 0, self.timestamp)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.checksum;
        buf[1] = (self.version & 0x0F) | ((self.message_type as u8) << 4);
        buf[2..4].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    /// Writes the header followed by `payload` into a freshly allocated datagram.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(HEADER_SIZE + payload.len());
        datagram.extend_from_slice(&self.to_bytes());
        datagram.extend_from_slice(payload);
        datagram
    }

    /// Parses the header fields without checking the checksum or the payload length.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated { len: buf.len() });
        }
        Ok(Header {
            checksum: buf[0],
            version: buf[1] & 0x0F,
            message_type: MessageType::from_bits(buf[1] >> 4)?,
            payload_length: u16::from_be_bytes([buf[2], buf[3]]),
            id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            timestamp: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Sum of every header byte except the checksum byte itself, truncated to 8 bits.
pub fn checksum(header: &[u8; HEADER_SIZE]) -> u8 {
    header[1..].iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Validates a whole received datagram and splits it into header and payload.
///
/// The length gate runs before the checksum gate, and both run before the message type is
/// interpreted, so foreign traffic on the socket is rejected as cheaply as possible.
pub fn verify_and_decode(datagram: &[u8]) -> Result<(Header, &[u8]), HeaderError> {
    if datagram.len() < HEADER_SIZE {
        return Err(HeaderError::Truncated { len: datagram.len() });
    }
    let declared = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
    let actual = datagram.len() - HEADER_SIZE;
    if declared != actual {
        return Err(HeaderError::LengthMismatch { declared, actual });
    }
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&datagram[..HEADER_SIZE]);
    let computed = checksum(&raw);
    if raw[0] != computed {
        return Err(HeaderError::Checksum { stored: raw[0], computed });
    }
    let header = Header::decode(&raw)?;
    if header.version != PROTOCOL_VERSION {
        return Err(HeaderError::UnsupportedVersion(header.version));
    }
    Ok((header, &datagram[HEADER_SIZE..]))
}

/// Truncates a microsecond clock reading to the 32-bit wire timestamp.
#[inline]
pub fn timestamp(time_us: i64) -> u32 {
    time_us as u32
}
