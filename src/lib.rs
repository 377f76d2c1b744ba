//! TR-UDP: reliable, per-peer ordered delivery of mesh messages over a single UDP socket.
//!
//! Every reliable message gets a per-peer sequence id and a 12-byte header, is kept in the
//! sender's send list and retransmitted on an adaptive timer until the receiver acknowledges
//! it. The receiver acknowledges every DATA it sees, holds messages that arrive early in a
//! min-heap, and hands payloads to the application strictly in id order.
//!
//! [`TrudpSession`] is the protocol core. It performs no I/O itself; the [`Transport`] it is
//! given does. The `mio` and `tokio` features add ready-made event loops that own a real socket
//! and drive a session from it.
pub mod config;
pub mod error;
pub mod header;
pub mod ip_map;
pub mod receive_heap;
pub mod send_list;
mod session;
pub mod stats;
mod transport_layer;

#[cfg(feature = "mio")]
pub mod event_loop;
#[cfg(feature = "tokio")]
pub mod tokio;

/// A TR-UDP sequence id. Each direction of each connection counts up from 0.
pub type SeqNo = u32;

pub use config::Config;
pub use error::{Error, HeaderError, Result};
pub use header::{Header, MessageType, HEADER_SIZE};
pub use session::{Received, TrudpSession};
pub use stats::{ChannelStats, SessionStats};
pub use transport_layer::*;
