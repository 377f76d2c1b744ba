use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use crate::SeqNo;

/// Identifier of a mesh command, the first byte of the mesh layer's own framing.
pub type CommandId = u8;

/// Commands whose acknowledgement is reported to the application through [`PacketSink::ack`].
pub const APP_ACK_COMMANDS: std::ops::Range<CommandId> = 128..192;

/// The raw datagram socket and clock a [`TrudpSession`](crate::TrudpSession) runs on.
///
/// Implemented by the bundled event loops over real sockets, and by tests over in-memory queues
/// with a manually advanced clock.
pub trait Transport {
    /// The current time in microseconds. Only differences between readings are used, so any
    /// fixed origin will do, but it must not go backwards.
    fn time(&mut self) -> i64;

    /// Puts one datagram on the wire without blocking.
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

/// A peer the external peer table knows about.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub name: String,
    pub addr: SocketAddr,
}

/// Read-only view of the mesh's peer table.
///
/// The session asks again on every inbound datagram, so a peer removed from the table stops
/// being accepted immediately.
pub trait PeerTable {
    fn lookup(&self, addr: &SocketAddr) -> Option<PeerHandle>;
}

impl PeerTable for HashMap<SocketAddr, String> {
    fn lookup(&self, addr: &SocketAddr) -> Option<PeerHandle> {
        self.get(addr).map(|name| PeerHandle { name: name.clone(), addr: *addr })
    }
}

/// An acknowledged message whose command the application asked to hear about.
#[derive(Clone, Copy, Debug)]
pub struct AckEvent<'a> {
    pub peer: SocketAddr,
    pub id: SeqNo,
    pub command: CommandId,
    /// The payload exactly as it was originally sent.
    pub payload: &'a [u8],
}

/// Where the session hands everything that leaves it upward.
pub trait PacketSink {
    /// Called with each payload in strict per-peer id order, exactly once.
    fn deliver(&mut self, payload: &[u8], from: SocketAddr);

    #[allow(unused)]
    fn ack(&mut self, event: AckEvent<'_>) {}
    /// The message `id` was resent `max_attempts` times without an ACK and the connection to
    /// `peer` has been reset.
    #[allow(unused)]
    fn unreachable(&mut self, peer: SocketAddr, id: SeqNo) {}
    /// A valid TR-UDP datagram arrived from an address missing from the peer table and was
    /// dropped.
    #[allow(unused)]
    fn rejected(&mut self, from: SocketAddr) {}
    /// A datagram that is not TR-UDP arrived on the socket. Only called by the event loops;
    /// direct callers of `recv_from` get these back as [`Received::Passthrough`](crate::Received).
    #[allow(unused)]
    fn passthrough(&mut self, datagram: &[u8], from: SocketAddr) {}
}

/// Decides, per command, how the session treats a message.
pub trait CommandPolicy {
    /// Whether messages with this command get sequence numbers, ACKs and retransmission.
    /// Unreliable commands go straight to the socket unwrapped.
    #[allow(unused)]
    fn is_reliable(&self, command: CommandId) -> bool {
        true
    }
    fn notifies_ack(&self, command: CommandId) -> bool {
        APP_ACK_COMMANDS.contains(&command)
    }
}

/// Every command is reliable; application commands report their ACKs.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshCommands;
impl CommandPolicy for MeshCommands {}

/// A policy backed by a predicate over command ids, for meshes with unreliable command classes.
#[derive(Clone, Copy, Debug)]
pub struct ReliableIf<F>(pub F);
impl<F: Fn(CommandId) -> bool> CommandPolicy for ReliableIf<F> {
    fn is_reliable(&self, command: CommandId) -> bool {
        (self.0)(command)
    }
}
