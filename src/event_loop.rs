//! A single-threaded event loop that owns one non-blocking UDP socket and drives a
//! [`TrudpSession`] from it.
//!
//! Each turn waits for the socket to become readable or for the nearest retransmit deadline,
//! whichever comes first, feeds every pending datagram to the session, then lets the session
//! resend whatever is due.
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::transport_layer::{CommandPolicy, MeshCommands, PacketSink, PeerTable, Transport};
use crate::{Config, Received, TrudpSession};

const SOCKET: Token = Token(0);
/// Large enough for any UDP datagram, so foreign traffic is passed through whole.
const RECV_BUFFER_SIZE: usize = 1 << 16;

/// The socket half of an [`EventLoop`], shared with the loop that reads from it.
pub struct UdpTransport {
    socket: Rc<UdpSocket>,
    epoch: Instant,
}

impl Transport for UdpTransport {
    fn time(&mut self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(datagram, addr)
    }
}

pub struct EventLoop<P, S, C = MeshCommands> {
    poll: Poll,
    events: Events,
    socket: Rc<UdpSocket>,
    buf: Vec<u8>,
    session: TrudpSession<UdpTransport, P, S, C>,
}

impl<P: PeerTable, S: PacketSink> EventLoop<P, S> {
    /// Binds a UDP socket to `addr` and builds a session on top of it.
    pub fn bind(addr: SocketAddr, peers: P, sink: S, config: Config) -> io::Result<Self> {
        Self::bind_with_policy(addr, peers, sink, MeshCommands, config)
    }
}

impl<P: PeerTable, S: PacketSink, C: CommandPolicy> EventLoop<P, S, C> {
    pub fn bind_with_policy(addr: SocketAddr, peers: P, sink: S, policy: C, config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(addr)?;
        poll.registry().register(&mut socket, SOCKET, Interest::READABLE)?;
        let socket = Rc::new(socket);
        log::debug!("TR-UDP event loop bound to {}", socket.local_addr()?);

        let transport = UdpTransport { socket: socket.clone(), epoch: Instant::now() };
        Ok(Self {
            poll,
            events: Events::with_capacity(16),
            socket,
            buf: vec![0u8; RECV_BUFFER_SIZE],
            session: TrudpSession::with_policy(transport, peers, sink, policy, config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
    pub fn session(&self) -> &TrudpSession<UdpTransport, P, S, C> {
        &self.session
    }
    pub fn session_mut(&mut self) -> &mut TrudpSession<UdpTransport, P, S, C> {
        &mut self.session
    }

    /// Runs one turn of the loop, waiting at most `max_wait` (forever if `None`) when nothing
    /// is due sooner. Returns the number of datagrams read.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> io::Result<usize> {
        let now = self.session.transport_mut().time();
        let until_deadline = self
            .session
            .next_deadline()
            .map(|deadline| Duration::from_micros((deadline - now).max(0) as u64));
        let timeout = match (until_deadline, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e);
            }
        }

        let mut received = 0;
        if self.events.iter().any(|event| event.token() == SOCKET) {
            // Readiness is edge-triggered, so read until the socket is empty.
            loop {
                let (len, from) = match self.socket.recv_from(&mut self.buf) {
                    Ok(r) => r,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("recv_from error: {}", e);
                        break;
                    }
                };
                received += 1;
                if let Received::Passthrough(datagram) = self.session.recv_from(&self.buf[..len], from) {
                    self.session.sink_mut().passthrough(datagram, from);
                }
            }
        }

        self.session.service();
        Ok(received)
    }

    /// Keeps turning the loop until `duration` has passed.
    pub fn run_for(&mut self, duration: Duration) -> io::Result<()> {
        let end = Instant::now() + duration;
        while let Some(left) = end.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) {
            self.run_once(Some(left))?;
        }
        Ok(())
    }

    /// Keeps turning the loop until `done` returns true or `timeout` passes.
    /// Returns whether `done` was satisfied.
    pub fn run_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&TrudpSession<UdpTransport, P, S, C>) -> bool,
    ) -> io::Result<bool> {
        let end = Instant::now() + timeout;
        loop {
            if done(&self.session) {
                return Ok(true);
            }
            match end.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => {
                    self.run_once(Some(left))?;
                }
                _ => return Ok(false),
            }
        }
    }
}
