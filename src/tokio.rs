use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ::tokio::net::{ToSocketAddrs, UdpSocket};
use ::tokio::time::{self, Instant};

use crate::transport_layer::{CommandPolicy, MeshCommands, PacketSink, PeerTable, Transport};
use crate::{Config, Received, TrudpSession};

const RECV_BUFFER_SIZE: usize = 1 << 16;
/// Most datagrams held back while the socket is not writable.
pub const WRITE_QUEUE_LIMIT: usize = 4096;

/// The socket half of a [`TokioEventLoop`].
///
/// Sends never wait. A datagram the socket cannot take right now is queued and written by the
/// loop once the socket reports it is writable; only a full queue is reported as an error.
pub struct TokioTransport {
    socket: Arc<UdpSocket>,
    epoch: Instant,
    write_queue: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl TokioTransport {
    /// Datagrams waiting for the socket to become writable.
    pub fn queued(&self) -> usize {
        self.write_queue.len()
    }

    fn enqueue(&mut self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.write_queue.len() >= WRITE_QUEUE_LIMIT {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        log::trace!("socket not writable, queueing {} bytes for {}", datagram.len(), addr);
        self.write_queue.push_back((addr, datagram.to_vec()));
        Ok(datagram.len())
    }

    /// Writes queued datagrams in order until the queue is empty or the socket would block.
    fn flush(&mut self) {
        while let Some((addr, datagram)) = self.write_queue.front() {
            match self.socket.try_send_to(datagram, *addr) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => log::warn!("dropping queued datagram to {}: {}", addr, e),
            }
            self.write_queue.pop_front();
        }
    }
}

impl Transport for TokioTransport {
    fn time(&mut self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if !self.write_queue.is_empty() {
            return self.enqueue(datagram, addr);
        }
        match self.socket.try_send_to(datagram, addr) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.enqueue(datagram, addr),
            res => res,
        }
    }
}

/// Drives a [`TrudpSession`] from a tokio UDP socket.
///
/// The loop is meant to live in one task; every method takes `&mut self`, so the session needs
/// no locking.
pub struct TokioEventLoop<P, S, C = MeshCommands> {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
    session: TrudpSession<TokioTransport, P, S, C>,
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(wait) => time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

impl<P: PeerTable, S: PacketSink> TokioEventLoop<P, S> {
    pub async fn bind(addr: impl ToSocketAddrs, peers: P, sink: S, config: Config) -> io::Result<Self> {
        Self::bind_with_policy(addr, peers, sink, MeshCommands, config).await
    }
}

impl<P: PeerTable, S: PacketSink, C: CommandPolicy> TokioEventLoop<P, S, C> {
    pub async fn bind_with_policy(addr: impl ToSocketAddrs, peers: P, sink: S, policy: C, config: Config) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        log::debug!("TR-UDP tokio loop bound to {}", socket.local_addr()?);
        let transport = TokioTransport { socket: socket.clone(), epoch: Instant::now(), write_queue: VecDeque::new() };
        Ok(Self {
            socket,
            buf: vec![0u8; RECV_BUFFER_SIZE],
            session: TrudpSession::with_policy(transport, peers, sink, policy, config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
    pub fn session(&self) -> &TrudpSession<TokioTransport, P, S, C> {
        &self.session
    }
    pub fn session_mut(&mut self) -> &mut TrudpSession<TokioTransport, P, S, C> {
        &mut self.session
    }

    fn handle(&mut self, len: usize, from: SocketAddr) {
        if let Received::Passthrough(datagram) = self.session.recv_from(&self.buf[..len], from) {
            self.session.sink_mut().passthrough(datagram, from);
        }
    }

    /// Waits for a datagram, the nearest retransmit deadline or, with datagrams queued, for the
    /// socket to become writable, capped at `max_wait`. Then handles everything that is ready,
    /// writes out the queue and services the session. Returns the number of datagrams read.
    pub async fn run_once(&mut self, max_wait: Option<Duration>) -> io::Result<usize> {
        self.session.transport_mut().flush();
        let queued = self.session.transport().queued() > 0;
        let now = self.session.transport_mut().time();
        let until_deadline = self
            .session
            .next_deadline()
            .map(|deadline| Duration::from_micros((deadline - now).max(0) as u64));
        let wait = match (until_deadline, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let first = ::tokio::select! {
            res = self.socket.recv_from(&mut self.buf) => Some(res?),
            res = self.socket.writable(), if queued => {
                res?;
                None
            }
            _ = sleep_or_pending(wait) => None,
        };

        let mut received = 0;
        if let Some((len, from)) = first {
            received += 1;
            self.handle(len, from);
            loop {
                match self.socket.try_recv_from(&mut self.buf) {
                    Ok((len, from)) => {
                        received += 1;
                        self.handle(len, from);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::debug!("try_recv_from error: {}", e);
                        break;
                    }
                }
            }
        }

        self.session.transport_mut().flush();
        self.session.service();
        Ok(received)
    }

    /// Keeps turning the loop until `duration` has passed.
    pub async fn run_for(&mut self, duration: Duration) -> io::Result<()> {
        let end = Instant::now() + duration;
        loop {
            let left = end.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            self.run_once(Some(left)).await?;
        }
    }

    /// Keeps turning the loop until `done` returns true or `timeout` passes.
    /// Returns whether `done` was satisfied.
    pub async fn run_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&TrudpSession<TokioTransport, P, S, C>) -> bool,
    ) -> io::Result<bool> {
        let end = Instant::now() + timeout;
        loop {
            if done(&self.session) {
                return Ok(true);
            }
            let left = end.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            self.run_once(Some(left)).await?;
        }
    }
}
