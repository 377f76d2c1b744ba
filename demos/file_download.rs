use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::mpsc::{channel, Receiver, Sender},
    thread,
    time::{Duration, Instant},
};

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use trudp::{Config, PacketSink, Received, Transport, TrudpSession};

const FILE_CHUNK_SIZE: usize = 1000;
const CMD_FILE: u8 = 130;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Payload {
    RequestFile { filename: String },
    ConfirmRequestFile { filename: String, filesize: u64 },
    FileDownload { filename: String, file_chunk: Vec<u8> },
}

/// A lossy in-memory link: whatever one peer sends lands in the other's channel.
struct Link {
    local: SocketAddr,
    sender: Sender<(SocketAddr, Vec<u8>)>,
    time: Instant,
}

impl Transport for Link {
    fn time(&mut self) -> i64 {
        self.time.elapsed().as_micros() as i64
    }
    fn send_to(&mut self, datagram: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        let _ = self.sender.send((self.local, datagram.to_vec()));
        Ok(datagram.len())
    }
}

#[derive(Default)]
struct Inbox(Vec<(Payload, SocketAddr)>);
impl PacketSink for Inbox {
    fn deliver(&mut self, payload: &[u8], from: SocketAddr) {
        if let Ok(p) = serde_cbor::from_slice(payload) {
            self.0.push((p, from));
        }
    }
}

struct Peer {
    filesystem: HashMap<String, Vec<u8>>,
    session: TrudpSession<Link, HashMap<SocketAddr, String>, Inbox>,
    receiver: Receiver<(SocketAddr, Vec<u8>)>,
}

fn drop_packet() -> bool {
    OsRng.next_u32() >= (u32::MAX / 4 * 3)
}

fn send(peer: &mut Peer, to: SocketAddr, payload: &Payload) {
    if let Ok(p) = serde_cbor::to_vec(payload) {
        peer.session.send_to(to, CMD_FILE, &p).unwrap();
    }
}

fn process(peer: &mut Peer) {
    use Payload::*;
    for (payload, from) in std::mem::take(&mut peer.session.sink_mut().0) {
        match payload {
            RequestFile { filename } => {
                // NOTE: in a real application you need to explicitly handle the situation where the
                // file is missing.
                if let Some(file) = peer.filesystem.get(&filename).cloned() {
                    send(peer, from, &ConfirmRequestFile { filename: filename.clone(), filesize: file.len() as u64 });
                    for chunk in file.chunks(FILE_CHUNK_SIZE) {
                        send(peer, from, &FileDownload { filename: filename.clone(), file_chunk: chunk.to_vec() });
                    }
                }
            }
            ConfirmRequestFile { filename, filesize } => {
                peer.filesystem.insert(filename, Vec::with_capacity(filesize as usize));
            }
            FileDownload { filename, file_chunk } => {
                if let Some(file) = peer.filesystem.get_mut(&filename) {
                    if file.len() + file_chunk.len() <= file.capacity() {
                        file.extend(&file_chunk);
                    }
                }
            }
        }
    }
}

fn receive(peer: &mut Peer) {
    while let Ok((from, datagram)) = peer.receiver.try_recv() {
        if drop_packet() {
            continue;
        }
        if let Received::Passthrough(_) = peer.session.recv_from(&datagram, from) {
            print!("Unexpected datagram from {}", from);
        }
    }
    process(peer);
}

fn main() {
    let addr1: SocketAddr = "10.0.0.1:9027".parse().unwrap();
    let addr2: SocketAddr = "10.0.0.2:9029".parse().unwrap();

    let mut filesystem2 = HashMap::new();
    let mut file = vec![0; 1 << 14];
    OsRng.fill_bytes(&mut file);
    filesystem2.insert("File1".to_string(), file);
    let mut file = vec![0; 1 << 16];
    OsRng.fill_bytes(&mut file);
    filesystem2.insert("File2".to_string(), file);
    let mut file = vec![0; 1 << 15];
    OsRng.fill_bytes(&mut file);
    filesystem2.insert("File3".to_string(), file);

    let (send1, recv2) = channel();
    let (send2, recv1) = channel();

    let mut peers1 = HashMap::new();
    peers1.insert(addr2, "peer2".to_string());
    let mut peers2 = HashMap::new();
    peers2.insert(addr1, "peer1".to_string());

    let mut peer1 = Peer {
        filesystem: HashMap::new(),
        session: TrudpSession::new(Link { local: addr1, sender: send1, time: Instant::now() }, peers1, Inbox::default(), Config::default()),
        receiver: recv1,
    };
    let mut peer2 = Peer {
        filesystem: filesystem2,
        session: TrudpSession::new(Link { local: addr2, sender: send2, time: Instant::now() }, peers2, Inbox::default(), Config::default()),
        receiver: recv2,
    };

    send(&mut peer1, addr2, &Payload::RequestFile { filename: "File1".to_string() });
    send(&mut peer1, addr2, &Payload::RequestFile { filename: "File3".to_string() });
    send(&mut peer1, addr2, &Payload::RequestFile { filename: "File2".to_string() });

    for _ in 0..4000 {
        receive(&mut peer1);
        receive(&mut peer2);
        if peer1.filesystem == peer2.filesystem {
            break;
        }
        thread::sleep(Duration::from_millis(1));
        peer1.session.service();
        peer2.session.service();
    }

    assert_eq!(peer1.filesystem, peer2.filesystem);
    print!("{}", peer2.session.stats_dump());
}

#[test]
fn test() {
    main()
}
