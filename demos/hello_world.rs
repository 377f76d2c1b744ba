use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use trudp::event_loop::EventLoop;
use trudp::{Config, PacketSink};

const CMD_USER: u8 = 128;
const WORDS: [&[u8]; 4] = [b"Hello", b" ", b"World", b"!"];

#[derive(Default)]
struct Inbox(Vec<(Vec<u8>, SocketAddr)>);
impl PacketSink for Inbox {
    fn deliver(&mut self, payload: &[u8], from: SocketAddr) {
        self.0.push((payload.to_vec(), from));
    }
}

type Node = EventLoop<HashMap<SocketAddr, String>, Inbox>;

/// Prints every word that arrived and answers it with the word that follows.
/// Returns true once the last word has been seen.
fn receive(node: &mut Node) -> bool {
    node.run_once(Some(Duration::from_millis(1))).unwrap();
    let mut finished = false;
    for (payload, from) in std::mem::take(&mut node.session_mut().sink_mut().0) {
        if payload.starts_with(b"Hello world - ") {
            println!("{}", String::from_utf8_lossy(&payload[..payload.len() - 1]));
            continue;
        }
        print!("{}", String::from_utf8_lossy(&payload));
        match WORDS.iter().position(|w| *w == &payload[..]) {
            Some(i) if i + 1 < WORDS.len() => {
                node.session_mut().send_to(from, CMD_USER, WORDS[i + 1]).unwrap();
            }
            // Our Hello World exchange ends right here.
            _ => finished = true,
        }
    }
    finished
}

fn main() {
    let _ = env_logger::try_init();
    let addr1: SocketAddr = "127.0.0.1:9027".parse().unwrap();
    let addr2: SocketAddr = "127.0.0.1:9029".parse().unwrap();

    let mut peers1 = HashMap::new();
    peers1.insert(addr2, "peer2".to_string());
    let mut peers2 = HashMap::new();
    peers2.insert(addr1, "peer1".to_string());

    let mut node1 = EventLoop::bind(addr1, peers1, Inbox::default(), Config::default()).unwrap();
    let mut node2 = EventLoop::bind(addr2, peers2, Inbox::default(), Config::default()).unwrap();

    node1.session_mut().send_to(addr2, CMD_USER, b"Hello world - 1\0").unwrap();
    // We begin a "Hello World" exchange right here.
    node1.session_mut().send_to(addr2, CMD_USER, WORDS[0]).unwrap();

    let end = Instant::now() + Duration::from_secs(5);
    let mut finished = false;
    while !finished && Instant::now() < end {
        finished |= receive(&mut node2);
        finished |= receive(&mut node1);
    }
    println!();
    assert!(finished);

    // Let the final ACK reach its sender before reporting.
    node1.run_for(Duration::from_millis(20)).unwrap();
    node2.run_for(Duration::from_millis(20)).unwrap();
    print!("{}", node1.session().stats_dump());
}

#[test]
fn test() {
    main()
}
