use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use trudp::tokio::TokioEventLoop;
use trudp::{Config, PacketSink};

const CMD_USER: u8 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Word {
    Hello,
    Space,
    World,
    Exclamation,
}
use Word::*;

impl Word {
    fn from_byte(b: u8) -> Option<Self> {
        [Hello, Space, World, Exclamation].get(b as usize).copied()
    }
    fn next(self) -> Option<Self> {
        Self::from_byte(self as u8 + 1)
    }
    fn text(self) -> &'static str {
        match self {
            Hello => "Hello",
            Space => " ",
            World => "World",
            Exclamation => "!",
        }
    }
}

#[derive(Default)]
struct Inbox(Vec<(Word, SocketAddr)>);
impl PacketSink for Inbox {
    fn deliver(&mut self, payload: &[u8], from: SocketAddr) {
        if let Some(word) = payload.first().copied().and_then(Word::from_byte) {
            self.0.push((word, from));
        }
    }
}

type Node = TokioEventLoop<HashMap<SocketAddr, String>, Inbox>;

async fn receive(node: &mut Node) -> bool {
    node.run_once(Some(Duration::from_millis(1))).await.unwrap();
    let mut finished = false;
    for (word, from) in std::mem::take(&mut node.session_mut().sink_mut().0) {
        print!("{}", word.text());
        match word.next() {
            Some(reply) => {
                node.session_mut().send_to(from, CMD_USER, &[reply as u8]).unwrap();
            }
            None => finished = true,
        }
    }
    finished
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = env_logger::try_init();
    let mut node1 = TokioEventLoop::bind("127.0.0.1:0", HashMap::new(), Inbox::default(), Config::default()).await.unwrap();
    let mut node2 = TokioEventLoop::bind("127.0.0.1:0", HashMap::new(), Inbox::default(), Config::default()).await.unwrap();
    let addr1 = node1.local_addr().unwrap();
    let addr2 = node2.local_addr().unwrap();
    node1.session_mut().peers_mut().insert(addr2, "peer2".to_string());
    node2.session_mut().peers_mut().insert(addr1, "peer1".to_string());

    node1.session_mut().send_to(addr2, CMD_USER, &[Hello as u8]).unwrap();

    let mut finished = false;
    for _ in 0..5_000 {
        finished |= receive(&mut node2).await;
        finished |= receive(&mut node1).await;
        if finished {
            break;
        }
    }
    println!();
    assert!(finished);
}

#[test]
fn test() {
    main()
}
