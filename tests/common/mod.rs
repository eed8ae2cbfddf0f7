//! Helpers shared by the integration tests.

#![allow(dead_code)]

pub mod tls;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use domain::base::iana::{Rcode, Rtype};
use domain::base::{Message, MessageBuilder};
use domain::rdata::A;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::EnvFilter;

/// Setup logging of events reported by the crate and the test suite.
///
/// Use the RUST_LOG environment variable to override the defaults.
///
/// E.g. To enable debug level logging:
///   RUST_LOG=DEBUG
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}

//------------ MockServer ----------------------------------------------------

/// A DNS server on localhost answering over UDP and TCP.
///
/// A queries are answered with a fixed address, everything else with an
/// empty answer.
#[derive(Clone)]
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
}

struct State {
    answer: Ipv4Addr,
    truncate_udp: bool,
    queries: Mutex<HashMap<(String, Rtype), usize>>,
    tcp_queries: Mutex<usize>,
}

impl MockServer {
    /// Starts a server answering A queries with `answer`.
    pub async fn start(answer: Ipv4Addr) -> Self {
        Self::start_with(answer, false).await
    }

    /// Starts a server that answers every UDP query with a truncated
    /// response.
    pub async fn start_truncating(answer: Ipv4Addr) -> Self {
        Self::start_with(answer, true).await
    }

    async fn start_with(answer: Ipv4Addr, truncate_udp: bool) -> Self {
        let (udp, tcp) = bind_pair().await;
        let addr = udp.local_addr().unwrap();
        let state = State::new(answer, truncate_udp);
        tokio::spawn(serve_udp(udp, state.clone()));
        tokio::spawn(serve_tcp(tcp, state.clone()));
        MockServer { addr, state }
    }

    /// Returns the address the server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns how often `name` was asked for with the given type.
    pub fn queries(&self, name: &str, qtype: Rtype) -> usize {
        self.state.queries(name, qtype)
    }

    /// Returns how many queries arrived over TCP.
    pub fn tcp_queries(&self) -> usize {
        *self.state.tcp_queries.lock()
    }
}

/// Binds a UDP socket and a TCP listener to the same local port.
async fn bind_pair() -> (UdpSocket, TcpListener) {
    loop {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = tcp.local_addr().unwrap().port();
        if let Ok(udp) = UdpSocket::bind(("127.0.0.1", port)).await {
            return (udp, tcp);
        }
    }
}

async fn serve_udp(sock: UdpSocket, state: Arc<State>) {
    let mut buf = vec![0u8; 65535];
    loop {
        let Ok((len, peer)) = sock.recv_from(&mut buf).await else {
            return;
        };
        let Some(reply) =
            state.answer(&buf[..len], state.truncate_udp)
        else {
            continue;
        };
        let _ = sock.send_to(&reply, peer).await;
    }
}

async fn serve_tcp(listener: TcpListener, state: Arc<State>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(serve_stream(stream, state.clone(), usize::MAX));
    }
}

/// Answers length-framed queries on a stream.
///
/// The stream is shut down after `limit` answers.
async fn serve_stream<S>(mut stream: S, state: Arc<State>, limit: usize)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for _ in 0..limit {
        let mut len = [0u8; 2];
        if stream.read_exact(&mut len).await.is_err() {
            return;
        }
        let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }
        *state.tcp_queries.lock() += 1;
        let Some(reply) = state.answer(&buf, false) else {
            return;
        };
        let mut out = (reply.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(&reply);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
    let _ = stream.shutdown().await;
}

impl State {
    fn new(answer: Ipv4Addr, truncate_udp: bool) -> Arc<Self> {
        Arc::new(State {
            answer,
            truncate_udp,
            queries: Mutex::new(HashMap::new()),
            tcp_queries: Mutex::new(0),
        })
    }

    /// Returns how often `name` was asked for with the given type.
    fn queries(&self, name: &str, qtype: Rtype) -> usize {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.queries.lock().get(&(name, qtype)).copied().unwrap_or(0)
    }

    /// Builds the reply to a query.
    fn answer(&self, data: &[u8], truncate: bool) -> Option<Vec<u8>> {
        let query =
            Message::from_octets(Bytes::copy_from_slice(data)).ok()?;
        let question = query.first_question()?;
        let name = question
            .qname()
            .to_string()
            .trim_end_matches('.')
            .to_ascii_lowercase();
        *self
            .queries
            .lock()
            .entry((name, question.qtype()))
            .or_default() += 1;

        let mut answer = MessageBuilder::new_vec()
            .start_answer(&query, Rcode::NOERROR)
            .ok()?;
        if truncate {
            answer.header_mut().set_tc(true);
        } else if question.qtype() == Rtype::A {
            answer
                .push((question.qname(), 60u32, A::new(self.answer)))
                .ok()?;
        }
        Some(answer.into_message().as_slice().to_vec())
    }
}

//------------ Queries -------------------------------------------------------

/// Creates a recursive query for `name`.
pub fn query(name: &str, qtype: Rtype) -> Message<Bytes> {
    query_with_id(name, qtype, rand_id())
}

/// Creates a recursive query for `name` with the given message ID.
pub fn query_with_id(name: &str, qtype: Rtype, id: u16) -> Message<Bytes> {
    use std::str::FromStr;

    let mut msg = MessageBuilder::new_bytes();
    msg.header_mut().set_id(id);
    msg.header_mut().set_rd(true);
    let mut msg = msg.question();
    msg.push((
        domain::base::Name::<Vec<u8>>::from_str(name).unwrap(),
        qtype,
    ))
    .unwrap();
    msg.into_message()
}

fn rand_id() -> u16 {
    let mut header = domain::base::Header::new();
    header.set_random_id();
    header.id()
}

/// Returns the addresses in the answer section.
pub fn answer_addrs(response: &Message<Bytes>) -> Vec<Ipv4Addr> {
    response
        .answer()
        .unwrap()
        .limit_to::<A>()
        .map(|record| record.unwrap().data().addr())
        .collect()
}
