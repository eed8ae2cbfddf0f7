//! Establishing connections to an upstream server.
//!
//! A [`DialHandler`] knows the resolved addresses of one upstream server
//! and opens connections to them. It is what the bootstrap machinery
//! produces and what every transport consumes.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

use crate::error::Error;

/// How many times do we try a new random port if we get ‘address in use.’
const RETRY_RANDOM_PORT: usize = 10;

//------------ Network -------------------------------------------------------

/// The kind of connection to establish.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Network {
    /// A connected UDP socket.
    Udp,

    /// A TCP stream.
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Udp => "udp",
            Network::Tcp => "tcp",
        })
    }
}

//------------ Connection ----------------------------------------------------

/// A connection opened by a dial handler.
#[derive(Debug)]
pub enum Connection {
    /// A UDP socket connected to the server.
    Udp(UdpSocket),

    /// A TCP stream to the server.
    Tcp(TcpStream),
}

impl Connection {
    /// Returns the address of the server.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Connection::Udp(sock) => sock.peer_addr(),
            Connection::Tcp(stream) => stream.peer_addr(),
        }
    }
}

//------------ DialHandler ---------------------------------------------------

/// Opens connections to the resolved addresses of an upstream server.
///
/// The addresses are tried in order until a connection succeeds. Each
/// attempt is bounded by the timeout unless it is zero.
///
/// Cloning is cheap and all clones refer to the same handler, which can be
/// checked with [`ptr_eq`][Self::ptr_eq].
#[derive(Clone)]
pub struct DialHandler {
    inner: Arc<Inner>,
}

struct Inner {
    /// The host the addresses belong to.
    host: String,

    /// The addresses in the order they are tried.
    addrs: Vec<SocketAddr>,

    /// Timeout for each connection attempt.
    timeout: Duration,
}

impl DialHandler {
    /// Creates a new handler for the given addresses of `host`.
    pub fn new(
        host: impl Into<String>,
        addrs: Vec<SocketAddr>,
        timeout: Duration,
    ) -> Self {
        DialHandler {
            inner: Arc::new(Inner {
                host: host.into(),
                addrs,
                timeout,
            }),
        }
    }

    /// Returns the host the handler connects to.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Returns the addresses in the order they are tried.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.inner.addrs
    }

    /// Returns the timeout for each connection attempt.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Returns whether both values refer to the same handler.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Opens a connection of the given kind.
    pub async fn dial(&self, network: Network) -> Result<Connection, Error> {
        match network {
            Network::Udp => self.dial_udp().await.map(Connection::Udp),
            Network::Tcp => self.dial_tcp().await.map(Connection::Tcp),
        }
    }

    /// Opens a TCP stream to the first address that accepts one.
    pub async fn dial_tcp(&self) -> Result<TcpStream, Error> {
        self.try_addrs(Network::Tcp, TcpStream::connect).await
    }

    /// Opens a UDP socket connected to the first usable address.
    pub async fn dial_udp(&self) -> Result<UdpSocket, Error> {
        self.try_addrs(Network::Udp, |addr| async move {
            let sock = udp_bind(addr.is_ipv4()).await?;
            sock.connect(addr).await?;
            Ok(sock)
        })
        .await
    }

    /// Tries to connect to the addresses in order.
    async fn try_addrs<F, Fut, T>(
        &self,
        network: Network,
        connect: F,
    ) -> Result<T, Error>
    where
        F: Fn(SocketAddr) -> Fut,
        Fut: Future<Output = Result<T, io::Error>>,
    {
        if self.inner.addrs.is_empty() {
            return Err(Error::NoAddresses(self.inner.host.clone()));
        }
        let mut errors = Vec::new();
        for &addr in &self.inner.addrs {
            trace!("dialing {network} {addr}");
            let res = if self.inner.timeout.is_zero() {
                connect(addr).await
            } else {
                tokio::time::timeout(self.inner.timeout, connect(addr))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connection timed out",
                        ))
                    })
            };
            match res {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    trace!("dialing {network} {addr} failed: {err}");
                    errors.push(Error::Dial {
                        addr,
                        source: Arc::new(err),
                    })
                }
            }
        }
        match Error::join(errors) {
            Err(err) => Err(err),
            Ok(()) => Err(Error::NoAddresses(self.inner.host.clone())),
        }
    }
}

impl fmt::Debug for DialHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialHandler")
            .field("host", &self.inner.host)
            .field("addrs", &self.inner.addrs)
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

//------------ Helpers -------------------------------------------------------

/// Runs a future under a timeout.
///
/// A zero timeout means the future may run forever.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    if timeout.is_zero() {
        fut.await
    } else {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// Binds a UDP socket to a random local port.
async fn udp_bind(v4: bool) -> Result<UdpSocket, io::Error> {
    let mut i = 0;
    loop {
        let local: SocketAddr = if v4 {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        match UdpSocket::bind(&local).await {
            Ok(sock) => return Ok(sock),
            Err(err) => {
                if i == RETRY_RANDOM_PORT {
                    return Err(err);
                } else {
                    i += 1
                }
            }
        }
    }
}

//============ Tests =========================================================
