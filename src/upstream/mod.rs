//! DNS upstreams.
//!
//! An [`Upstream`] sends a single DNS request to a server and returns the
//! response. Upstreams are created from an address with
//! [`address_to_upstream`], which picks the transport from the address:
//!
//! * [`plain`] for DNS over UDP and TCP,
//! * [`dot`] for DNS-over-TLS,
//! * [`doh`] for DNS-over-HTTPS,
//! * [`doq`] for DNS-over-QUIC,
//! * `dnscrypt` for DNSCrypt if the `dnscrypt` feature is enabled.
//!
//! Creating an upstream performs no I/O. The server's host name, if it
//! has one, is resolved on the first exchange.
//!
//! # Example
//!
//! ```no_run
//! use domain::base::iana::Rtype;
//! use domain::base::{MessageBuilder, Name};
//! use domain_upstream::{address_to_upstream, Options};
//! # use std::str::FromStr;
//!
//! # async fn f() -> Result<(), Box<dyn std::error::Error>> {
//! let mut opts = Options::new();
//! opts.set_bootstrap(["9.9.9.9:53"]);
//! let upstream = address_to_upstream("tls://dns.quad9.net", &opts)?;
//!
//! let mut msg = MessageBuilder::new_bytes();
//! msg.header_mut().set_rd(true);
//! msg.header_mut().set_random_id();
//! let mut msg = msg.question();
//! msg.push((Name::<Vec<u8>>::from_str("example.com")?, Rtype::A))?;
//!
//! let response = upstream.exchange(&msg.into_message()).await?;
//! println!("{}", response.header().rcode());
//! upstream.close()?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use domain::base::iana::Rcode;
use domain::base::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::addr::{AddressSpec, Protocol};
use crate::dial::{DialHandler, Network};
use crate::dialer::DialerInitializer;
use crate::error::Error;
use crate::options::Options;

#[cfg(feature = "dnscrypt")]
pub mod dnscrypt;
pub mod doh;
pub mod doq;
pub mod dot;
pub mod plain;

/// The future returned by [`Upstream::exchange`].
pub type ExchangeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Message<Bytes>, Error>> + Send + 'a>>;

//------------ Upstream ------------------------------------------------------

/// A DNS server reachable over one transport.
pub trait Upstream: Send + Sync {
    /// Sends a request and returns the response.
    ///
    /// The response is checked to answer the request.
    fn exchange<'a>(&'a self, request: &'a Message<Bytes>)
        -> ExchangeFuture<'a>;

    /// Returns the address of the server as `host:port`.
    fn address(&self) -> String;

    /// Releases the resources of the upstream.
    ///
    /// This includes closing the upstreams used for bootstrapping. Later
    /// exchanges fail with [`Error::Closed`].
    fn close(&self) -> Result<(), Error>;
}

impl<U: Upstream + ?Sized> Upstream for Box<U> {
    fn exchange<'a>(
        &'a self,
        request: &'a Message<Bytes>,
    ) -> ExchangeFuture<'a> {
        self.as_ref().exchange(request)
    }

    fn address(&self) -> String {
        self.as_ref().address()
    }

    fn close(&self) -> Result<(), Error> {
        self.as_ref().close()
    }
}

//------------ Construction --------------------------------------------------

/// Creates an upstream from its address.
///
/// The options are copied, so the caller's options stay unchanged even if
/// the address modifies them, which a DNS stamp or an `h3://` URL does.
pub fn address_to_upstream(
    addr: &str,
    opts: &Options,
) -> Result<Box<dyn Upstream>, Error> {
    let mut opts = opts.clone();
    let spec = AddressSpec::parse(addr, &mut opts)?;
    new_upstream(spec, opts)
}

/// Creates the upstream for a parsed address.
pub fn new_upstream(
    spec: AddressSpec,
    opts: Options,
) -> Result<Box<dyn Upstream>, Error> {
    debug!("creating {} upstream for {}", spec.protocol(), spec);
    Ok(match spec.protocol() {
        Protocol::Udp | Protocol::Tcp => {
            Box::new(plain::PlainUpstream::new(spec, opts)?)
        }
        Protocol::Tls => Box::new(dot::TlsUpstream::new(spec, opts)?),
        Protocol::Https => Box::new(doh::HttpsUpstream::new(spec, opts)?),
        Protocol::Quic => Box::new(doq::QuicUpstream::new(spec, opts)?),
        #[cfg(feature = "dnscrypt")]
        Protocol::DnsCrypt => {
            Box::new(dnscrypt::DnsCryptUpstream::new(spec, opts)?)
        }
        #[cfg(not(feature = "dnscrypt"))]
        Protocol::DnsCrypt => {
            return Err(Error::FeatureDisabled("dnscrypt"))
        }
    })
}

//------------ Base ----------------------------------------------------------

/// The parts every upstream has.
pub(crate) struct Base {
    /// The server's address.
    spec: AddressSpec,

    /// The options the upstream was created with.
    opts: Options,

    /// Provides the connections to the server.
    dialer: DialerInitializer,

    /// Whether the upstream has been closed.
    closed: AtomicBool,
}

impl Base {
    pub(crate) fn new(spec: AddressSpec, opts: Options) -> Result<Self, Error> {
        let dialer = DialerInitializer::new(&spec, &opts)?;
        Ok(Base {
            spec,
            opts,
            dialer,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn spec(&self) -> &AddressSpec {
        &self.spec
    }

    pub(crate) fn opts(&self) -> &Options {
        &self.opts
    }

    pub(crate) fn address(&self) -> String {
        self.spec.authority()
    }

    /// Fails if the upstream has been closed.
    pub(crate) fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Returns the dial handler, resolving the server if needed.
    pub(crate) async fn dial_handler(&self) -> Result<DialHandler, Error> {
        self.check_open()?;
        self.dialer.get().await
    }

    /// Marks the upstream closed and closes the bootstrap resolvers.
    ///
    /// Only the first call closes anything.
    pub(crate) fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.dialer.close()
    }
}

//------------ Diagnostics ---------------------------------------------------

/// Logs the start of an exchange.
pub(crate) fn log_begin(
    addr: &str,
    network: Network,
    request: &Message<Bytes>,
) {
    match request.first_question() {
        Some(question) => debug!(
            "{addr}: sending request over {network}: {} {}",
            question.qtype(),
            question.qname()
        ),
        None => debug!("{addr}: sending request over {network}"),
    }
}

/// Logs the result of an exchange.
pub(crate) fn log_finish(
    addr: &str,
    network: Network,
    res: &Result<Message<Bytes>, Error>,
) {
    match res {
        Ok(_) => debug!("{addr}: response received over {network}: ok"),
        Err(err) => {
            debug!("{addr}: response received over {network}: {err}")
        }
    }
}

//------------ Message Helpers -----------------------------------------------

/// Checks whether `reply` answers `query`.
///
/// Header ID and QR flag have to match and the question section has to be
/// the same. A truncated or error reply may instead have all sections
/// empty.
pub(crate) fn is_answer(reply: &Message<Bytes>, query: &Message<Bytes>) -> bool {
    let reply_header = reply.header();
    let reply_hcounts = reply.header_counts();

    if !reply_header.qr() || reply_header.id() != query.header().id() {
        return false;
    }

    if (reply_header.tc() || reply_header.rcode() != Rcode::NOERROR)
        && reply_hcounts.qdcount() == 0
        && reply_hcounts.ancount() == 0
        && reply_hcounts.nscount() == 0
        && reply_hcounts.arcount() == 0
    {
        return true;
    }

    if reply_hcounts.qdcount() != query.header_counts().qdcount() {
        false
    } else {
        reply.question() == query.question()
    }
}

/// Returns a copy of `msg` with the message ID replaced.
pub(crate) fn with_id(
    msg: &Message<Bytes>,
    id: u16,
) -> Result<Message<Bytes>, Error> {
    let mut octets = BytesMut::from(msg.as_slice());
    if octets.len() < 2 {
        return Err(Error::ShortMessage);
    }
    octets[..2].copy_from_slice(&id.to_be_bytes());
    Ok(Message::from_octets(octets.freeze())?)
}

/// Writes a message preceded by its two-octet length.
pub(crate) async fn write_framed<S>(
    stream: &mut S,
    msg: &Message<Bytes>,
) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let msg = msg.as_slice();
    let len = u16::try_from(msg.len()).map_err(|_| Error::MessageBuilder)?;
    let mut buf = Vec::with_capacity(msg.len() + 2);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(msg);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads a message preceded by its two-octet length.
pub(crate) async fn read_framed<S>(
    stream: &mut S,
) -> Result<Message<Bytes>, Error>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream.read_exact(&mut buf).await?;
    Ok(Message::from_octets(Bytes::from(buf))?)
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use domain::base::iana::Rtype;
    use domain::base::{MessageBuilder, Name};
    use std::str::FromStr;

    fn query(id: u16) -> Message<Bytes> {
        let mut msg = MessageBuilder::new_bytes();
        msg.header_mut().set_id(id);
        let mut msg = msg.question();
        msg.push((Name::<Vec<u8>>::from_str("example.com").unwrap(), Rtype::A))
            .unwrap();
        msg.into_message()
    }

    fn reply_to(query: &Message<Bytes>) -> Message<Bytes> {
        let msg = MessageBuilder::new_bytes();
        msg.start_answer(query, Rcode::NOERROR).unwrap().into_message()
    }

    #[test]
    fn answer_matching() {
        let q = query(7);
        let reply = reply_to(&q);
        assert!(is_answer(&reply, &q));
        assert!(!is_answer(&reply, &query(8)));
        assert!(!is_answer(&q, &q));
    }

    #[test]
    fn replace_id() {
        let q = query(7);
        let zero = with_id(&q, 0).unwrap();
        assert_eq!(zero.header().id(), 0);
        assert!(zero.question() == q.question());
        assert_eq!(with_id(&zero, 7).unwrap().as_slice(), q.as_slice());
    }

    #[tokio::test]
    async fn framing() {
        let q = query(1);
        let mut buf = Vec::new();
        write_framed(&mut buf, &q).await.unwrap();
        assert_eq!(buf.len(), q.as_slice().len() + 2);
        let read = read_framed(&mut buf.as_slice()).await.unwrap();
        assert_eq!(read.as_slice(), q.as_slice());
    }

    #[test]
    fn dispatch() {
        let opts = Options::new();
        for (addr, expected) in [
            ("udp://192.0.2.1", "192.0.2.1:53"),
            ("tcp://192.0.2.1:5353", "192.0.2.1:5353"),
            ("tls://192.0.2.1", "192.0.2.1:853"),
            ("https://192.0.2.1/dns-query", "192.0.2.1:443"),
            ("quic://[2001:db8::1]", "[2001:db8::1]:853"),
        ] {
            let upstream = address_to_upstream(addr, &opts).unwrap();
            assert_eq!(upstream.address(), expected);
            assert!(upstream.close().is_ok());
        }
    }

    #[tokio::test]
    async fn closed_upstream_refuses_exchange() {
        let upstream =
            address_to_upstream("192.0.2.1", &Options::new()).unwrap();
        upstream.close().unwrap();
        assert!(matches!(
            upstream.exchange(&query(1)).await,
            Err(Error::Closed)
        ));
        assert!(upstream.close().is_ok());
    }
}
