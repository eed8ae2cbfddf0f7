//! Plain DNS over UDP and TCP.
//!
//! A UDP upstream sends each request in a single datagram. Datagrams that
//! don't answer the request are ignored. If the answer is truncated, the
//! request is repeated over TCP. A TCP upstream only ever uses TCP, with
//! one connection per request.

// RFC 1035 section 4.2 describes both transports.

use bytes::Bytes;
use domain::base::Message;

use crate::addr::{AddressSpec, Protocol};
use crate::dial::{with_timeout, DialHandler, Network};
use crate::error::Error;
use crate::options::Options;

use super::{
    is_answer, log_begin, log_finish, read_framed, write_framed, Base,
    ExchangeFuture, Upstream,
};

/// The largest datagram we are prepared to receive.
const MAX_DGRAM_SIZE: usize = 65535;

//------------ PlainUpstream -------------------------------------------------

/// An upstream for plain DNS.
pub struct PlainUpstream {
    base: Base,
}

impl PlainUpstream {
    /// Creates a new upstream.
    ///
    /// The protocol of the address decides whether UDP or TCP is used.
    pub fn new(spec: AddressSpec, opts: Options) -> Result<Self, Error> {
        Ok(PlainUpstream {
            base: Base::new(spec, opts)?,
        })
    }

    /// Returns the network the first attempt uses.
    fn network(&self) -> Network {
        match self.base.spec().protocol() {
            Protocol::Tcp => Network::Tcp,
            _ => Network::Udp,
        }
    }

    /// Performs one attempt over the given network, with logging.
    async fn attempt(
        &self,
        handler: &DialHandler,
        network: Network,
        request: &Message<Bytes>,
    ) -> Result<Message<Bytes>, Error> {
        let addr = self.base.address();
        log_begin(&addr, network, request);
        let res = with_timeout(self.base.opts().timeout(), async {
            match network {
                Network::Udp => exchange_udp(handler, request).await,
                Network::Tcp => exchange_tcp(handler, request).await,
            }
        })
        .await;
        log_finish(&addr, network, &res);
        res
    }
}

impl Upstream for PlainUpstream {
    fn exchange<'a>(
        &'a self,
        request: &'a Message<Bytes>,
    ) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let handler = self.base.dial_handler().await?;
            let network = self.network();
            let response = self.attempt(&handler, network, request).await?;
            if network == Network::Udp && response.header().tc() {
                return self.attempt(&handler, Network::Tcp, request).await;
            }
            Ok(response)
        })
    }

    fn address(&self) -> String {
        self.base.address()
    }

    fn close(&self) -> Result<(), Error> {
        self.base.close()
    }
}

//------------ Transports ----------------------------------------------------

/// Sends the request in a datagram and waits for the answer.
pub(super) async fn exchange_udp(
    handler: &DialHandler,
    request: &Message<Bytes>,
) -> Result<Message<Bytes>, Error> {
    let sock = handler.dial_udp().await?;
    sock.send(request.as_slice()).await?;
    let mut buf = vec![0u8; MAX_DGRAM_SIZE];
    loop {
        let len = sock.recv(&mut buf).await?;
        let reply = match Message::from_octets(Bytes::copy_from_slice(
            &buf[..len],
        )) {
            Ok(reply) => reply,
            Err(_) => continue,
        };
        if is_answer(&reply, request) {
            return Ok(reply);
        }
    }
}

/// Sends the request over a new TCP connection.
pub(super) async fn exchange_tcp(
    handler: &DialHandler,
    request: &Message<Bytes>,
) -> Result<Message<Bytes>, Error> {
    let mut stream = handler.dial_tcp().await?;
    write_framed(&mut stream, request).await?;
    let reply = read_framed(&mut stream).await?;
    if !is_answer(&reply, request) {
        return Err(Error::WrongReplyForQuery);
    }
    Ok(reply)
}
