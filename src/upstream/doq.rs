//! DNS-over-QUIC.
//!
//! All requests share one QUIC connection to the server with a
//! bidirectional stream per request. On the stream, the request is sent
//! with two-octet length framing and message ID zero, after which the
//! sending side is finished. If the shared connection fails, a new one is
//! established once for the same request.

// RFC 9250 describes DNS-over-QUIC.

use std::any::Any;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use domain::base::Message;
use quinn::crypto::rustls::{HandshakeData, QuicClientConfig};
use quinn::{ClientConfig, Connection, Endpoint, VarInt};
use rustls::pki_types::CertificateDer;
use rustls::ProtocolVersion;
use tracing::trace;

use crate::addr::AddressSpec;
use crate::dial::{with_timeout, DialHandler, Network};
use crate::error::Error;
use crate::options::Options;
use crate::tls::{self, ConnectionInfo};

use super::{
    is_answer, log_begin, log_finish, read_framed, with_id, write_framed,
    Base, ExchangeFuture, Upstream,
};

/// The ALPN identifier of DNS-over-QUIC.
const ALPN_DOQ: &str = "doq";

/// The application error code for closing without error.
const DOQ_NO_ERROR: VarInt = VarInt::from_u32(0);

//------------ QuicUpstream --------------------------------------------------

/// An upstream for DNS-over-QUIC.
pub struct QuicUpstream {
    base: Base,

    /// The QUIC client configuration.
    config: ClientConfig,

    /// The shared connection once established.
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl QuicUpstream {
    /// Creates a new upstream.
    pub fn new(spec: AddressSpec, opts: Options) -> Result<Self, Error> {
        let config = quic_config(&opts, &[ALPN_DOQ])?;
        Ok(QuicUpstream {
            base: Base::new(spec, opts)?,
            config,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    /// Returns the shared connection, establishing it if necessary.
    async fn connection(
        &self,
        handler: &DialHandler,
    ) -> Result<Connection, Error> {
        let mut guard = self.conn.lock().await;
        if let Err(err) = self.base.check_open() {
            if let Some(conn) = guard.take() {
                conn.close(DOQ_NO_ERROR, b"");
            }
            return Err(err);
        }
        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }
        let conn = quic_connect(handler, &self.config, &self.base).await?;
        close_unless_open(&self.base, &conn)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Forgets the shared connection if it still is `conn`.
    async fn discard(&self, conn: &Connection) {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().map(Connection::stable_id) == Some(conn.stable_id())
        {
            conn.close(DOQ_NO_ERROR, b"");
            *guard = None;
        }
    }

    async fn exchange_quic(
        &self,
        handler: &DialHandler,
        request: &Message<Bytes>,
    ) -> Result<Message<Bytes>, Error> {
        let wire = with_id(request, 0)?;
        let conn = self.connection(handler).await?;
        let reply = match exchange_stream(&conn, &wire).await {
            Ok(reply) => reply,
            Err(err) => {
                trace!(
                    "{}: quic connection failed, reconnecting: {err}",
                    self.base.address()
                );
                self.discard(&conn).await;
                let conn = self.connection(handler).await?;
                exchange_stream(&conn, &wire).await?
            }
        };
        if !is_answer(&reply, &wire) {
            return Err(Error::WrongReplyForQuery);
        }
        with_id(&reply, request.header().id())
    }
}

impl Upstream for QuicUpstream {
    fn exchange<'a>(
        &'a self,
        request: &'a Message<Bytes>,
    ) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let handler = self.base.dial_handler().await?;
            let addr = self.base.address();
            log_begin(&addr, Network::Udp, request);
            let res = with_timeout(
                self.base.opts().timeout(),
                self.exchange_quic(&handler, request),
            )
            .await;
            log_finish(&addr, Network::Udp, &res);
            res
        })
    }

    fn address(&self) -> String {
        self.base.address()
    }

    fn close(&self) -> Result<(), Error> {
        let res = self.base.close();
        if let Ok(mut guard) = self.conn.try_lock() {
            if let Some(conn) = guard.take() {
                conn.close(DOQ_NO_ERROR, b"");
            }
        }
        res
    }
}

/// Sends a request on a new stream and reads the reply.
async fn exchange_stream(
    conn: &Connection,
    wire: &Message<Bytes>,
) -> Result<Message<Bytes>, Error> {
    let (mut send, mut recv) = conn.open_bi().await.map_err(Error::quic)?;
    write_framed(&mut send, wire).await?;
    send.finish().map_err(Error::quic)?;
    read_framed(&mut recv).await
}

//------------ QUIC Helpers --------------------------------------------------

/// Creates the QUIC client configuration for the options.
pub(crate) fn quic_config(
    opts: &Options,
    alpn: &[&str],
) -> Result<ClientConfig, Error> {
    let tls = tls::client_config(opts, alpn, true)?;
    let quic = QuicClientConfig::try_from(tls).map_err(Error::quic)?;
    Ok(ClientConfig::new(Arc::new(quic)))
}

/// Connects to the first address of the handler that accepts.
///
/// The connection hook and the QUIC tracer of the options are run for the
/// new connection.
pub(crate) async fn quic_connect(
    handler: &DialHandler,
    config: &ClientConfig,
    base: &Base,
) -> Result<Connection, Error> {
    let host = base.spec().host();
    if handler.addrs().is_empty() {
        return Err(Error::NoAddresses(host.into()));
    }
    let mut errors = Vec::new();
    for &addr in handler.addrs() {
        match connect_one(addr, config, host).await {
            Ok(conn) => {
                let peer = peer_certificates(&conn);
                let handshake = handshake_data(&conn);
                tls::verify_connection(
                    base.opts(),
                    &ConnectionInfo::new(
                        host,
                        &peer,
                        handshake
                            .as_ref()
                            .and_then(|data| data.protocol.as_deref()),
                        Some(ProtocolVersion::TLSv1_3),
                    ),
                )?;
                if let Some(tracer) = base.opts().quic_tracer() {
                    tracer(&conn);
                }
                return Ok(conn);
            }
            Err(err) => {
                trace!("quic connection to {addr} failed: {err}");
                errors.push(err)
            }
        }
    }
    Err(Error::join(errors).err().unwrap_or(Error::NoAddresses(host.into())))
}

/// Closes a new connection if the upstream was closed while connecting.
pub(crate) fn close_unless_open(
    base: &Base,
    conn: &Connection,
) -> Result<(), Error> {
    match base.check_open() {
        Ok(()) => Ok(()),
        Err(err) => {
            conn.close(DOQ_NO_ERROR, b"");
            Err(err)
        }
    }
}

/// Connects to a single address.
async fn connect_one(
    addr: SocketAddr,
    config: &ClientConfig,
    host: &str,
) -> Result<Connection, Error> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let endpoint = Endpoint::client(local)?;
    let connecting = endpoint
        .connect_with(config.clone(), addr, host)
        .map_err(Error::quic)?;
    connecting.await.map_err(Error::quic)
}

/// Returns the certificates the peer presented.
fn peer_certificates(conn: &Connection) -> Vec<CertificateDer<'static>> {
    conn.peer_identity()
        .and_then(|identity: Box<dyn Any>| {
            identity.downcast::<Vec<CertificateDer<'static>>>().ok()
        })
        .map(|certs| *certs)
        .unwrap_or_default()
}

/// Returns the TLS handshake data of the connection.
fn handshake_data(conn: &Connection) -> Option<HandshakeData> {
    conn.handshake_data()
        .and_then(|data: Box<dyn Any>| data.downcast::<HandshakeData>().ok())
        .map(|data| *data)
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_offers_doq() {
        assert!(quic_config(&Options::new(), &[ALPN_DOQ]).is_ok());
    }

    #[tokio::test]
    async fn unreachable_server_fails_within_timeout() {
        let mut opts = Options::new();
        opts.set_timeout(std::time::Duration::from_millis(200));

        // Nothing answers QUIC on the discard port.
        let upstream = QuicUpstream::new(
            AddressSpec::parse("quic://127.0.0.1:9", &mut opts.clone())
                .unwrap(),
            opts,
        )
        .unwrap();
        let request = Message::from_octets(Bytes::from_static(&[
            0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ]))
        .unwrap();
        assert!(upstream.exchange(&request).await.is_err());
        assert!(upstream.close().is_ok());
    }
}
