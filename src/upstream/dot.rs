//! DNS-over-TLS.
//!
//! Requests are sent over TLS connections with two-octet length framing.
//! Connections are kept after an exchange and reused by later exchanges.
//! If a reused connection fails, which happens when the server closed it
//! while it was idle, the exchange is repeated once on a new connection.

// RFC 7858 describes DNS-over-TLS.

use std::sync::Arc;

use bytes::Bytes;
use domain::base::Message;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::addr::AddressSpec;
use crate::dial::{with_timeout, DialHandler, Network};
use crate::error::Error;
use crate::options::Options;
use crate::tls::{self, ConnectionInfo};

use super::{
    is_answer, log_begin, log_finish, read_framed, write_framed, Base,
    ExchangeFuture, Upstream,
};

/// A TLS connection to the server.
type Conn = TlsStream<TcpStream>;

//------------ TlsUpstream ---------------------------------------------------

/// An upstream for DNS-over-TLS.
pub struct TlsUpstream {
    base: Base,

    /// The TLS client configuration.
    config: Arc<ClientConfig>,

    /// The name the server's certificate is checked against.
    server_name: ServerName<'static>,

    /// Connections waiting for the next exchange.
    idle: Mutex<Vec<Conn>>,
}

impl TlsUpstream {
    /// Creates a new upstream.
    pub fn new(spec: AddressSpec, opts: Options) -> Result<Self, Error> {
        let config = tls::client_config(&opts, &[], false)?;
        let server_name = tls::server_name(spec.host())?;
        Ok(TlsUpstream {
            base: Base::new(spec, opts)?,
            config,
            server_name,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Opens a new connection and runs the connection hook.
    async fn connect(&self, handler: &DialHandler) -> Result<Conn, Error> {
        let tcp = handler.dial_tcp().await?;
        let connector = TlsConnector::from(self.config.clone());
        let conn = connector.connect(self.server_name.clone(), tcp).await?;
        tls::verify_connection(
            self.base.opts(),
            &ConnectionInfo::from_client(
                self.base.spec().host(),
                conn.get_ref().1,
            ),
        )?;
        Ok(conn)
    }

    /// Exchanges on an idle connection if there is one or a new one.
    async fn exchange_pooled(
        &self,
        handler: &DialHandler,
        request: &Message<Bytes>,
    ) -> Result<Message<Bytes>, Error> {
        let idle = self.idle.lock().pop();
        if let Some(conn) = idle {
            match exchange_on(conn, request).await {
                Ok((conn, response)) => {
                    self.release(conn);
                    return Ok(response);
                }
                Err(err) => {
                    trace!(
                        "{}: idle connection failed, retrying: {err}",
                        self.base.address()
                    );
                }
            }
        }
        let conn = self.connect(handler).await?;
        let (conn, response) = exchange_on(conn, request).await?;
        self.release(conn);
        Ok(response)
    }

    /// Returns a connection to the pool unless the upstream is closed.
    fn release(&self, conn: Conn) {
        if self.base.check_open().is_ok() {
            self.idle.lock().push(conn)
        }
    }
}

impl Upstream for TlsUpstream {
    fn exchange<'a>(
        &'a self,
        request: &'a Message<Bytes>,
    ) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let handler = self.base.dial_handler().await?;
            let addr = self.base.address();
            log_begin(&addr, Network::Tcp, request);
            let res = with_timeout(
                self.base.opts().timeout(),
                self.exchange_pooled(&handler, request),
            )
            .await;
            log_finish(&addr, Network::Tcp, &res);
            res
        })
    }

    fn address(&self) -> String {
        self.base.address()
    }

    fn close(&self) -> Result<(), Error> {
        let res = self.base.close();
        self.idle.lock().clear();
        res
    }
}

/// Exchanges a request on a connection and hands the connection back.
async fn exchange_on(
    mut conn: Conn,
    request: &Message<Bytes>,
) -> Result<(Conn, Message<Bytes>), Error> {
    write_framed(&mut conn, request).await?;
    let response = read_framed(&mut conn).await?;
    if !is_answer(&response, request) {
        return Err(Error::WrongReplyForQuery);
    }
    Ok((conn, response))
}

//============ Tests =========================================================
