//! DNS-over-HTTPS.
//!
//! Requests are sent as GET requests with the message in the `dns` query
//! parameter, encoded in URL-safe base64 without padding. The message ID
//! is set to zero for better caching and restored in the response.
//!
//! The HTTP version is negotiated through ALPN from the versions in the
//! options. HTTP/2 connections are shared between requests. HTTP/1.1
//! connections are used for one request only. HTTP/3 is available with
//! the `http3` feature and used if it is the only version configured, as
//! with an `h3://` address.

// RFC 8484 describes DNS-over-HTTPS.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use domain::base::Message;
use http::header::{ACCEPT, HOST};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::addr::AddressSpec;
use crate::dial::{with_timeout, DialHandler, Network};
use crate::error::Error;
use crate::options::{HttpVersion, Options};
use crate::tls::{self, ConnectionInfo};

use super::{
    is_answer, log_begin, log_finish, with_id, Base, ExchangeFuture,
    Upstream,
};

/// The media type of DNS messages.
const DNS_MESSAGE: &str = "application/dns-message";

//------------ HttpsUpstream -------------------------------------------------

/// An upstream for DNS-over-HTTPS.
pub struct HttpsUpstream {
    base: Base,

    /// The HTTP versions negotiated over TLS.
    versions: Vec<HttpVersion>,

    /// The TLS configuration for HTTP/1.1 and HTTP/2.
    config: Option<Arc<ClientConfig>>,

    /// The name the server's certificate is checked against.
    server_name: ServerName<'static>,

    /// The shared HTTP/2 connection.
    h2: Mutex<Option<http2::SendRequest<Empty<Bytes>>>>,

    /// HTTP/3 state.
    #[cfg(feature = "http3")]
    h3: http3::Http3,
}

impl HttpsUpstream {
    /// Creates a new upstream.
    pub fn new(spec: AddressSpec, opts: Options) -> Result<Self, Error> {
        let versions: Vec<_> = opts
            .http_versions()
            .iter()
            .copied()
            .filter(|version| *version != HttpVersion::Http3)
            .collect();
        let config = if !versions.is_empty() {
            let alpn: Vec<_> = versions.iter().map(|v| v.alpn()).collect();
            Some(tls::client_config(&opts, &alpn, false)?)
        } else if cfg!(feature = "http3") {
            None
        } else {
            return Err(Error::FeatureDisabled("http3"));
        };
        let server_name = tls::server_name(spec.host())?;
        #[cfg(feature = "http3")]
        let h3 = http3::Http3::new(&opts)?;
        Ok(HttpsUpstream {
            base: Base::new(spec, opts)?,
            versions,
            config,
            server_name,
            h2: Mutex::new(None),
            #[cfg(feature = "http3")]
            h3,
        })
    }

    /// Returns the path and query of the request URI.
    fn path_and_query(&self, wire: &Message<Bytes>) -> String {
        let path = match self.base.spec().path() {
            "" => "/",
            path => path,
        };
        format!("{path}?dns={}", URL_SAFE_NO_PAD.encode(wire.as_slice()))
    }

    /// Returns the network used for logging.
    fn network(&self) -> Network {
        if self.config.is_some() {
            Network::Tcp
        } else {
            Network::Udp
        }
    }

    async fn exchange_https(
        &self,
        handler: &DialHandler,
        request: &Message<Bytes>,
    ) -> Result<Message<Bytes>, Error> {
        let wire = with_id(request, 0)?;
        let path = self.path_and_query(&wire);
        let authority = self.base.address();

        let (status, body) = match &self.config {
            Some(config) => {
                self.send_tcp(handler, config, &authority, &path).await?
            }
            #[cfg(feature = "http3")]
            None => {
                self.h3
                    .send(handler, &self.base, &authority, &path)
                    .await?
            }
            #[cfg(not(feature = "http3"))]
            None => return Err(Error::FeatureDisabled("http3")),
        };
        if status != StatusCode::OK {
            return Err(Error::HttpStatus(status));
        }
        let reply = Message::from_octets(body)?;
        if !is_answer(&reply, &wire) {
            return Err(Error::WrongReplyForQuery);
        }
        with_id(&reply, request.header().id())
    }

    /// Sends the request over HTTP/1.1 or HTTP/2.
    async fn send_tcp(
        &self,
        handler: &DialHandler,
        config: &Arc<ClientConfig>,
        authority: &str,
        path: &str,
    ) -> Result<(StatusCode, Bytes), Error> {
        let cached = self.h2.lock().clone();
        if let Some(sender) = cached {
            if !sender.is_closed() {
                match send_h2(sender, authority, path).await {
                    Ok(res) => return Ok(res),
                    Err(err) => {
                        trace!("{authority}: shared connection failed: {err}")
                    }
                }
            }
            *self.h2.lock() = None;
        }

        match self.connect(handler, config).await? {
            Sender::Http1(mut sender) => {
                let request = Request::get(path)
                    .header(HOST, authority)
                    .header(ACCEPT, DNS_MESSAGE)
                    .body(Empty::new())?;
                sender.ready().await?;
                let response = sender.send_request(request).await?;
                let status = response.status();
                let body = response.into_body().collect().await?.to_bytes();
                Ok((status, body))
            }
            Sender::Http2(sender) => {
                *self.h2.lock() = Some(sender.clone());
                send_h2(sender, authority, path).await
            }
        }
    }

    /// Opens a new connection.
    async fn connect(
        &self,
        handler: &DialHandler,
        config: &Arc<ClientConfig>,
    ) -> Result<Sender, Error> {
        let tcp = handler.dial_tcp().await?;
        let connector = TlsConnector::from(config.clone());
        let stream = connector.connect(self.server_name.clone(), tcp).await?;
        let info = ConnectionInfo::from_client(
            self.base.spec().host(),
            stream.get_ref().1,
        );
        tls::verify_connection(self.base.opts(), &info)?;

        let use_h2 = match stream.get_ref().1.alpn_protocol() {
            Some(alpn) => alpn == HttpVersion::Http2.alpn().as_bytes(),
            None => !self.versions.contains(&HttpVersion::Http11),
        };
        let addr = self.base.address();
        if use_h2 {
            let (sender, conn) =
                http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                    .await?;
            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    debug!("{addr}: http/2 connection closed: {err}");
                }
            });
            Ok(Sender::Http2(sender))
        } else {
            let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    debug!("{addr}: http/1.1 connection closed: {err}");
                }
            });
            Ok(Sender::Http1(sender))
        }
    }
}

impl Upstream for HttpsUpstream {
    fn exchange<'a>(
        &'a self,
        request: &'a Message<Bytes>,
    ) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let handler = self.base.dial_handler().await?;
            let addr = self.base.address();
            let network = self.network();
            log_begin(&addr, network, request);
            let res = with_timeout(
                self.base.opts().timeout(),
                self.exchange_https(&handler, request),
            )
            .await;
            log_finish(&addr, network, &res);
            res
        })
    }

    fn address(&self) -> String {
        self.base.address()
    }

    fn close(&self) -> Result<(), Error> {
        let res = self.base.close();
        self.h2.lock().take();
        #[cfg(feature = "http3")]
        self.h3.close();
        res
    }
}

//------------ Sender --------------------------------------------------------

/// The sending half of a new connection.
enum Sender {
    Http1(http1::SendRequest<Empty<Bytes>>),
    Http2(http2::SendRequest<Empty<Bytes>>),
}

/// Sends a request over HTTP/2.
async fn send_h2(
    mut sender: http2::SendRequest<Empty<Bytes>>,
    authority: &str,
    path: &str,
) -> Result<(StatusCode, Bytes), Error> {
    let request = Request::get(format!("https://{authority}{path}"))
        .header(ACCEPT, DNS_MESSAGE)
        .body(Empty::new())?;
    sender.ready().await?;
    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, body))
}

//------------ HTTP/3 --------------------------------------------------------

#[cfg(feature = "http3")]
mod http3 {
    use bytes::{BufMut, Bytes, BytesMut};
    use futures_util::future;
    use h3::client::SendRequest;
    use http::header::ACCEPT;
    use http::{Request, StatusCode};
    use quinn::ClientConfig;

    use super::super::doq::{close_unless_open, quic_config, quic_connect};
    use super::super::Base;
    use super::DNS_MESSAGE;
    use crate::dial::DialHandler;
    use crate::error::Error;
    use crate::options::{HttpVersion, Options};
    use tracing::debug;

    type H3Sender = SendRequest<h3_quinn::OpenStreams, Bytes>;

    /// The HTTP/3 state of an upstream.
    pub(super) struct Http3 {
        config: ClientConfig,
        sender: tokio::sync::Mutex<Option<H3Sender>>,
    }

    impl Http3 {
        pub(super) fn new(opts: &Options) -> Result<Self, Error> {
            Ok(Http3 {
                config: quic_config(opts, &[HttpVersion::Http3.alpn()])?,
                sender: tokio::sync::Mutex::new(None),
            })
        }

        /// Sends a request, connecting first if necessary.
        pub(super) async fn send(
            &self,
            handler: &DialHandler,
            base: &Base,
            authority: &str,
            path: &str,
        ) -> Result<(StatusCode, Bytes), Error> {
            let mut guard = self.sender.lock().await;
            if let Err(err) = base.check_open() {
                guard.take();
                return Err(err);
            }
            let mut sender = match guard.as_ref() {
                Some(sender) => sender.clone(),
                None => {
                    let conn =
                        quic_connect(handler, &self.config, base).await?;
                    close_unless_open(base, &conn)?;
                    let (mut driver, sender) =
                        h3::client::new(h3_quinn::Connection::new(conn))
                            .await
                            .map_err(Error::http)?;
                    let addr = authority.to_string();
                    tokio::spawn(async move {
                        let res =
                            future::poll_fn(|cx| driver.poll_close(cx)).await;
                        if let Err(err) = res {
                            debug!("{addr}: http/3 connection closed: {err}");
                        }
                    });
                    *guard = Some(sender.clone());
                    sender
                }
            };
            drop(guard);

            let res = send(&mut sender, authority, path).await;
            if res.is_err() {
                self.sender.lock().await.take();
            }
            res
        }

        pub(super) fn close(&self) {
            if let Ok(mut guard) = self.sender.try_lock() {
                guard.take();
            }
        }
    }

    async fn send(
        sender: &mut H3Sender,
        authority: &str,
        path: &str,
    ) -> Result<(StatusCode, Bytes), Error> {
        let request = Request::get(format!("https://{authority}{path}"))
            .header(ACCEPT, DNS_MESSAGE)
            .body(())?;
        let mut stream =
            sender.send_request(request).await.map_err(Error::http)?;
        stream.finish().await.map_err(Error::http)?;
        let response = stream.recv_response().await.map_err(Error::http)?;
        let mut body = BytesMut::new();
        while let Some(chunk) =
            stream.recv_data().await.map_err(Error::http)?
        {
            body.put(chunk);
        }
        Ok((response.status(), body.freeze()))
    }
}

//============ Tests =========================================================
