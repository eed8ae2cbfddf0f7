//! Encrypted DNS servers on localhost.
//!
//! All servers present a self-signed certificate for [`TestCert::NAME`]
//! and answer queries the same way as [`MockServer`](super::MockServer).

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use domain::base::iana::Rtype;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Response, StatusCode, Uri, Version};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use quinn::crypto::rustls::QuicServerConfig;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use super::{serve_stream, State};

//------------ TestCert ------------------------------------------------------

/// A self-signed certificate and its key.
pub struct TestCert {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl TestCert {
    /// The name the certificate is valid for.
    pub const NAME: &'static str = "dns.test";

    pub fn new() -> Self {
        let certified =
            rcgen::generate_simple_self_signed(vec![Self::NAME.into()])
                .unwrap();
        TestCert {
            cert: certified.cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()),
        }
    }

    /// Returns the certificate.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    /// Returns a root store trusting only this certificate.
    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).unwrap();
        roots
    }

    /// Creates a server configuration offering the given protocols.
    fn server_config(&self, alpn: &[&str], tls13_only: bool) -> ServerConfig {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider);
        let builder = if tls13_only {
            builder.with_protocol_versions(&[&rustls::version::TLS13])
        } else {
            builder.with_safe_default_protocol_versions()
        };
        let mut config = builder
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![self.cert.clone()],
                self.key.clone_key().into(),
            )
            .unwrap();
        config.alpn_protocols =
            alpn.iter().map(|proto| proto.as_bytes().to_vec()).collect();
        config
    }
}

//------------ Counters ------------------------------------------------------

/// What all encrypted servers keep track of.
#[derive(Clone)]
struct Counters {
    state: Arc<State>,
    connections: Arc<AtomicUsize>,
}

impl Counters {
    fn new(answer: Ipv4Addr) -> Self {
        Counters {
            state: State::new(answer, false),
            connections: Default::default(),
        }
    }

    fn connected(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }
}

//------------ TlsServer -----------------------------------------------------

/// A DNS-over-TLS server.
pub struct TlsServer {
    addr: SocketAddr,
    counters: Counters,
}

impl TlsServer {
    /// Starts a server keeping connections open.
    pub async fn start(cert: &TestCert, answer: Ipv4Addr) -> Self {
        Self::start_with(cert, answer, usize::MAX).await
    }

    /// Starts a server closing every connection after its first answer.
    pub async fn start_closing(cert: &TestCert, answer: Ipv4Addr) -> Self {
        Self::start_with(cert, answer, 1).await
    }

    async fn start_with(
        cert: &TestCert,
        answer: Ipv4Addr,
        limit: usize,
    ) -> Self {
        let acceptor =
            TlsAcceptor::from(Arc::new(cert.server_config(&[], false)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Counters::new(answer);
        let server = counters.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server.connected();
                let acceptor = acceptor.clone();
                let state = server.state.clone();
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(stream).await {
                        serve_stream(stream, state, limit).await
                    }
                });
            }
        });
        TlsServer { addr, counters }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn queries(&self, name: &str, qtype: Rtype) -> usize {
        self.counters.state.queries(name, qtype)
    }

    /// Returns how many TCP connections were accepted.
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }
}

//------------ HttpsServer ---------------------------------------------------

/// A request as seen by [`HttpsServer`].
#[derive(Clone, Debug)]
pub struct SeenRequest {
    pub version: Version,
    pub accept: Option<String>,

    /// The message ID of the query on the wire.
    pub id: u16,
}

/// A DNS-over-HTTPS server.
///
/// HTTP/2 is used if the client negotiated it, HTTP/1.1 otherwise. With
/// [`start_h3`](Self::start_h3), the server speaks HTTP/3 over QUIC.
pub struct HttpsServer {
    addr: SocketAddr,
    counters: Counters,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

#[derive(Clone)]
struct Responder {
    counters: Counters,
    status: StatusCode,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl HttpsServer {
    /// Starts a server offering `alpn` and answering with `status`.
    ///
    /// Unless `status` is 200, the response has no body.
    pub async fn start(
        cert: &TestCert,
        answer: Ipv4Addr,
        alpn: &[&str],
        status: StatusCode,
    ) -> Self {
        let acceptor =
            TlsAcceptor::from(Arc::new(cert.server_config(alpn, false)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responder = Responder::new(answer, status);
        let server = HttpsServer {
            addr,
            counters: responder.counters.clone(),
            seen: responder.seen.clone(),
        };
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                responder.counters.connected();
                let acceptor = acceptor.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(stream).await {
                        responder.serve(stream).await
                    }
                });
            }
        });
        server
    }

    /// Starts an HTTP/3 server.
    #[cfg(feature = "http3")]
    pub async fn start_h3(cert: &TestCert, answer: Ipv4Addr) -> Self {
        let endpoint = quic_endpoint(cert, "h3");
        let addr = endpoint.local_addr().unwrap();
        let responder = Responder::new(answer, StatusCode::OK);
        let server = HttpsServer {
            addr,
            counters: responder.counters.clone(),
            seen: responder.seen.clone(),
        };
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                responder.counters.connected();
                let responder = responder.clone();
                tokio::spawn(async move {
                    if let Ok(conn) = incoming.await {
                        responder.serve_h3(conn).await
                    }
                });
            }
        });
        server
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn queries(&self, name: &str, qtype: Rtype) -> usize {
        self.counters.state.queries(name, qtype)
    }

    /// Returns how many connections were accepted.
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    /// Returns the requests received so far.
    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

impl Responder {
    fn new(answer: Ipv4Addr, status: StatusCode) -> Self {
        Responder {
            counters: Counters::new(answer),
            status,
            seen: Default::default(),
        }
    }

    async fn serve(
        self,
        stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
    ) {
        let h2 = stream.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: http::Request<Incoming>| {
            let (status, body) = self.respond(
                req.version(),
                req.uri(),
                req.headers().get(ACCEPT).and_then(|v| v.to_str().ok()),
            );
            async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .header(CONTENT_TYPE, "application/dns-message")
                        .body(Full::new(Bytes::from(body)))
                        .unwrap(),
                )
            }
        });
        if h2 {
            let _ = http2::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await;
        } else {
            let _ = http1::Builder::new().serve_connection(io, service).await;
        }
    }

    #[cfg(feature = "http3")]
    async fn serve_h3(self, conn: quinn::Connection) {
        let Ok(mut conn) =
            h3::server::Connection::<_, Bytes>::new(h3_quinn::Connection::new(
                conn,
            ))
            .await
        else {
            return;
        };
        while let Ok(Some((req, mut stream))) = conn.accept().await {
            let (status, body) = self.respond(
                req.version(),
                req.uri(),
                req.headers().get(ACCEPT).and_then(|v| v.to_str().ok()),
            );
            let response = Response::builder()
                .status(status)
                .header(CONTENT_TYPE, "application/dns-message")
                .body(())
                .unwrap();
            if stream.send_response(response).await.is_err() {
                return;
            }
            if !body.is_empty()
                && stream.send_data(Bytes::from(body)).await.is_err()
            {
                return;
            }
            let _ = stream.finish().await;
        }
    }

    /// Answers the query in the `dns` parameter of `uri`.
    fn respond(
        &self,
        version: Version,
        uri: &Uri,
        accept: Option<&str>,
    ) -> (StatusCode, Vec<u8>) {
        let wire = uri
            .query()
            .unwrap_or_default()
            .split('&')
            .find_map(|pair| pair.strip_prefix("dns="))
            .and_then(|param| URL_SAFE_NO_PAD.decode(param).ok());
        let Some(wire) = wire.filter(|wire| wire.len() >= 2) else {
            return (StatusCode::BAD_REQUEST, Vec::new());
        };
        self.seen.lock().push(SeenRequest {
            version,
            accept: accept.map(Into::into),
            id: u16::from_be_bytes([wire[0], wire[1]]),
        });
        if self.status != StatusCode::OK {
            return (self.status, Vec::new());
        }
        match self.counters.state.answer(&wire, false) {
            Some(reply) => (StatusCode::OK, reply),
            None => (StatusCode::BAD_REQUEST, Vec::new()),
        }
    }
}

//------------ QuicServer ----------------------------------------------------

/// A DNS-over-QUIC server.
pub struct QuicServer {
    addr: SocketAddr,
    counters: Counters,
    ids: Arc<Mutex<Vec<u16>>>,
}

impl QuicServer {
    /// Starts a server keeping connections open.
    pub async fn start(cert: &TestCert, answer: Ipv4Addr) -> Self {
        Self::start_with(cert, answer, usize::MAX)
    }

    /// Starts a server closing every connection after its first answer.
    pub async fn start_closing(cert: &TestCert, answer: Ipv4Addr) -> Self {
        Self::start_with(cert, answer, 1)
    }

    fn start_with(cert: &TestCert, answer: Ipv4Addr, limit: usize) -> Self {
        let endpoint = quic_endpoint(cert, "doq");
        let addr = endpoint.local_addr().unwrap();
        let counters = Counters::new(answer);
        let ids = Arc::new(Mutex::new(Vec::new()));
        let server = QuicServer {
            addr,
            counters: counters.clone(),
            ids: ids.clone(),
        };
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                counters.connected();
                let counters = counters.clone();
                let ids = ids.clone();
                tokio::spawn(async move {
                    let Ok(conn) = incoming.await else {
                        return;
                    };
                    let mut answered = 0;
                    while answered < limit {
                        let Ok((mut send, mut recv)) = conn.accept_bi().await
                        else {
                            return;
                        };
                        let mut len = [0u8; 2];
                        if recv.read_exact(&mut len).await.is_err() {
                            continue;
                        }
                        let mut buf =
                            vec![0u8; usize::from(u16::from_be_bytes(len))];
                        if recv.read_exact(&mut buf).await.is_err()
                            || buf.len() < 2
                        {
                            continue;
                        }
                        ids.lock().push(u16::from_be_bytes([buf[0], buf[1]]));
                        let Some(reply) = counters.state.answer(&buf, false)
                        else {
                            continue;
                        };
                        let mut out = (reply.len() as u16).to_be_bytes().to_vec();
                        out.extend_from_slice(&reply);
                        if send.write_all(&out).await.is_err()
                            || send.finish().is_err()
                        {
                            continue;
                        }
                        let _ = send.stopped().await;
                        answered += 1;
                    }
                    conn.close(0u32.into(), b"");
                });
            }
        });
        server
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn queries(&self, name: &str, qtype: Rtype) -> usize {
        self.counters.state.queries(name, qtype)
    }

    /// Returns how many connections were accepted.
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    /// Returns the message IDs of the queries on the wire.
    pub fn ids(&self) -> Vec<u16> {
        self.ids.lock().clone()
    }
}

/// Creates a QUIC server endpoint on localhost.
fn quic_endpoint(cert: &TestCert, alpn: &str) -> quinn::Endpoint {
    let crypto =
        QuicServerConfig::try_from(cert.server_config(&[alpn], true)).unwrap();
    let config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    quinn::Endpoint::server(config, (Ipv4Addr::LOCALHOST, 0).into()).unwrap()
}
