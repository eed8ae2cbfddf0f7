//! Configuration of upstreams.
//!
//! All upstreams are configured through a single [`Options`] value. The
//! fields are independent of each other and all of them have a sensible
//! default, so `Options::default()` gives a working configuration that
//! uses the system resolver for bootstrapping and no timeouts.

#![warn(missing_docs)]

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::{CipherSuite, RootCertStore};

use crate::error::{BoxError, Error};
use crate::tls::ConnectionInfo;

#[cfg(feature = "dnscrypt")]
use crate::upstream::dnscrypt::Cert;

//------------ Hooks ---------------------------------------------------------

/// A hook inspecting the certificates presented by a TLS server.
///
/// The certificates are passed end-entity first. If certificate
/// verification is disabled, the hook is the only check performed.
pub type VerifyServerCertificate = Arc<
    dyn Fn(&[CertificateDer<'_>]) -> Result<(), BoxError> + Send + Sync,
>;

/// A hook inspecting a TLS connection after its handshake.
pub type VerifyConnection =
    Arc<dyn Fn(&ConnectionInfo<'_>) -> Result<(), BoxError> + Send + Sync>;

/// A hook inspecting the certificate of a DNSCrypt resolver.
///
/// Any error returned here is returned by the exchange that fetched the
/// certificate.
#[cfg(feature = "dnscrypt")]
pub type VerifyDnsCryptCertificate =
    Arc<dyn Fn(&Cert) -> Result<(), BoxError> + Send + Sync>;

/// A hook called for every new QUIC connection.
///
/// It receives the connection right after the handshake and may keep it
/// to observe its statistics.
pub type QuicTracer = Arc<dyn Fn(&quinn::Connection) + Send + Sync>;

//------------ HttpVersion ---------------------------------------------------

/// The HTTP versions a DNS-over-HTTPS upstream may use.
///
/// The textual representations are also the ALPN identifiers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HttpVersion {
    /// HTTP/1.1.
    Http11,

    /// HTTP/2.
    Http2,

    /// HTTP/3.
    Http3,
}

/// The HTTP versions used by DNS-over-HTTPS unless configured otherwise.
pub const DEFAULT_HTTP_VERSIONS: [HttpVersion; 2] =
    [HttpVersion::Http11, HttpVersion::Http2];

impl HttpVersion {
    /// Returns the ALPN identifier of the version.
    pub fn alpn(self) -> &'static str {
        match self {
            HttpVersion::Http11 => "http/1.1",
            HttpVersion::Http2 => "h2",
            HttpVersion::Http3 => "h3",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alpn())
    }
}

impl FromStr for HttpVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http/1.1" => Ok(HttpVersion::Http11),
            "h2" => Ok(HttpVersion::Http2),
            "h3" => Ok(HttpVersion::Http3),
            _ => Err(Error::malformed(s, "unknown HTTP version")),
        }
    }
}

//------------ Options -------------------------------------------------------

/// Options for creating upstreams.
///
/// Cloning is shallow: lists and hooks are reference counted and the
/// clone shares them with the original. Since they can only be replaced
/// as a whole through the setters, changing a clone never affects the
/// original.
///
/// The defaults are:
///
/// * no verification hooks, no QUIC tracer,
/// * the `webpki-roots` root store and all cipher suites of the default
///   crypto provider,
/// * no bootstrap servers, meaning the system resolver is used,
/// * no explicit server addresses,
/// * HTTP/1.1 and HTTP/2 for DNS-over-HTTPS,
/// * no timeout,
/// * certificates are verified and IPv4 addresses are preferred.
#[derive(Clone)]
pub struct Options {
    /// Hook for the server certificates.
    verify_server_certificate: Option<VerifyServerCertificate>,

    /// Hook for the established TLS connection.
    verify_connection: Option<VerifyConnection>,

    /// Hook for DNSCrypt resolver certificates.
    #[cfg(feature = "dnscrypt")]
    verify_dnscrypt_certificate: Option<VerifyDnsCryptCertificate>,

    /// Hook for new QUIC connections.
    quic_tracer: Option<QuicTracer>,

    /// Root certificates replacing the built-in ones.
    root_cas: Option<Arc<RootCertStore>>,

    /// TLS 1.2 cipher suites to offer. Empty means all.
    cipher_suites: Arc<[CipherSuite]>,

    /// Servers resolving the upstream's host name.
    bootstrap: Arc<[String]>,

    /// Addresses of the upstream server. If set, no resolving happens.
    server_ip_addrs: Arc<[IpAddr]>,

    /// HTTP versions for DNS-over-HTTPS.
    http_versions: Arc<[HttpVersion]>,

    /// Timeout for exchanges and bootstrap lookups. Zero means none.
    timeout: Duration,

    /// Whether to skip verifying server certificates.
    insecure_skip_verify: bool,

    /// Whether to prefer IPv6 addresses of the upstream.
    prefer_ipv6: bool,
}

impl Options {
    /// Creates new options with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the hook for server certificates.
    pub fn verify_server_certificate(
        &self,
    ) -> Option<&VerifyServerCertificate> {
        self.verify_server_certificate.as_ref()
    }

    /// Sets the hook for server certificates.
    ///
    /// It applies to DNS-over-TLS, DNS-over-HTTPS, and DNS-over-QUIC.
    pub fn set_verify_server_certificate(
        &mut self,
        hook: impl Fn(&[CertificateDer<'_>]) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    ) {
        self.verify_server_certificate = Some(Arc::new(hook))
    }

    /// Returns the hook for established TLS connections.
    pub fn verify_connection(&self) -> Option<&VerifyConnection> {
        self.verify_connection.as_ref()
    }

    /// Sets the hook for established TLS connections.
    pub fn set_verify_connection(
        &mut self,
        hook: impl Fn(&ConnectionInfo<'_>) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    ) {
        self.verify_connection = Some(Arc::new(hook))
    }

    /// Returns the hook for DNSCrypt certificates.
    #[cfg(feature = "dnscrypt")]
    pub fn verify_dnscrypt_certificate(
        &self,
    ) -> Option<&VerifyDnsCryptCertificate> {
        self.verify_dnscrypt_certificate.as_ref()
    }

    /// Sets the hook for DNSCrypt certificates.
    #[cfg(feature = "dnscrypt")]
    pub fn set_verify_dnscrypt_certificate(
        &mut self,
        hook: impl Fn(&Cert) -> Result<(), BoxError> + Send + Sync + 'static,
    ) {
        self.verify_dnscrypt_certificate = Some(Arc::new(hook))
    }

    /// Returns the QUIC connection tracer.
    pub fn quic_tracer(&self) -> Option<&QuicTracer> {
        self.quic_tracer.as_ref()
    }

    /// Sets the QUIC connection tracer.
    pub fn set_quic_tracer(
        &mut self,
        tracer: impl Fn(&quinn::Connection) + Send + Sync + 'static,
    ) {
        self.quic_tracer = Some(Arc::new(tracer))
    }

    /// Returns the root certificates replacing the built-in ones.
    pub fn root_cas(&self) -> Option<&Arc<RootCertStore>> {
        self.root_cas.as_ref()
    }

    /// Sets the root certificates to use instead of the built-in ones.
    pub fn set_root_cas(&mut self, roots: impl Into<Arc<RootCertStore>>) {
        self.root_cas = Some(roots.into())
    }

    /// Returns the TLS 1.2 cipher suites to offer.
    ///
    /// An empty list means all suites of the crypto provider.
    pub fn cipher_suites(&self) -> &[CipherSuite] {
        &self.cipher_suites
    }

    /// Sets the TLS 1.2 cipher suites to offer.
    ///
    /// TLS 1.3 suites are not affected.
    pub fn set_cipher_suites(
        &mut self,
        suites: impl IntoIterator<Item = CipherSuite>,
    ) {
        self.cipher_suites = suites.into_iter().collect()
    }

    /// Returns the bootstrap servers.
    pub fn bootstrap(&self) -> &[String] {
        &self.bootstrap
    }

    /// Sets the servers used to resolve the upstream's host name.
    ///
    /// Each entry is an upstream address of its own. An empty entry stands
    /// for the system resolver. The upstreams created from these entries
    /// are closed together with the upstream they resolve for.
    pub fn set_bootstrap(
        &mut self,
        servers: impl IntoIterator<Item = impl Into<String>>,
    ) {
        self.bootstrap = servers.into_iter().map(Into::into).collect()
    }

    /// Returns the addresses of the upstream server.
    pub fn server_ip_addrs(&self) -> &[IpAddr] {
        &self.server_ip_addrs
    }

    /// Sets the addresses of the upstream server.
    ///
    /// If not empty, the bootstrap servers are not used at all.
    pub fn set_server_ip_addrs(
        &mut self,
        addrs: impl IntoIterator<Item = IpAddr>,
    ) {
        self.server_ip_addrs = addrs.into_iter().collect()
    }

    /// Returns the HTTP versions for DNS-over-HTTPS.
    pub fn http_versions(&self) -> &[HttpVersion] {
        &self.http_versions
    }

    /// Sets the HTTP versions for DNS-over-HTTPS.
    ///
    /// An empty list restores the default.
    pub fn set_http_versions(
        &mut self,
        versions: impl IntoIterator<Item = HttpVersion>,
    ) {
        let versions: Arc<[HttpVersion]> = versions.into_iter().collect();
        self.http_versions = if versions.is_empty() {
            Arc::from(DEFAULT_HTTP_VERSIONS.as_slice())
        } else {
            versions
        }
    }

    /// Returns the timeout.
    ///
    /// A zero duration means that no timeout is applied.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the timeout for exchanges and for bootstrap lookups.
    ///
    /// A zero duration disables the timeout, in which case lookups and
    /// exchanges may wait forever.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout
    }

    /// Returns whether server certificates are left unverified.
    pub fn insecure_skip_verify(&self) -> bool {
        self.insecure_skip_verify
    }

    /// Sets whether server certificates are left unverified.
    pub fn set_insecure_skip_verify(&mut self, value: bool) {
        self.insecure_skip_verify = value
    }

    /// Returns whether IPv6 addresses of the upstream are preferred.
    pub fn prefer_ipv6(&self) -> bool {
        self.prefer_ipv6
    }

    /// Sets whether IPv6 addresses of the upstream are preferred.
    pub fn set_prefer_ipv6(&mut self, value: bool) {
        self.prefer_ipv6 = value
    }

    /// Returns the options for an upstream serving as bootstrap resolver.
    ///
    /// Verification, timeout, and address preference carry over. The
    /// bootstrap list and the server addresses do not, so a bootstrap
    /// upstream is resolved by the system resolver if necessary and
    /// construction never recurses further.
    pub(crate) fn for_bootstrap(&self) -> Self {
        Options {
            bootstrap: Arc::from(Vec::new()),
            server_ip_addrs: Arc::from(Vec::new()),
            http_versions: Arc::from(DEFAULT_HTTP_VERSIONS.as_slice()),
            ..self.clone()
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verify_server_certificate: None,
            verify_connection: None,
            #[cfg(feature = "dnscrypt")]
            verify_dnscrypt_certificate: None,
            quic_tracer: None,
            root_cas: None,
            cipher_suites: Arc::from(Vec::new()),
            bootstrap: Arc::from(Vec::new()),
            server_ip_addrs: Arc::from(Vec::new()),
            http_versions: Arc::from(DEFAULT_HTTP_VERSIONS.as_slice()),
            timeout: Duration::ZERO,
            insecure_skip_verify: false,
            prefer_ipv6: false,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field(
                "verify_server_certificate",
                &self.verify_server_certificate.is_some(),
            )
            .field("verify_connection", &self.verify_connection.is_some())
            .field("quic_tracer", &self.quic_tracer.is_some())
            .field("root_cas", &self.root_cas.as_ref().map(|r| r.len()))
            .field("cipher_suites", &self.cipher_suites)
            .field("bootstrap", &self.bootstrap)
            .field("server_ip_addrs", &self.server_ip_addrs)
            .field("http_versions", &self.http_versions)
            .field("timeout", &self.timeout)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("prefer_ipv6", &self.prefer_ipv6)
            .finish()
    }
}

//============ Tests =========================================================
