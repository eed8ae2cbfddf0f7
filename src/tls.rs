//! TLS configuration for the encrypted transports.
//!
//! DNS-over-TLS, DNS-over-HTTPS, and DNS-over-QUIC all build their
//! `rustls` client configuration here so that the verification options
//! from [`Options`] apply to them in the same way.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, OtherError, ProtocolVersion,
    RootCertStore, SignatureScheme, SupportedCipherSuite,
};

use crate::error::Error;
use crate::options::{Options, VerifyServerCertificate};

//------------ ConnectionInfo ------------------------------------------------

/// The state of an established TLS connection.
///
/// This is what the connection hook of [`Options`] gets to see.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionInfo<'a> {
    /// The name the server was verified for.
    server_name: &'a str,

    /// The certificates presented by the server.
    peer_certificates: &'a [CertificateDer<'static>],

    /// The negotiated application protocol.
    alpn_protocol: Option<&'a [u8]>,

    /// The negotiated TLS version.
    protocol_version: Option<ProtocolVersion>,
}

impl<'a> ConnectionInfo<'a> {
    /// Creates connection info from its parts.
    pub(crate) fn new(
        server_name: &'a str,
        peer_certificates: &'a [CertificateDer<'static>],
        alpn_protocol: Option<&'a [u8]>,
        protocol_version: Option<ProtocolVersion>,
    ) -> Self {
        ConnectionInfo {
            server_name,
            peer_certificates,
            alpn_protocol,
            protocol_version,
        }
    }

    /// Creates connection info from a client connection.
    pub(crate) fn from_client(
        server_name: &'a str,
        conn: &'a rustls::ClientConnection,
    ) -> Self {
        Self::new(
            server_name,
            conn.peer_certificates().unwrap_or_default(),
            conn.alpn_protocol(),
            conn.protocol_version(),
        )
    }

    /// Returns the server name.
    pub fn server_name(&self) -> &str {
        self.server_name
    }

    /// Returns the server's certificates, end-entity first.
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        self.peer_certificates
    }

    /// Returns the negotiated application protocol, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn_protocol
    }

    /// Returns the negotiated TLS version.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }
}

//------------ Configuration -------------------------------------------------

/// Creates a client configuration for the given options.
///
/// `alpn` lists the application protocols to offer. With `tls13_only`,
/// which QUIC needs, older versions are not offered.
pub(crate) fn client_config(
    opts: &Options,
    alpn: &[&str],
    tls13_only: bool,
) -> Result<Arc<ClientConfig>, Error> {
    let provider = Arc::new(crypto_provider(opts));
    let verifier = Arc::new(Verifier::new(opts, provider.clone())?);
    let builder = ClientConfig::builder_with_provider(provider);
    let builder = if tls13_only {
        builder.with_protocol_versions(&[&rustls::version::TLS13])?
    } else {
        builder.with_safe_default_protocol_versions()?
    };
    let mut config = builder
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols =
        alpn.iter().map(|proto| proto.as_bytes().to_vec()).collect();
    Ok(Arc::new(config))
}

/// Converts a host into a server name.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(host.to_owned())
        .map_err(|_| Error::InvalidServerName(host.into()))
}

/// Runs the connection hook of the options, if there is one.
pub(crate) fn verify_connection(
    opts: &Options,
    info: &ConnectionInfo<'_>,
) -> Result<(), Error> {
    match opts.verify_connection() {
        Some(hook) => hook(info).map_err(|err| Error::Rejected(err.into())),
        None => Ok(()),
    }
}

/// Returns the crypto provider with the cipher suites from the options.
fn crypto_provider(opts: &Options) -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    let suites = opts.cipher_suites();
    if !suites.is_empty() {
        provider.cipher_suites.retain(|suite| {
            matches!(suite, SupportedCipherSuite::Tls13(_))
                || suites.contains(&suite.suite())
        });
    }
    provider
}

/// Returns the root certificates to verify servers against.
fn root_store(opts: &Options) -> Arc<RootCertStore> {
    match opts.root_cas() {
        Some(roots) => roots.clone(),
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(roots)
        }
    }
}

//------------ Verifier ------------------------------------------------------

/// Verifies server certificates according to the options.
///
/// The chain is checked against the root store unless verification is
/// disabled. The certificate hook runs afterwards in either case.
/// Handshake signatures are always checked.
struct Verifier {
    /// The chain verifier, unless verification is disabled.
    webpki: Option<Arc<WebPkiServerVerifier>>,

    /// The certificate hook.
    hook: Option<VerifyServerCertificate>,

    /// The algorithms for checking handshake signatures.
    algorithms: WebPkiSupportedAlgorithms,
}

impl Verifier {
    /// Creates a verifier for the options.
    fn new(
        opts: &Options,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, Error> {
        let algorithms = provider.signature_verification_algorithms;
        let webpki = if opts.insecure_skip_verify() {
            None
        } else {
            let verifier = WebPkiServerVerifier::builder_with_provider(
                root_store(opts),
                provider,
            )
            .build()
            .map_err(|err| {
                Error::from(rustls::Error::General(err.to_string()))
            })?;
            Some(verifier)
        };
        Ok(Verifier {
            webpki,
            hook: opts.verify_server_certificate().cloned(),
            algorithms,
        })
    }
}

impl ServerCertVerifier for Verifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(webpki) = &self.webpki {
            webpki.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            )?;
        }
        if let Some(hook) = &self.hook {
            let mut chain = Vec::with_capacity(intermediates.len() + 1);
            chain.push(end_entity.clone());
            chain.extend(intermediates.iter().cloned());
            hook(&chain).map_err(|err| {
                rustls::Error::Other(OtherError(Arc::from(err)))
            })?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("verify_chain", &self.webpki.is_some())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

//============ Tests =========================================================
