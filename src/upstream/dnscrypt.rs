//! DNSCrypt.
//!
//! A DNSCrypt upstream is always given as a DNS stamp. The stamp provides
//! the server's address, the provider name, and the provider's Ed25519
//! public key. Before the first exchange, the upstream fetches the
//! resolver certificates as TXT records of the provider name, checks their
//! signatures with the provider key, and picks the valid certificate with
//! the highest serial. The certificate names the resolver's short-term
//! public key and the encryption system.
//!
//! Each request is then encrypted with a fresh nonce and sent over UDP.
//! Truncated answers are repeated over TCP.
//!
//! See <https://dnscrypt.info/protocol> for the protocol.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::AeadInPlace;
use crypto_box::{ChaChaBox, PublicKey, SalsaBox, SecretKey};
use domain::base::iana::Rtype;
use domain::base::{Message, MessageBuilder, Name};
use domain::rdata::Txt;
use ring::signature::{UnparsedPublicKey, ED25519};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use crate::addr::AddressSpec;
use crate::dial::{with_timeout, DialHandler, Network};
use crate::error::Error;
use crate::options::Options;
use crate::stamp::ServerStamp;

use super::plain::{exchange_tcp, exchange_udp};
use super::{is_answer, log_begin, log_finish, Base, ExchangeFuture, Upstream};

/// The magic starting every certificate.
const CERT_MAGIC: &[u8; 4] = b"DNSC";

/// The magic starting every response.
const RESOLVER_MAGIC: &[u8; 8] = b"r6fnvWj8";

/// The length of a certificate without extensions.
const CERT_LEN: usize = 124;

/// Offset of the signed part of a certificate.
const SIGNED_START: usize = 72;

/// The length of the nonce chosen by the client.
const HALF_NONCE_LEN: usize = 12;

/// The length of the authentication tag.
const TAG_LEN: usize = 16;

/// The minimum size of a padded query sent over UDP.
const MIN_UDP_QUERY_LEN: usize = 256;

/// The largest datagram we are prepared to receive.
const MAX_DGRAM_SIZE: usize = 65535;

//------------ EsVersion -----------------------------------------------------

/// The encryption system of a certificate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EsVersion {
    /// X25519-XSalsa20Poly1305.
    XSalsa20Poly1305,

    /// X25519-XChacha20Poly1305.
    XChacha20Poly1305,
}

impl EsVersion {
    fn from_int(value: u16) -> Option<Self> {
        match value {
            1 => Some(EsVersion::XSalsa20Poly1305),
            2 => Some(EsVersion::XChacha20Poly1305),
            _ => None,
        }
    }
}

//------------ Cert ----------------------------------------------------------

/// A DNSCrypt resolver certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cert {
    es_version: EsVersion,
    resolver_pk: [u8; 32],
    client_magic: [u8; 8],
    serial: u32,
    not_before: u32,
    not_after: u32,
}

impl Cert {
    /// Parses a certificate and checks its signature.
    pub fn parse(data: &[u8], provider_pk: &[u8]) -> Result<Self, Error> {
        if data.len() < CERT_LEN {
            return Err(Error::DnsCrypt("certificate too short".into()));
        }
        if &data[..4] != CERT_MAGIC {
            return Err(Error::DnsCrypt("bad certificate magic".into()));
        }
        let es_version = EsVersion::from_int(u16::from_be_bytes([
            data[4], data[5],
        ]))
        .ok_or_else(|| {
            Error::DnsCrypt("unsupported encryption system".into())
        })?;
        let signature = &data[8..SIGNED_START];
        UnparsedPublicKey::new(&ED25519, provider_pk)
            .verify(&data[SIGNED_START..], signature)
            .map_err(|_| {
                Error::DnsCrypt("invalid certificate signature".into())
            })?;

        let signed = &data[SIGNED_START..];
        let mut resolver_pk = [0u8; 32];
        resolver_pk.copy_from_slice(&signed[..32]);
        let mut client_magic = [0u8; 8];
        client_magic.copy_from_slice(&signed[32..40]);
        let int = |pos: usize| {
            u32::from_be_bytes([
                signed[pos],
                signed[pos + 1],
                signed[pos + 2],
                signed[pos + 3],
            ])
        };
        Ok(Cert {
            es_version,
            resolver_pk,
            client_magic,
            serial: int(40),
            not_before: int(44),
            not_after: int(48),
        })
    }

    /// Returns the encryption system.
    pub fn es_version(&self) -> EsVersion {
        self.es_version
    }

    /// Returns the resolver's short-term public key.
    pub fn resolver_pk(&self) -> &[u8; 32] {
        &self.resolver_pk
    }

    /// Returns the magic to start queries with.
    pub fn client_magic(&self) -> &[u8; 8] {
        &self.client_magic
    }

    /// Returns the serial number.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Returns the start of the validity period as a Unix timestamp.
    pub fn not_before(&self) -> u32 {
        self.not_before
    }

    /// Returns the end of the validity period as a Unix timestamp.
    pub fn not_after(&self) -> u32 {
        self.not_after
    }

    /// Returns the key for picking the best of several certificates.
    fn rank(&self) -> (u32, bool) {
        (self.serial, self.es_version == EsVersion::XChacha20Poly1305)
    }

    /// Returns whether the certificate is valid at the given time.
    pub fn is_valid_at(&self, now: u32) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

//------------ Cipher --------------------------------------------------------

/// The shared key for one resolver certificate.
enum Cipher {
    Salsa(SalsaBox),
    ChaCha(ChaChaBox),
}

impl Cipher {
    fn new(cert: &Cert, secret: &SecretKey) -> Self {
        let public = PublicKey::from(cert.resolver_pk);
        match cert.es_version {
            EsVersion::XSalsa20Poly1305 => {
                Cipher::Salsa(SalsaBox::new(&public, secret))
            }
            EsVersion::XChacha20Poly1305 => {
                Cipher::ChaCha(ChaChaBox::new(&public, secret))
            }
        }
    }

    /// Encrypts in place and returns tag and ciphertext.
    fn seal(
        &self,
        nonce: &[u8; 24],
        mut data: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = match self {
            Cipher::Salsa(b) => {
                b.encrypt_in_place_detached(nonce, b"", &mut data)
            }
            Cipher::ChaCha(b) => {
                b.encrypt_in_place_detached(nonce, b"", &mut data)
            }
        }
        .map_err(|_| Error::DnsCrypt("encryption failed".into()))?;
        let mut res = Vec::with_capacity(TAG_LEN + data.len());
        res.extend_from_slice(&tag);
        res.extend_from_slice(&data);
        Ok(res)
    }

    /// Decrypts tag and ciphertext.
    fn open(&self, nonce: &[u8; 24], data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() < TAG_LEN {
            return Err(Error::DnsCrypt("response too short".into()));
        }
        let (tag, ciphertext) = data.split_at(TAG_LEN);
        let nonce = GenericArray::from_slice(nonce);
        let tag = GenericArray::from_slice(tag);
        let mut buf = ciphertext.to_vec();
        match self {
            Cipher::Salsa(b) => {
                b.decrypt_in_place_detached(nonce, b"", &mut buf, tag)
            }
            Cipher::ChaCha(b) => {
                b.decrypt_in_place_detached(nonce, b"", &mut buf, tag)
            }
        }
        .map_err(|_| Error::DnsCrypt("decryption failed".into()))?;
        Ok(buf)
    }
}

/// The state derived from the current certificate.
struct Session {
    cert: Cert,
    client_pk: [u8; 32],
    cipher: Cipher,
}

//------------ DnsCryptUpstream ----------------------------------------------

/// An upstream for DNSCrypt.
pub struct DnsCryptUpstream {
    base: Base,

    /// The provider name to fetch certificates from.
    provider_name: String,

    /// The provider's public key for checking certificates.
    provider_pk: Vec<u8>,

    /// The session for the current certificate.
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
}

impl DnsCryptUpstream {
    /// Creates a new upstream.
    pub fn new(spec: AddressSpec, opts: Options) -> Result<Self, Error> {
        let stamp: ServerStamp = spec.raw().parse()?;
        if stamp.server_pk().len() != 32 {
            return Err(Error::malformed(
                spec.raw(),
                "invalid provider public key",
            ));
        }
        Ok(DnsCryptUpstream {
            provider_name: stamp.provider_name().into(),
            provider_pk: stamp.server_pk().into(),
            base: Base::new(spec, opts)?,
            session: tokio::sync::Mutex::new(None),
        })
    }

    /// Returns a session with a currently valid certificate.
    async fn session(
        &self,
        handler: &DialHandler,
    ) -> Result<Arc<Session>, Error> {
        let now = unix_now();
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.cert.is_valid_at(now) {
                return Ok(session.clone());
            }
        }
        let cert = self.fetch_cert(handler, now).await?;
        if let Some(hook) = self.base.opts().verify_dnscrypt_certificate() {
            hook(&cert).map_err(|err| Error::Rejected(err.into()))?;
        }
        debug!(
            "{}: using certificate with serial {}",
            self.base.address(),
            cert.serial
        );
        let secret = SecretKey::from(rand::random::<[u8; 32]>());
        let session = Arc::new(Session {
            client_pk: *secret.public_key().as_bytes(),
            cipher: Cipher::new(&cert, &secret),
            cert,
        });
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Fetches the certificates and returns the best valid one.
    async fn fetch_cert(
        &self,
        handler: &DialHandler,
        now: u32,
    ) -> Result<Cert, Error> {
        let mut query = MessageBuilder::new_bytes();
        query.header_mut().set_random_id();
        query.header_mut().set_rd(true);
        let mut query = query.question();
        query.push((
            Name::<Vec<u8>>::from_str(&self.provider_name)
                .map_err(|err| Error::malformed(&self.provider_name, err))?,
            Rtype::TXT,
        ))?;
        let query = query.into_message();

        let mut response = exchange_udp(handler, &query).await?;
        if response.header().tc() {
            response = exchange_tcp(handler, &query).await?;
        }

        let mut best: Option<Cert> = None;
        for record in response.answer()?.limit_to::<Txt<Bytes>>() {
            let record = record?;
            let data: Vec<u8> =
                record.data().iter().flatten().copied().collect();
            let cert = match Cert::parse(&data, &self.provider_pk) {
                Ok(cert) => cert,
                Err(err) => {
                    trace!(
                        "{}: skipping certificate: {err}",
                        self.provider_name
                    );
                    continue;
                }
            };
            if !cert.is_valid_at(now) {
                continue;
            }
            if best.as_ref().map_or(true, |best| cert.rank() > best.rank()) {
                best = Some(cert)
            }
        }
        best.ok_or_else(|| {
            Error::DnsCrypt(format!(
                "no valid certificate for {}",
                self.provider_name
            ))
        })
    }

    async fn exchange_dnscrypt(
        &self,
        handler: &DialHandler,
        request: &Message<Bytes>,
    ) -> Result<Message<Bytes>, Error> {
        let session = self.session(handler).await?;
        let reply = self
            .exchange_encrypted(&session, handler, request, Network::Udp)
            .await?;
        if reply.header().tc() {
            return self
                .exchange_encrypted(&session, handler, request, Network::Tcp)
                .await;
        }
        Ok(reply)
    }

    /// Encrypts, sends, and decrypts over the given network.
    async fn exchange_encrypted(
        &self,
        session: &Session,
        handler: &DialHandler,
        request: &Message<Bytes>,
        network: Network,
    ) -> Result<Message<Bytes>, Error> {
        let client_nonce: [u8; HALF_NONCE_LEN] = rand::random();
        let mut nonce = [0u8; 24];
        nonce[..HALF_NONCE_LEN].copy_from_slice(&client_nonce);

        let min_len = match network {
            Network::Udp => MIN_UDP_QUERY_LEN,
            Network::Tcp => 0,
        };
        let sealed = session
            .cipher
            .seal(&nonce, pad(request.as_slice(), min_len))?;
        let mut packet = Vec::with_capacity(52 + sealed.len());
        packet.extend_from_slice(&session.cert.client_magic);
        packet.extend_from_slice(&session.client_pk);
        packet.extend_from_slice(&client_nonce);
        packet.extend_from_slice(&sealed);

        let reply = match network {
            Network::Udp => {
                let sock = handler.dial_udp().await?;
                udp_roundtrip(&sock, &packet, |data| {
                    open_response(session, &client_nonce, data, request)
                })
                .await?
            }
            Network::Tcp => {
                let mut stream = handler.dial_tcp().await?;
                let data = tcp_roundtrip(&mut stream, &packet).await?;
                open_response(session, &client_nonce, &data, request)?
            }
        };
        Ok(reply)
    }
}

impl Upstream for DnsCryptUpstream {
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
                self.exchange_dnscrypt(&handler, request),
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
        self.base.close()
    }
}

//------------ Helpers -------------------------------------------------------

/// Returns the current time as a Unix timestamp.
fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Pads a query with ISO/IEC 7816-4 padding.
///
/// The result is a multiple of 64 octets long and at least `min_len`.
fn pad(data: &[u8], min_len: usize) -> Vec<u8> {
    let len = (data.len() + 1).max(min_len);
    let len = len.div_ceil(64) * 64;
    let mut res = Vec::with_capacity(len);
    res.extend_from_slice(data);
    res.push(0x80);
    res.resize(len, 0);
    res
}

/// Removes ISO/IEC 7816-4 padding.
fn unpad(mut data: Vec<u8>) -> Result<Vec<u8>, Error> {
    while let Some(0) = data.last() {
        data.pop();
    }
    match data.pop() {
        Some(0x80) => Ok(data),
        _ => Err(Error::DnsCrypt("invalid padding".into())),
    }
}

/// Checks and decrypts a response.
fn open_response(
    session: &Session,
    client_nonce: &[u8; HALF_NONCE_LEN],
    data: &[u8],
    request: &Message<Bytes>,
) -> Result<Message<Bytes>, Error> {
    if data.len() < RESOLVER_MAGIC.len() + 24 + TAG_LEN
        || &data[..RESOLVER_MAGIC.len()] != RESOLVER_MAGIC
    {
        return Err(Error::DnsCrypt("invalid response".into()));
    }
    let data = &data[RESOLVER_MAGIC.len()..];
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&data[..24]);
    if &nonce[..HALF_NONCE_LEN] != client_nonce {
        return Err(Error::DnsCrypt("unexpected nonce".into()));
    }
    let plain = unpad(session.cipher.open(&nonce, &data[24..])?)?;
    let reply = Message::from_octets(Bytes::from(plain))?;
    if !is_answer(&reply, request) {
        return Err(Error::WrongReplyForQuery);
    }
    Ok(reply)
}

/// Sends a datagram and waits for a reply that `check` accepts.
async fn udp_roundtrip(
    sock: &UdpSocket,
    packet: &[u8],
    check: impl Fn(&[u8]) -> Result<Message<Bytes>, Error>,
) -> Result<Message<Bytes>, Error> {
    sock.send(packet).await?;
    let mut buf = vec![0u8; MAX_DGRAM_SIZE];
    loop {
        let len = sock.recv(&mut buf).await?;
        match check(&buf[..len]) {
            Ok(reply) => return Ok(reply),
            Err(err) => trace!("ignoring datagram: {err}"),
        }
    }
}

/// Sends a packet with length framing and reads the framed reply.
async fn tcp_roundtrip(
    stream: &mut TcpStream,
    packet: &[u8],
) -> Result<Vec<u8>, Error> {
    let len = u16::try_from(packet.len()).map_err(|_| Error::MessageBuilder)?;
    let mut buf = Vec::with_capacity(packet.len() + 2);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(packet);
    stream.write_all(&buf).await?;
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut data = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

//============ Tests =========================================================
