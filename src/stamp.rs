//! DNS stamps.
//!
//! A DNS stamp is a self-contained description of a DNS server encoded as
//! `sdns://` followed by the URL-safe base64 encoding of a binary
//! structure. The structure starts with a protocol identifier followed by
//! protocol-specific fields. See
//! <https://dnscrypt.info/stamps-specifications> for the details.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::Error;

/// The prefix of a DNS stamp.
pub const STAMP_PREFIX: &str = "sdns://";

//------------ StampProtocol -------------------------------------------------

/// The protocol identifier of a stamp.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StampProtocol {
    /// Plain DNS.
    Plain,

    /// DNSCrypt.
    DnsCrypt,

    /// DNS-over-HTTPS.
    DoH,

    /// DNS-over-TLS.
    Tls,

    /// DNS-over-QUIC.
    DoQ,

    /// Oblivious DoH target.
    ODoHTarget,

    /// Anonymized DNSCrypt relay.
    DnsCryptRelay,

    /// Oblivious DoH relay.
    ODoHRelay,
}

impl StampProtocol {
    /// Returns the protocol for its identifier.
    pub fn from_int(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(StampProtocol::Plain),
            0x01 => Some(StampProtocol::DnsCrypt),
            0x02 => Some(StampProtocol::DoH),
            0x03 => Some(StampProtocol::Tls),
            0x04 => Some(StampProtocol::DoQ),
            0x05 => Some(StampProtocol::ODoHTarget),
            0x81 => Some(StampProtocol::DnsCryptRelay),
            0x85 => Some(StampProtocol::ODoHRelay),
            _ => None,
        }
    }

    /// Returns the identifier of the protocol.
    pub fn to_int(self) -> u8 {
        match self {
            StampProtocol::Plain => 0x00,
            StampProtocol::DnsCrypt => 0x01,
            StampProtocol::DoH => 0x02,
            StampProtocol::Tls => 0x03,
            StampProtocol::DoQ => 0x04,
            StampProtocol::ODoHTarget => 0x05,
            StampProtocol::DnsCryptRelay => 0x81,
            StampProtocol::ODoHRelay => 0x85,
        }
    }
}

impl fmt::Display for StampProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StampProtocol::Plain => "Plain",
            StampProtocol::DnsCrypt => "DNSCrypt",
            StampProtocol::DoH => "DoH",
            StampProtocol::Tls => "DoT",
            StampProtocol::DoQ => "DoQ",
            StampProtocol::ODoHTarget => "ODoH",
            StampProtocol::DnsCryptRelay => "Anonymized DNSCrypt",
            StampProtocol::ODoHRelay => "ODoH relay",
        })
    }
}

//------------ StampProperties -----------------------------------------------

/// The informal properties a server claims in its stamp.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct StampProperties(u64);

impl StampProperties {
    /// The server supports DNSSEC.
    pub const DNSSEC: Self = StampProperties(1);

    /// The server doesn't keep logs.
    pub const NO_LOG: Self = StampProperties(1 << 1);

    /// The server doesn't filter responses.
    pub const NO_FILTER: Self = StampProperties(1 << 2);

    /// Creates properties from their raw value.
    pub fn from_bits(bits: u64) -> Self {
        StampProperties(bits)
    }

    /// Returns the raw value.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Returns whether all properties in `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StampProperties {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        StampProperties(self.0 | other.0)
    }
}

//------------ ServerStamp ---------------------------------------------------

/// A decoded server stamp.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerStamp {
    /// The protocol.
    protocol: Option<StampProtocol>,

    /// The claimed properties.
    props: StampProperties,

    /// The server's address, possibly with port, possibly empty.
    server_addr: String,

    /// The provider's public key for DNSCrypt.
    server_pk: Vec<u8>,

    /// Hashes of certificates in the server's chain.
    hashes: Vec<Vec<u8>>,

    /// The provider name or host name, possibly with port.
    provider_name: String,

    /// The path for DoH.
    path: String,

    /// Resolvers recommended for resolving the provider name.
    bootstrap_ips: Vec<String>,
}

impl ServerStamp {
    /// Creates a stamp for plain DNS.
    pub fn new_plain(props: StampProperties, server_addr: &str) -> Self {
        ServerStamp {
            protocol: Some(StampProtocol::Plain),
            props,
            server_addr: server_addr.into(),
            ..Default::default()
        }
    }

    /// Creates a stamp for a DNSCrypt server.
    pub fn new_dnscrypt(
        props: StampProperties,
        server_addr: &str,
        server_pk: &[u8],
        provider_name: &str,
    ) -> Self {
        ServerStamp {
            protocol: Some(StampProtocol::DnsCrypt),
            props,
            server_addr: server_addr.into(),
            server_pk: server_pk.into(),
            provider_name: provider_name.into(),
            ..Default::default()
        }
    }

    /// Creates a stamp for a DNS-over-HTTPS server.
    pub fn new_doh(
        props: StampProperties,
        server_addr: &str,
        host: &str,
        path: &str,
    ) -> Self {
        ServerStamp {
            protocol: Some(StampProtocol::DoH),
            props,
            server_addr: server_addr.into(),
            provider_name: host.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Creates a stamp for a DNS-over-TLS server.
    pub fn new_dot(
        props: StampProperties,
        server_addr: &str,
        host: &str,
    ) -> Self {
        ServerStamp {
            protocol: Some(StampProtocol::Tls),
            props,
            server_addr: server_addr.into(),
            provider_name: host.into(),
            ..Default::default()
        }
    }

    /// Creates a stamp for a DNS-over-QUIC server.
    pub fn new_doq(
        props: StampProperties,
        server_addr: &str,
        host: &str,
    ) -> Self {
        ServerStamp {
            protocol: Some(StampProtocol::DoQ),
            ..Self::new_dot(props, server_addr, host)
        }
    }

    /// Creates a stamp for an anonymized DNSCrypt relay.
    pub fn new_dnscrypt_relay(server_addr: &str) -> Self {
        ServerStamp {
            protocol: Some(StampProtocol::DnsCryptRelay),
            server_addr: server_addr.into(),
            ..Default::default()
        }
    }

    /// Adds a certificate hash.
    pub fn with_hash(mut self, hash: impl Into<Vec<u8>>) -> Self {
        self.hashes.push(hash.into());
        self
    }

    /// Returns the protocol.
    pub fn protocol(&self) -> StampProtocol {
        self.protocol.unwrap_or(StampProtocol::Plain)
    }

    /// Returns the claimed properties.
    pub fn props(&self) -> StampProperties {
        self.props
    }

    /// Returns the server address, which may be empty.
    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Returns the provider's public key.
    pub fn server_pk(&self) -> &[u8] {
        &self.server_pk
    }

    /// Returns the certificate hashes.
    pub fn hashes(&self) -> &[Vec<u8>] {
        &self.hashes
    }

    /// Returns the provider name.
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Returns the path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the recommended bootstrap resolvers.
    pub fn bootstrap_ips(&self) -> &[String] {
        &self.bootstrap_ips
    }

    /// Decodes the binary form of a stamp.
    fn decode(bin: &[u8]) -> Result<Self, &'static str> {
        let mut reader = Reader(bin);
        let id = reader.u8()?;
        let protocol =
            StampProtocol::from_int(id).ok_or("unknown stamp protocol")?;
        let mut stamp = ServerStamp {
            protocol: Some(protocol),
            ..Default::default()
        };
        match protocol {
            StampProtocol::DnsCryptRelay => {
                stamp.server_addr = reader.string()?;
            }
            StampProtocol::ODoHTarget => {
                stamp.props = reader.props()?;
                stamp.provider_name = reader.string()?;
                stamp.path = reader.string()?;
            }
            StampProtocol::Plain => {
                stamp.props = reader.props()?;
                stamp.server_addr = reader.string()?;
            }
            StampProtocol::DnsCrypt => {
                stamp.props = reader.props()?;
                stamp.server_addr = reader.string()?;
                stamp.server_pk = reader.bytes()?.into();
                stamp.provider_name = reader.string()?;
            }
            StampProtocol::DoH
            | StampProtocol::Tls
            | StampProtocol::DoQ
            | StampProtocol::ODoHRelay => {
                stamp.props = reader.props()?;
                stamp.server_addr = reader.string()?;
                stamp.hashes = reader.set()?;
                stamp.provider_name = reader.string()?;
                if matches!(
                    protocol,
                    StampProtocol::DoH | StampProtocol::ODoHRelay
                ) {
                    stamp.path = reader.string()?;
                }
                if !reader.is_empty() {
                    stamp.bootstrap_ips = reader
                        .set()?
                        .into_iter()
                        .map(|ip| String::from_utf8(ip).map_err(|_| "bad utf-8"))
                        .collect::<Result<_, _>>()?;
                }
            }
        }
        if !reader.is_empty() {
            return Err("trailing data");
        }
        Ok(stamp)
    }

    /// Encodes the binary form of a stamp.
    ///
    /// Fails if a field is longer than its length prefix can express.
    fn encode(&self) -> Result<Vec<u8>, &'static str> {
        let protocol = self.protocol();
        let mut bin = vec![protocol.to_int()];
        if protocol != StampProtocol::DnsCryptRelay {
            bin.extend_from_slice(&self.props.bits().to_le_bytes());
        }
        match protocol {
            StampProtocol::DnsCryptRelay | StampProtocol::Plain => {
                put(&mut bin, self.server_addr.as_bytes())?;
            }
            StampProtocol::ODoHTarget => {
                put(&mut bin, self.provider_name.as_bytes())?;
                put(&mut bin, self.path.as_bytes())?;
            }
            StampProtocol::DnsCrypt => {
                put(&mut bin, self.server_addr.as_bytes())?;
                put(&mut bin, &self.server_pk)?;
                put(&mut bin, self.provider_name.as_bytes())?;
            }
            StampProtocol::DoH
            | StampProtocol::Tls
            | StampProtocol::DoQ
            | StampProtocol::ODoHRelay => {
                put(&mut bin, self.server_addr.as_bytes())?;
                put_set(&mut bin, self.hashes.iter().map(Vec::as_slice))?;
                put(&mut bin, self.provider_name.as_bytes())?;
                if matches!(
                    protocol,
                    StampProtocol::DoH | StampProtocol::ODoHRelay
                ) {
                    put(&mut bin, self.path.as_bytes())?;
                }
                if !self.bootstrap_ips.is_empty() {
                    put_set(
                        &mut bin,
                        self.bootstrap_ips.iter().map(String::as_bytes),
                    )?;
                }
            }
        }
        Ok(bin)
    }

    /// Returns the `sdns://` form of the stamp.
    ///
    /// Fails with [`Error::MalformedAddress`] if a field is too long to be
    /// encoded: 255 octets for plain fields and 127 octets for the
    /// elements of hash and bootstrap address sets.
    pub fn to_sdns(&self) -> Result<String, Error> {
        let bin = self
            .encode()
            .map_err(|err| Error::malformed(self.provider_name(), err))?;
        Ok(format!("{STAMP_PREFIX}{}", URL_SAFE_NO_PAD.encode(bin)))
    }
}

/// Appends a length-prefixed octet sequence.
fn put(bin: &mut Vec<u8>, data: &[u8]) -> Result<(), &'static str> {
    let len = u8::try_from(data.len()).map_err(|_| "stamp field too long")?;
    bin.push(len);
    bin.extend_from_slice(data);
    Ok(())
}

/// Appends a set of length-prefixed octet sequences.
///
/// The high bit of each length marks that another element follows, so
/// elements can be at most 127 octets long.
fn put_set<'a>(
    bin: &mut Vec<u8>,
    set: impl ExactSizeIterator<Item = &'a [u8]>,
) -> Result<(), &'static str> {
    let count = set.len();
    if count == 0 {
        bin.push(0);
    }
    for (i, data) in set.enumerate() {
        if data.len() > 0x7f {
            return Err("stamp set element too long");
        }
        let more = if i + 1 < count { 0x80 } else { 0 };
        bin.push(data.len() as u8 | more);
        bin.extend_from_slice(data);
    }
    Ok(())
}

impl FromStr for ServerStamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(STAMP_PREFIX)
            .ok_or_else(|| Error::malformed(s, "stamps must start with sdns://"))?;
        let bin = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|err| Error::malformed(s, err))?;
        Self::decode(&bin).map_err(|err| Error::malformed(s, err))
    }
}

/// Renders the `sdns://` form.
///
/// Formatting fails for stamps that [`ServerStamp::to_sdns`] rejects.
impl fmt::Display for ServerStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bin = self.encode().map_err(|_| fmt::Error)?;
        write!(f, "{STAMP_PREFIX}{}", URL_SAFE_NO_PAD.encode(bin))
    }
}

//------------ Reader --------------------------------------------------------

/// Reads the fields of a binary stamp.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn u8(&mut self) -> Result<u8, &'static str> {
        let (first, rest) = self.0.split_first().ok_or("stamp too short")?;
        self.0 = rest;
        Ok(*first)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], &'static str> {
        if self.0.len() < len {
            return Err("stamp too short");
        }
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn props(&mut self) -> Result<StampProperties, &'static str> {
        let mut bits = [0u8; 8];
        bits.copy_from_slice(self.take(8)?);
        Ok(StampProperties::from_bits(u64::from_le_bytes(bits)))
    }

    /// Reads a length-prefixed octet sequence.
    fn bytes(&mut self) -> Result<&'a [u8], &'static str> {
        let len = self.u8()?;
        self.take(usize::from(len))
    }

    fn string(&mut self) -> Result<String, &'static str> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.into()).map_err(|_| "bad utf-8")
    }

    /// Reads a set of length-prefixed octet sequences.
    ///
    /// The high bit of each length marks that another element follows.
    fn set(&mut self) -> Result<Vec<Vec<u8>>, &'static str> {
        let mut res = Vec::new();
        loop {
            let len = self.u8()?;
            let data = self.take(usize::from(len & 0x7f))?;
            if !data.is_empty() {
                res.push(data.to_vec());
            }
            if len & 0x80 == 0 {
                return Ok(res);
            }
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    // AdGuard DNS, DNS-over-HTTPS.
    const ADGUARD_DOH: &str = "sdns://AgMAAAAAAAAADDk0LjE0MC4xNC4xNCCaOjT3J965vKUQA9nOnDn48n3ZxSQpAcK6saROY1oCGQ9kbnMuYWRndWFyZC5jb20KL2Rucy1xdWVyeQ";

    #[test]
    fn decode_doh() {
        let stamp: ServerStamp = ADGUARD_DOH.parse().unwrap();
        assert_eq!(stamp.protocol(), StampProtocol::DoH);
        assert!(stamp.props().contains(StampProperties::DNSSEC));
        assert!(stamp.props().contains(StampProperties::NO_LOG));
        assert_eq!(stamp.server_addr(), "94.140.14.14");
        assert_eq!(stamp.provider_name(), "dns.adguard.com");
        assert_eq!(stamp.path(), "/dns-query");
        assert_eq!(stamp.hashes().len(), 1);
        assert_eq!(stamp.hashes()[0].len(), 32);
        assert_eq!(stamp.to_string(), ADGUARD_DOH);
    }

    #[test]
    fn encode_then_decode_dnscrypt() {
        let stamp = ServerStamp::new_dnscrypt(
            StampProperties::DNSSEC | StampProperties::NO_FILTER,
            "192.0.2.1:5443",
            &[7u8; 32],
            "2.dnscrypt-cert.example",
        );
        let decoded: ServerStamp = stamp.to_string().parse().unwrap();
        assert_eq!(decoded, stamp);
        assert_eq!(decoded.server_pk(), [7u8; 32]);
    }

    #[test]
    fn bootstrap_ips() {
        let mut stamp = ServerStamp::new_doq(
            StampProperties::default(),
            "",
            "dns.example",
        )
        .with_hash([1u8; 32]);
        stamp.bootstrap_ips = vec!["192.0.2.53".into(), "[::1]".into()];
        let decoded: ServerStamp = stamp.to_string().parse().unwrap();
        assert_eq!(decoded.protocol(), StampProtocol::DoQ);
        assert_eq!(decoded.bootstrap_ips(), ["192.0.2.53", "[::1]"]);
        assert_eq!(decoded.hashes(), [vec![1u8; 32]]);
    }

    #[test]
    fn oversized_fields_are_not_encoded() {
        let stamp = ServerStamp::new_plain(
            StampProperties::default(),
            &"1".repeat(256),
        );
        assert!(matches!(
            stamp.to_sdns(),
            Err(Error::MalformedAddress { .. })
        ));

        let stamp = ServerStamp::new_dot(
            StampProperties::default(),
            "192.0.2.1",
            "dns.example",
        )
        .with_hash([1u8; 128]);
        assert!(stamp.to_sdns().is_err());

        let fits = ServerStamp::new_plain(
            StampProperties::default(),
            &"1".repeat(255),
        );
        let decoded: ServerStamp = fits.to_sdns().unwrap().parse().unwrap();
        assert_eq!(decoded.server_addr().len(), 255);
        assert_eq!(fits.to_sdns().unwrap(), fits.to_string());
    }

    #[test]
    fn reject_garbage() {
        for s in [
            "sdns://",
            "sdns://!!!",
            "sdns://fw",
            "https://dns.example",
        ] {
            assert!(
                matches!(
                    s.parse::<ServerStamp>(),
                    Err(Error::MalformedAddress { .. })
                ),
                "{s}"
            );
        }
    }

    #[test]
    fn reject_trailing_data() {
        let mut bin = ServerStamp::new_plain(
            StampProperties::default(),
            "192.0.2.1",
        )
        .encode()
        .unwrap();
        bin.push(0);
        assert_eq!(ServerStamp::decode(&bin), Err("trailing data"));
    }
}
