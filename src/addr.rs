//! Parsing upstream addresses.
//!
//! An upstream is given either as a URL, as a DNS stamp, or as a bare
//! `host[:port]` which means plain DNS over UDP. The recognized forms are:
//!
//! * `udp://host[:53]`, `tcp://host[:53]`, or `host[:53]` for plain DNS,
//! * `tls://host[:853]` for DNS-over-TLS,
//! * `https://host[:443]/path` for DNS-over-HTTPS,
//! * `h3://host[:443]/path` for DNS-over-HTTPS using HTTP/3 only,
//! * `quic://host[:853]` for DNS-over-QUIC,
//! * `sdns://…` for a DNS stamp.
//!
//! Parsing never performs any I/O. Missing ports are filled in with the
//! default port of the protocol.

use std::fmt;
use std::net::IpAddr;

use url::{Host, Url};

use crate::error::Error;
use crate::options::{HttpVersion, Options};
use crate::stamp::{ServerStamp, StampProtocol, STAMP_PREFIX};

//------------ Default Ports -------------------------------------------------

/// The default port for plain DNS.
pub const DEFAULT_PORT_PLAIN: u16 = 53;

/// The default port for DNS-over-HTTPS.
pub const DEFAULT_PORT_DOH: u16 = 443;

/// The default port for DNS-over-TLS.
pub const DEFAULT_PORT_DOT: u16 = 853;

/// The default port for DNS-over-QUIC.
///
/// See RFC 9250, section 4.1.1. Early drafts used 8853 and 784.
pub const DEFAULT_PORT_DOQ: u16 = 853;

/// The default port of a DNSCrypt server given in a stamp.
pub const DEFAULT_PORT_DNSCRYPT: u16 = 443;

//------------ Protocol ------------------------------------------------------

/// The transport protocol of an upstream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    /// Plain DNS over UDP.
    Udp,

    /// Plain DNS over TCP.
    Tcp,

    /// DNS-over-TLS.
    Tls,

    /// DNS-over-HTTPS.
    Https,

    /// DNS-over-QUIC.
    Quic,

    /// DNSCrypt.
    DnsCrypt,
}

impl Protocol {
    /// Returns the port used if the address doesn't have one.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Udp | Protocol::Tcp => DEFAULT_PORT_PLAIN,
            Protocol::Tls => DEFAULT_PORT_DOT,
            Protocol::Https => DEFAULT_PORT_DOH,
            Protocol::Quic => DEFAULT_PORT_DOQ,
            Protocol::DnsCrypt => DEFAULT_PORT_DNSCRYPT,
        }
    }

    /// Returns the URL scheme of the protocol.
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Https => "https",
            Protocol::Quic => "quic",
            Protocol::DnsCrypt => "sdns",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

//------------ AddressSpec ---------------------------------------------------

/// A parsed upstream address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressSpec {
    /// The transport protocol.
    protocol: Protocol,

    /// The host without brackets.
    host: String,

    /// The port, with the default filled in.
    port: u16,

    /// The path for protocols that have one.
    path: String,

    /// The string the address was parsed from.
    raw: String,
}

impl AddressSpec {
    /// Parses an upstream address.
    ///
    /// Parsing may change the options. An `h3://` address restricts the
    /// HTTP versions to HTTP/3. A stamp with a server address replaces the
    /// server addresses of the options with that single address.
    pub fn parse(addr: &str, opts: &mut Options) -> Result<Self, Error> {
        if addr.starts_with(STAMP_PREFIX) {
            Self::from_stamp(addr, opts)
        } else if addr.contains("://") {
            let url = Url::parse(addr).map_err(|err| {
                Error::malformed(addr, format_args!("parsing url: {err}"))
            })?;
            Self::from_url(addr, &url, opts)
        } else {
            Self::from_bare(addr)
        }
    }

    /// Creates an address from a URL.
    fn from_url(
        addr: &str,
        url: &Url,
        opts: &mut Options,
    ) -> Result<Self, Error> {
        let protocol = match url.scheme() {
            "udp" => Protocol::Udp,
            "tcp" => Protocol::Tcp,
            "tls" => Protocol::Tls,
            "https" => Protocol::Https,
            "h3" => {
                opts.set_http_versions([HttpVersion::Http3]);
                Protocol::Https
            }
            "quic" => Protocol::Quic,
            scheme => return Err(Error::UnsupportedScheme(scheme.into())),
        };
        let host = match url.host() {
            Some(Host::Domain(name)) if !name.is_empty() => name.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(Error::malformed(addr, "missing host")),
        };
        Ok(AddressSpec {
            protocol,
            host,
            port: url.port().unwrap_or(protocol.default_port()),
            path: url.path().into(),
            raw: addr.into(),
        })
    }

    /// Creates a plain UDP address from `host[:port]`.
    fn from_bare(addr: &str) -> Result<Self, Error> {
        let (host, port) =
            split_host_port(addr).map_err(|err| Error::malformed(addr, err))?;
        Ok(AddressSpec {
            protocol: Protocol::Udp,
            host: host.into(),
            port: port.unwrap_or(DEFAULT_PORT_PLAIN),
            path: String::new(),
            raw: addr.into(),
        })
    }

    /// Creates an address from a DNS stamp.
    fn from_stamp(addr: &str, opts: &mut Options) -> Result<Self, Error> {
        let stamp: ServerStamp = addr.parse()?;

        // The stamp's address replaces whatever addresses were configured.
        if !stamp.server_addr().is_empty() {
            let host = split_host_port(stamp.server_addr())
                .map(|(host, _)| host)
                .unwrap_or(stamp.server_addr());
            let ip = host.parse::<IpAddr>().map_err(|_| {
                Error::malformed(
                    addr,
                    format_args!(
                        "invalid server stamp address {}",
                        stamp.server_addr()
                    ),
                )
            })?;
            opts.set_server_ip_addrs([ip]);
        }

        let (protocol, authority, path) = match stamp.protocol() {
            StampProtocol::Plain => (Protocol::Udp, stamp.server_addr(), ""),
            StampProtocol::DnsCrypt => {
                (Protocol::DnsCrypt, stamp.server_addr(), "")
            }
            StampProtocol::DoH => {
                (Protocol::Https, stamp.provider_name(), stamp.path())
            }
            StampProtocol::DoQ => {
                (Protocol::Quic, stamp.provider_name(), stamp.path())
            }
            StampProtocol::Tls => (Protocol::Tls, stamp.provider_name(), ""),
            other => {
                return Err(Error::UnsupportedProtocol(other.to_string()))
            }
        };
        let (host, port) = split_host_port(authority)
            .map_err(|err| Error::malformed(addr, err))?;
        Ok(AddressSpec {
            protocol,
            host: host.into(),
            port: port.unwrap_or(protocol.default_port()),
            path: path.into(),
            raw: addr.into(),
        })
    }

    /// Returns the transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the host.
    ///
    /// IPv6 addresses are returned without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the string the address was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns the host as an IP address if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Returns `host:port` with IPv6 hosts in brackets.
    pub fn authority(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::DnsCrypt => f.write_str(&self.raw),
            proto => {
                write!(f, "{}://{}{}", proto, self.authority(), self.path)
            }
        }
    }
}

//------------ Helpers -------------------------------------------------------

/// Joins host and port, putting IPv6 hosts in brackets.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Splits `host[:port]`.
///
/// The host may be a bare IPv6 address without port or an IPv6 address in
/// brackets with or without port.
fn split_host_port(addr: &str) -> Result<(&str, Option<u16>), String> {
    if addr.parse::<IpAddr>().is_ok() {
        return Ok((addr, None));
    }
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| String::from("missing ']' in address"))?;
        if tail.is_empty() {
            (host, None)
        } else {
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| String::from("unexpected text after ']'"))?;
            (host, Some(port))
        }
    } else {
        match addr.split_once(':') {
            Some((host, port)) if !port.contains(':') => (host, Some(port)),
            Some(_) => return Err("too many colons in address".into()),
            None => (addr, None),
        }
    };
    if host.is_empty() {
        return Err("missing host".into());
    }
    let port = match port {
        Some(port) => Some(
            port.parse::<u16>()
                .map_err(|err| format!("invalid port {port:?}: {err}"))?,
        ),
        None => None,
    };
    Ok((host, port))
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::stamp::StampProperties;
    use rstest::rstest;

    fn parse(addr: &str) -> Result<AddressSpec, Error> {
        AddressSpec::parse(addr, &mut Options::new())
    }

    #[rstest]
    #[case("udp://8.8.8.8:53", Protocol::Udp, "8.8.8.8:53")]
    #[case("1.1.1.1", Protocol::Udp, "1.1.1.1:53")]
    #[case("dns.example:5353", Protocol::Udp, "dns.example:5353")]
    #[case("2001:db8::1", Protocol::Udp, "[2001:db8::1]:53")]
    #[case("[2001:db8::1]:5353", Protocol::Udp, "[2001:db8::1]:5353")]
    #[case("tcp://1.1.1.1", Protocol::Tcp, "1.1.1.1:53")]
    #[case("tls://dns.example", Protocol::Tls, "dns.example:853")]
    #[case("tls://[2001:db8::1]", Protocol::Tls, "[2001:db8::1]:853")]
    #[case("https://dns.example/dns-query", Protocol::Https, "dns.example:443")]
    #[case("https://dns.example:8443/q", Protocol::Https, "dns.example:8443")]
    #[case("h3://dns.example/dns-query", Protocol::Https, "dns.example:443")]
    #[case("quic://dns.example", Protocol::Quic, "dns.example:853")]
    #[case("quic://dns.example:784", Protocol::Quic, "dns.example:784")]
    fn default_ports(
        #[case] addr: &str,
        #[case] protocol: Protocol,
        #[case] authority: &str,
    ) {
        let spec = parse(addr).unwrap();
        assert_eq!(spec.protocol(), protocol);
        assert_eq!(spec.authority(), authority);
        assert_eq!(spec.raw(), addr);
    }

    #[rstest]
    #[case("1.1.1.1:99999")]
    #[case("1.1.1.1:dns")]
    #[case("dns.example:53:53")]
    #[case("[2001:db8::1")]
    #[case(":53")]
    #[case("udp://1.1.1.1:70000")]
    #[case("https://")]
    fn malformed(#[case] addr: &str) {
        match parse(addr) {
            Err(Error::MalformedAddress { input, .. }) => {
                assert_eq!(input, addr)
            }
            other => panic!("{addr}: unexpected {other:?}"),
        }
    }

    #[test]
    fn unsupported_scheme() {
        assert!(matches!(
            parse("ftp://dns.example"),
            Err(Error::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
    }

    #[test]
    fn h3_restricts_http_versions() {
        let mut opts = Options::new();
        let spec =
            AddressSpec::parse("h3://dns.example/dns-query", &mut opts)
                .unwrap();
        assert_eq!(spec.path(), "/dns-query");
        assert_eq!(opts.http_versions(), [HttpVersion::Http3]);
        assert_eq!(spec.to_string(), "https://dns.example:443/dns-query");
    }

    #[test]
    fn stamp_address_replaces_server_addrs() {
        let stamp = ServerStamp::new_doh(
            StampProperties::DNSSEC,
            "94.140.14.14",
            "dns.example",
            "/dns-query",
        );
        let mut opts = Options::new();
        opts.set_server_ip_addrs(["9.9.9.9".parse().unwrap()]);

        let spec =
            AddressSpec::parse(&stamp.to_string(), &mut opts).unwrap();
        assert_eq!(spec.protocol(), Protocol::Https);
        assert_eq!(spec.authority(), "dns.example:443");
        assert_eq!(spec.path(), "/dns-query");
        assert_eq!(
            opts.server_ip_addrs(),
            ["94.140.14.14".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn stamp_without_address_keeps_server_addrs() {
        let stamp = ServerStamp::new_dot(
            StampProperties::default(),
            "",
            "dns.example:8853",
        );
        let mut opts = Options::new();
        opts.set_server_ip_addrs(["9.9.9.9".parse().unwrap()]);

        let spec =
            AddressSpec::parse(&stamp.to_string(), &mut opts).unwrap();
        assert_eq!(spec.protocol(), Protocol::Tls);
        assert_eq!(spec.authority(), "dns.example:8853");
        assert_eq!(
            opts.server_ip_addrs(),
            ["9.9.9.9".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn stamp_with_hostname_address_is_malformed() {
        let stamp = ServerStamp::new_plain(
            StampProperties::default(),
            "dns.example:53",
        );
        assert!(matches!(
            parse(&stamp.to_string()),
            Err(Error::MalformedAddress { .. })
        ));
    }

    #[test]
    fn plain_stamp() {
        let stamp =
            ServerStamp::new_plain(StampProperties::default(), "8.8.8.8");
        let spec = parse(&stamp.to_string()).unwrap();
        assert_eq!(spec.protocol(), Protocol::Udp);
        assert_eq!(spec.authority(), "8.8.8.8:53");
    }

    #[test]
    fn relay_stamp_is_unsupported() {
        let stamp = ServerStamp::new_dnscrypt_relay("192.0.2.1:443");
        assert!(matches!(
            parse(&stamp.to_string()),
            Err(Error::UnsupportedProtocol(_))
        ));
    }
}
