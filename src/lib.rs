//! DNS upstreams for Rust.
//!
//! This crate provides clients for sending DNS requests to upstream
//! servers over the common transports. An upstream is created from its
//! address, which picks the transport:
//!
//! | Address                    | Transport            |
//! |----------------------------|----------------------|
//! | `8.8.8.8`, `udp://8.8.8.8` | plain DNS over UDP   |
//! | `tcp://8.8.8.8`            | plain DNS over TCP   |
//! | `tls://dns.adguard.com`    | DNS-over-TLS         |
//! | `https://dns.google/dns-query` | DNS-over-HTTPS   |
//! | `h3://dns.google/dns-query`    | DNS-over-HTTPS with HTTP/3 |
//! | `quic://dns.adguard.com`   | DNS-over-QUIC        |
//! | `sdns://...`               | the transport of the DNS stamp |
//!
//! Upstreams whose server is given by host name resolve that name on the
//! first exchange through the bootstrap resolvers of the [`Options`]. These
//! are either the system resolver or further upstreams given by IP
//! address.
//!
//! # Modules
//!
//! * [upstream] contains the [`Upstream`] trait and the transports,
//! * [addr] and [stamp] parse upstream addresses and DNS stamps,
//! * [bootstrap], [dialer], and [dial] turn host names into connections,
//! * [filter] recognizes bogus NXDOMAIN answers.
//!
//! # Feature Flags
//!
//! Both features are enabled by default.
//!
//! * `dnscrypt`: enables DNSCrypt upstreams given by DNS stamps. Without
//!   it, such stamps are rejected with [`Error::FeatureDisabled`].
//! * `http3`: enables HTTP/3 for DNS-over-HTTPS. Without it, `h3://`
//!   addresses are rejected with [`Error::FeatureDisabled`].
//!
//! # Logging
//!
//! The crate logs through [tracing](https://docs.rs/tracing). Every
//! exchange is logged at debug level before the request is sent and after
//! the response arrived or the exchange failed.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod addr;
pub mod bootstrap;
pub mod dial;
pub mod dialer;
pub mod error;
pub mod filter;
pub mod options;
pub mod stamp;
pub mod tls;
pub mod upstream;

pub use crate::addr::{AddressSpec, Protocol};
pub use crate::bootstrap::{
    BootstrapChain, Resolver, SystemResolver, UpstreamResolver,
};
pub use crate::dial::{DialHandler, Network};
pub use crate::dialer::DialerInitializer;
pub use crate::error::Error;
pub use crate::filter::{BogusNxDomain, Subnet};
pub use crate::options::{HttpVersion, Options};
pub use crate::stamp::{ServerStamp, StampProtocol};
pub use crate::upstream::{address_to_upstream, Upstream};
