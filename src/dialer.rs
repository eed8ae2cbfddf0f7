//! Lazily resolving an upstream's address exactly once.

use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use crate::addr::AddressSpec;
use crate::bootstrap::{sort_addrs, BootstrapChain};
use crate::dial::{with_timeout, DialHandler};
use crate::error::Error;
use crate::options::Options;

//------------ DialerInitializer ---------------------------------------------

/// Provides the dial handler of an upstream.
///
/// If the addresses of the upstream server are known up front, either
/// because the options list them or because the host is an IP address,
/// the handler is created right away. Otherwise the host name is resolved
/// through the bootstrap chain on first use and the handler is kept for
/// all later uses. Failed resolutions are not remembered.
///
/// Concurrent first uses may each resolve the host. Only the first handler
/// to be stored is kept and returned to all of them.
pub struct DialerInitializer {
    inner: Inner,
}

enum Inner {
    /// The handler is known.
    Static(DialHandler),

    /// The handler is created on first use.
    Lazy(Lazy),
}

struct Lazy {
    /// The host to resolve.
    host: String,

    /// The port of the upstream server.
    port: u16,

    /// Timeout for resolving and for each connection attempt.
    timeout: Duration,

    /// Whether IPv6 addresses are tried first.
    prefer_ipv6: bool,

    /// The resolvers for the host.
    chain: BootstrapChain,

    /// The handler once it has been created.
    handler: OnceLock<DialHandler>,
}

impl DialerInitializer {
    /// Creates the initializer for an upstream address.
    ///
    /// This builds the bootstrap chain if one is needed and fails if that
    /// fails. No I/O happens here.
    pub fn new(spec: &AddressSpec, opts: &Options) -> Result<Self, Error> {
        if !opts.server_ip_addrs().is_empty() {
            let addrs = opts
                .server_ip_addrs()
                .iter()
                .map(|ip| SocketAddr::new(*ip, spec.port()))
                .collect();
            return Ok(Self::fixed(spec.host(), addrs, opts.timeout()));
        }
        if let Some(ip) = spec.ip() {
            return Ok(Self::fixed(
                spec.host(),
                vec![SocketAddr::new(ip, spec.port())],
                opts.timeout(),
            ));
        }
        Ok(Self::with_chain(spec, opts, BootstrapChain::new(opts)?))
    }

    /// Creates an initializer resolving through the given chain.
    pub fn with_chain(
        spec: &AddressSpec,
        opts: &Options,
        chain: BootstrapChain,
    ) -> Self {
        DialerInitializer {
            inner: Inner::Lazy(Lazy {
                host: spec.host().into(),
                port: spec.port(),
                timeout: opts.timeout(),
                prefer_ipv6: opts.prefer_ipv6(),
                chain,
                handler: OnceLock::new(),
            }),
        }
    }

    /// Creates an initializer with a known handler.
    fn fixed(host: &str, addrs: Vec<SocketAddr>, timeout: Duration) -> Self {
        DialerInitializer {
            inner: Inner::Static(DialHandler::new(host, addrs, timeout)),
        }
    }

    /// Returns whether the handler was known from the start.
    pub fn is_static(&self) -> bool {
        matches!(self.inner, Inner::Static(_))
    }

    /// Returns the dial handler, resolving the host if necessary.
    pub async fn get(&self) -> Result<DialHandler, Error> {
        let lazy = match &self.inner {
            Inner::Static(handler) => return Ok(handler.clone()),
            Inner::Lazy(lazy) => lazy,
        };
        if let Some(handler) = lazy.handler.get() {
            return Ok(handler.clone());
        }

        let mut addrs =
            with_timeout(lazy.timeout, lazy.chain.lookup_host(&lazy.host))
                .await
                .map_err(|err| Error::Resolution {
                    host: lazy.host.clone(),
                    source: Box::new(err),
                })?;
        sort_addrs(&mut addrs, lazy.prefer_ipv6);
        debug!("{}: resolved to {:?}", lazy.host, addrs);

        let handler = DialHandler::new(
            lazy.host.as_str(),
            addrs
                .into_iter()
                .map(|ip| SocketAddr::new(ip, lazy.port))
                .collect(),
            lazy.timeout,
        );
        Ok(lazy.handler.get_or_init(|| handler).clone())
    }

    /// Closes the bootstrap chain, if there is one.
    pub fn close(&self) -> Result<(), Error> {
        match &self.inner {
            Inner::Static(_) => Ok(()),
            Inner::Lazy(lazy) => lazy.chain.close(),
        }
    }
}

impl fmt::Debug for DialerInitializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Static(handler) => {
                f.debug_tuple("DialerInitializer").field(handler).finish()
            }
            Inner::Lazy(lazy) => f
                .debug_struct("DialerInitializer")
                .field("host", &lazy.host)
                .field("port", &lazy.port)
                .field("chain", &lazy.chain)
                .field("handler", &lazy.handler.get())
                .finish(),
        }
    }
}

//============ Tests =========================================================
