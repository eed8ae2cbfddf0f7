//! Resolving the host names of upstream servers.
//!
//! An upstream given by host name needs the addresses of that host before
//! it can connect. These are looked up through a [`BootstrapChain`], an
//! ordered list of [`Resolver`]s built from the bootstrap list of the
//! [`Options`]. Each entry of that list is either empty, standing for the
//! system resolver, or the address of an upstream of its own.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use domain::base::iana::Rtype;
use domain::base::{Message, MessageBuilder, Name};
use domain::rdata::{Aaaa, A};
use futures_util::future;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use crate::error::Error;
use crate::options::Options;
use crate::upstream::{address_to_upstream, Upstream};

/// The future returned by [`Resolver::lookup_host`].
pub type LookupFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<IpAddr>, Error>> + Send + 'a>>;

//------------ Resolver ------------------------------------------------------

/// Something that resolves host names into addresses.
pub trait Resolver: Send + Sync {
    /// Returns the addresses of `host`.
    fn lookup_host<'a>(&'a self, host: &'a str) -> LookupFuture<'a>;

    /// Releases the resources held by the resolver.
    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

//------------ SystemResolver ------------------------------------------------

/// The resolver of the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn lookup_host<'a>(&'a self, host: &'a str) -> LookupFuture<'a> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, 0)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        })
    }
}

//------------ UpstreamResolver ----------------------------------------------

/// A resolver asking an upstream for A and AAAA records.
pub struct UpstreamResolver {
    upstream: Box<dyn Upstream>,
}

impl UpstreamResolver {
    /// Creates a resolver using the given upstream.
    pub fn new(upstream: Box<dyn Upstream>) -> Self {
        UpstreamResolver { upstream }
    }

    /// Returns the upstream used.
    pub fn upstream(&self) -> &dyn Upstream {
        self.upstream.as_ref()
    }

    /// Asks for the records of one type.
    async fn lookup_type(
        &self,
        host: &str,
        rtype: Rtype,
    ) -> Result<Vec<IpAddr>, Error> {
        let request = address_query(host, rtype)?;
        let response = self.upstream.exchange(&request).await?;
        let answer = response.answer()?;
        let mut res = Vec::new();
        if rtype == Rtype::AAAA {
            for record in answer.limit_to::<Aaaa>() {
                res.push(record?.data().addr().into());
            }
        } else {
            for record in answer.limit_to::<A>() {
                res.push(record?.data().addr().into());
            }
        }
        Ok(res)
    }
}

impl Resolver for UpstreamResolver {
    fn lookup_host<'a>(&'a self, host: &'a str) -> LookupFuture<'a> {
        Box::pin(async move {
            if let Ok(addr) = host.parse::<IpAddr>() {
                return Ok(vec![addr]);
            }
            let (v4, v6) = future::join(
                self.lookup_type(host, Rtype::A),
                self.lookup_type(host, Rtype::AAAA),
            )
            .await;
            match (v4, v6) {
                (Ok(mut v4), Ok(v6)) => {
                    v4.extend(v6);
                    Ok(v4)
                }
                (Ok(addrs), Err(err)) | (Err(err), Ok(addrs)) => {
                    trace!(
                        "{}: partial lookup of {host} failed: {err}",
                        self.upstream.address()
                    );
                    Ok(addrs)
                }
                (Err(v4), Err(v6)) => Err(v4.with_errors([v6])),
            }
        })
    }

    fn close(&self) -> Result<(), Error> {
        self.upstream.close()
    }
}

impl fmt::Debug for UpstreamResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResolver")
            .field("upstream", &self.upstream.address())
            .finish()
    }
}

/// Creates a recursive query for the addresses of `host`.
fn address_query(host: &str, rtype: Rtype) -> Result<Message<Bytes>, Error> {
    let name = Name::<Vec<u8>>::from_str(host)
        .map_err(|err| Error::malformed(host, err))?;
    let mut msg = MessageBuilder::new_bytes();
    msg.header_mut().set_random_id();
    msg.header_mut().set_rd(true);
    let mut msg = msg.question();
    msg.push((name, rtype))?;
    Ok(msg.into_message())
}

//------------ BootstrapChain ------------------------------------------------

/// The ordered list of resolvers for an upstream's host name.
pub struct BootstrapChain {
    resolvers: Vec<Box<dyn Resolver>>,
}

impl BootstrapChain {
    /// Builds the chain for the bootstrap list of the options.
    ///
    /// Without any entries, the chain consists of the system resolver.
    /// Empty entries become the system resolver, all others are turned
    /// into upstreams using the options without bootstrap list and server
    /// addresses. If an entry fails, the resolvers built so far are closed
    /// again and the error names the position of the failing entry.
    pub fn new(opts: &Options) -> Result<Self, Error> {
        if opts.bootstrap().is_empty() {
            return Ok(Self::from_resolvers(vec![Box::new(SystemResolver)]));
        }
        let boot_opts = opts.for_bootstrap();
        let mut resolvers: Vec<Box<dyn Resolver>> =
            Vec::with_capacity(opts.bootstrap().len());
        for (index, entry) in opts.bootstrap().iter().enumerate() {
            if entry.is_empty() {
                resolvers.push(Box::new(SystemResolver));
                continue;
            }
            match address_to_upstream(entry, &boot_opts) {
                Ok(upstream) => {
                    debug!("bootstrap resolver at index {index}: {entry}");
                    resolvers.push(Box::new(UpstreamResolver::new(upstream)))
                }
                Err(err) => {
                    let closed = Self::from_resolvers(resolvers).close();
                    return Err(Error::Bootstrap {
                        index,
                        source: Box::new(err.with_errors(closed.err())),
                    });
                }
            }
        }
        Ok(Self::from_resolvers(resolvers))
    }

    /// Creates a chain from the given resolvers.
    pub fn from_resolvers(resolvers: Vec<Box<dyn Resolver>>) -> Self {
        BootstrapChain { resolvers }
    }

    /// Returns the number of resolvers.
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// Returns whether there are no resolvers at all.
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Looks up `host` with all resolvers at once.
    ///
    /// The first non-empty answer wins. If there is none, all the errors
    /// are returned together.
    pub async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        if let [resolver] = self.resolvers.as_slice() {
            let addrs = resolver.lookup_host(host).await?;
            if addrs.is_empty() {
                return Err(Error::NoAddresses(host.into()));
            }
            return Ok(addrs);
        }

        let mut lookups: FuturesUnordered<_> = self
            .resolvers
            .iter()
            .map(|resolver| resolver.lookup_host(host))
            .collect();
        let mut errors = Vec::new();
        while let Some(res) = lookups.next().await {
            match res {
                Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                Ok(_) => errors.push(Error::NoAddresses(host.into())),
                Err(err) => errors.push(err),
            }
        }
        match Error::join(errors) {
            Err(err) => Err(err),
            Ok(()) => Err(Error::NoAddresses(host.into())),
        }
    }

    /// Closes all resolvers.
    ///
    /// Every resolver is closed even if an earlier one fails.
    pub fn close(&self) -> Result<(), Error> {
        Error::join(
            self.resolvers
                .iter()
                .filter_map(|resolver| resolver.close().err()),
        )
    }
}

impl fmt::Debug for BootstrapChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapChain")
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

/// Orders addresses so that the preferred family comes first.
///
/// The order within each family is kept.
pub(crate) fn sort_addrs(addrs: &mut [IpAddr], prefer_ipv6: bool) {
    addrs.sort_by_key(|addr| addr.is_ipv6() != prefer_ipv6)
}

//============ Tests =========================================================
