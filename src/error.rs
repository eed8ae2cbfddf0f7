//! Error type for upstreams.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use domain::base::message::ShortMessage;
use domain::base::message_builder::PushError;
use domain::base::wire::ParseError;

/// A boxed error as returned by user-supplied hooks.
pub type BoxError = Box<dyn error::Error + Send + Sync>;

/// A shared error from a foreign crate.
pub type SharedError = Arc<dyn error::Error + Send + Sync>;

//------------ Error ---------------------------------------------------------

/// Error type for constructing and using upstreams.
///
/// Every variant names the stage it originates from: parsing the address,
/// dispatching to a transport, building the bootstrap resolvers, resolving
/// the upstream's host name, or talking to the upstream.
#[derive(Clone, Debug)]
pub enum Error {
    /// The address or stamp could not be parsed.
    MalformedAddress {
        /// The offending input.
        input: String,

        /// What is wrong with it.
        reason: String,
    },

    /// The URL scheme has no transport.
    UnsupportedScheme(String),

    /// The stamp protocol has no transport.
    UnsupportedProtocol(String),

    /// The transport needs a cargo feature that is not enabled.
    FeatureDisabled(&'static str),

    /// Preparing the bootstrap resolver at the given index failed.
    Bootstrap {
        /// Position of the failing entry in the bootstrap list.
        index: usize,

        /// The cause, joined with any error from closing earlier entries.
        source: Box<Error>,
    },

    /// Resolving the upstream's host name failed.
    Resolution {
        /// The host name that was resolved.
        host: String,

        /// Why it failed.
        source: Box<Error>,
    },

    /// A lookup succeeded but yielded no addresses.
    NoAddresses(String),

    /// Connecting to an address failed.
    Dial {
        /// The address that was dialed.
        addr: SocketAddr,

        /// The error from the socket.
        source: Arc<io::Error>,
    },

    /// Reading from or writing to the upstream failed.
    Io(Arc<io::Error>),

    /// The operation did not complete within the configured timeout.
    Timeout,

    /// Setting up TLS failed.
    Tls(Arc<rustls::Error>),

    /// The host cannot be used as a TLS server name.
    InvalidServerName(String),

    /// The HTTP exchange failed.
    Http(SharedError),

    /// The HTTP server answered with a status other than 200.
    HttpStatus(http::StatusCode),

    /// The QUIC exchange failed.
    Quic(SharedError),

    /// The DNSCrypt exchange failed.
    DnsCrypt(String),

    /// A verification hook rejected the peer.
    Rejected(SharedError),

    /// Building a message failed.
    MessageBuilder,

    /// Octet sequence too short to be a valid DNS message.
    ShortMessage,

    /// A reply could not be parsed.
    MalformedReply,

    /// Reply does not match the query.
    WrongReplyForQuery,

    /// The upstream was used after it had been closed.
    Closed,

    /// Several errors occured.
    Multiple(Vec<Error>),
}

impl Error {
    /// Joins a set of errors into one.
    ///
    /// Returns `Ok(())` if there are none. A single error is returned as
    /// is.
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Result<(), Error> {
        let mut errors: Vec<_> = errors.into_iter().collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// Adds further errors to this one.
    ///
    /// The result is `self` if there are no other errors.
    pub(crate) fn with_errors(
        self,
        others: impl IntoIterator<Item = Error>,
    ) -> Self {
        let mut errors = vec![self];
        errors.extend(others);
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Error::Multiple(errors)
        }
    }

    /// Creates a malformed address error.
    pub(crate) fn malformed(
        input: impl Into<String>,
        reason: impl Display,
    ) -> Self {
        Error::MalformedAddress {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    /// Wraps a QUIC error.
    pub(crate) fn quic(
        err: impl error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Quic(Arc::new(err))
    }

    /// Wraps an HTTP error.
    pub(crate) fn http(
        err: impl error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Http(Arc::new(err))
    }

    /// Returns whether the error came from a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Resolution { source, .. } => source.is_timeout(),
            Error::Io(err) => err.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::MalformedAddress { input, reason } => {
                write!(f, "invalid address {input}: {reason}")
            }
            Error::UnsupportedScheme(scheme) => {
                write!(f, "unsupported url scheme: {scheme}")
            }
            Error::UnsupportedProtocol(proto) => {
                write!(f, "unsupported stamp protocol {proto}")
            }
            Error::FeatureDisabled(feature) => {
                write!(f, "transport needs the {feature} feature")
            }
            Error::Bootstrap { index, source } => write!(
                f,
                "preparing bootstrap resolver at index {index}: {source}"
            ),
            Error::Resolution { host, source } => {
                write!(f, "creating dial handler for {host}: {source}")
            }
            Error::NoAddresses(host) => {
                write!(f, "no addresses resolved for {host}")
            }
            Error::Dial { addr, source } => {
                write!(f, "dialing {addr}: {source}")
            }
            Error::Io(err) => write!(f, "{err}"),
            Error::Timeout => write!(f, "timeout waiting for response"),
            Error::Tls(err) => write!(f, "tls: {err}"),
            Error::InvalidServerName(name) => {
                write!(f, "invalid tls server name {name}")
            }
            Error::Http(err) => write!(f, "http: {err}"),
            Error::HttpStatus(status) => {
                write!(f, "expected status 200, got {status}")
            }
            Error::Quic(err) => write!(f, "quic: {err}"),
            Error::DnsCrypt(reason) => write!(f, "dnscrypt: {reason}"),
            Error::Rejected(err) => write!(f, "verification failed: {err}"),
            Error::MessageBuilder => {
                write!(f, "PushError from MessageBuilder")
            }
            Error::ShortMessage => {
                write!(f, "octet sequence to short to be a valid message")
            }
            Error::MalformedReply => write!(f, "malformed reply"),
            Error::WrongReplyForQuery => {
                write!(f, "reply does not match query")
            }
            Error::Closed => write!(f, "upstream is closed"),
            Error::Multiple(errors) => {
                let mut first = true;
                for err in errors {
                    if !first {
                        writeln!(f)?;
                    }
                    first = false;
                    write!(f, "{err}")?;
                }
                Ok(())
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Bootstrap { source, .. } => Some(source.as_ref()),
            Error::Resolution { source, .. } => Some(source.as_ref()),
            Error::Dial { source, .. } => Some(source.as_ref()),
            Error::Io(err) => Some(err.as_ref()),
            Error::Tls(err) => Some(err.as_ref()),
            Error::Http(err) => Some(err.as_ref()),
            Error::Quic(err) => Some(err.as_ref()),
            Error::Rejected(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

//--- From

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(Arc::new(err))
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::http(err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::http(err)
    }
}

impl From<ShortMessage> for Error {
    fn from(_: ShortMessage) -> Self {
        Error::ShortMessage
    }
}

impl From<ParseError> for Error {
    fn from(_: ParseError) -> Self {
        Error::MalformedReply
    }
}

impl From<PushError> for Error {
    fn from(_: PushError) -> Self {
        Error::MessageBuilder
    }
}

//============ Tests =========================================================
