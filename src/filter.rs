//! Detecting bogus NXDOMAIN responses.
//!
//! Some resolvers answer queries for non-existing names with the address
//! of a server of their own, for instance to show advertisements, instead
//! of NXDOMAIN. [`BogusNxDomain`] recognizes such responses from a list of
//! subnets these addresses are taken from.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use bytes::Bytes;
use domain::base::iana::Rtype;
use domain::base::Message;
use domain::rdata::{Aaaa, A};

use crate::error::Error;

//------------ Subnet --------------------------------------------------------

/// An IP prefix.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Subnet {
    /// The address with all bits past the prefix cleared.
    addr: IpAddr,

    /// The prefix length.
    len: u8,
}

impl Subnet {
    /// Creates a subnet from an address and prefix length.
    ///
    /// Returns `None` if the prefix is too long for the address family.
    pub fn new(addr: IpAddr, len: u8) -> Option<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if len > max {
            return None;
        }
        Some(Subnet {
            addr: mask(addr, len),
            len,
        })
    }

    /// Returns the network address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Returns the prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Returns whether the subnet contains `addr`.
    ///
    /// IPv4-mapped IPv6 addresses are matched against IPv4 subnets.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V6(v6) if self.addr.is_ipv4() => match v6.to_ipv4_mapped()
            {
                Some(v4) => IpAddr::V4(v4),
                None => return false,
            },
            addr => addr,
        };
        addr.is_ipv4() == self.addr.is_ipv4()
            && mask(addr, self.len) == self.addr
    }
}

impl FromStr for Subnet {
    type Err = Error;

    /// Parses `addr/len` or a single address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (
                addr,
                Some(len.parse::<u8>().map_err(|err| Error::malformed(s, err))?),
            ),
            None => (s, None),
        };
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|err| Error::malformed(s, err))?;
        let len = len.unwrap_or(if addr.is_ipv4() { 32 } else { 128 });
        Subnet::new(addr, len)
            .ok_or_else(|| Error::malformed(s, "prefix length too long"))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Clears all bits of `addr` past the first `len`.
fn mask(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0);
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask =
                u128::MAX.checked_shl(128 - u32::from(len)).unwrap_or(0);
            IpAddr::V6((bits & mask).into())
        }
    }
}

//------------ BogusNxDomain -------------------------------------------------

/// Recognizes responses pointing into known bogus subnets.
#[derive(Clone, Debug, Default)]
pub struct BogusNxDomain {
    subnets: Vec<Subnet>,
}

impl BogusNxDomain {
    /// Creates a filter for the given subnets.
    pub fn new(subnets: impl IntoIterator<Item = Subnet>) -> Self {
        BogusNxDomain {
            subnets: subnets.into_iter().collect(),
        }
    }

    /// Returns the subnets.
    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    /// Returns whether `addr` is in one of the subnets.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.subnets.iter().any(|net| net.contains(addr))
    }

    /// Returns whether the response is a bogus answer.
    ///
    /// This is the case if the first question asks for A or AAAA records
    /// and at least one address record in the answer section is in one of
    /// the subnets. Records that fail to parse are skipped.
    pub fn is_bogus(&self, response: &Message<Bytes>) -> bool {
        if self.subnets.is_empty() {
            return false;
        }
        match response.first_question() {
            Some(question)
                if question.qtype() == Rtype::A
                    || question.qtype() == Rtype::AAAA => {}
            _ => return false,
        }
        let answer = match response.answer() {
            Ok(answer) => answer,
            Err(_) => return false,
        };
        answer.filter_map(Result::ok).any(|record| {
            let addr = if record.rtype() == Rtype::A {
                record
                    .to_record::<A>()
                    .ok()
                    .flatten()
                    .map(|record| IpAddr::from(record.data().addr()))
            } else if record.rtype() == Rtype::AAAA {
                record
                    .to_record::<Aaaa>()
                    .ok()
                    .flatten()
                    .map(|record| IpAddr::from(record.data().addr()))
            } else {
                None
            };
            addr.is_some_and(|addr| self.contains(addr))
        })
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use domain::base::{MessageBuilder, Name};

    fn response(qtype: Rtype, addrs: &[&str]) -> Message<Bytes> {
        let name = Name::<Vec<u8>>::from_str("example.com").unwrap();
        let mut msg = MessageBuilder::new_bytes().question();
        msg.push((&name, qtype)).unwrap();
        let mut msg = msg.answer();
        for addr in addrs {
            match addr.parse::<IpAddr>().unwrap() {
                IpAddr::V4(v4) => msg
                    .push((&name, 60, A::new(v4)))
                    .unwrap(),
                IpAddr::V6(v6) => msg
                    .push((&name, 60, Aaaa::new(v6)))
                    .unwrap(),
            }
        }
        msg.into_message()
    }

    fn filter(subnets: &[&str]) -> BogusNxDomain {
        BogusNxDomain::new(subnets.iter().map(|s| s.parse().unwrap()))
    }

    #[test]
    fn subnets() {
        let net: Subnet = "192.0.2.77/24".parse().unwrap();
        assert_eq!(net.to_string(), "192.0.2.0/24");
        assert!(net.contains("192.0.2.1".parse().unwrap()));
        assert!(net.contains("::ffff:192.0.2.1".parse().unwrap()));
        assert!(!net.contains("192.0.3.1".parse().unwrap()));
        assert!(!net.contains("2001:db8::1".parse().unwrap()));

        let host: Subnet = "2001:db8::1".parse().unwrap();
        assert_eq!(host.prefix_len(), 128);
        assert!(host.contains("2001:db8::1".parse().unwrap()));
        assert!(!host.contains("2001:db8::2".parse().unwrap()));

        let all: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains("203.0.113.1".parse().unwrap()));

        assert!("192.0.2.0/33".parse::<Subnet>().is_err());
        assert!("192.0.2.0/x".parse::<Subnet>().is_err());
    }

    #[test]
    fn bogus_answers() {
        let filter = filter(&["192.0.2.0/24", "2001:db8::/32"]);
        assert!(filter.is_bogus(&response(Rtype::A, &["192.0.2.10"])));
        assert!(filter.is_bogus(&response(
            Rtype::AAAA,
            &["2001:4860::1", "2001:db8::53"]
        )));
        assert!(!filter.is_bogus(&response(Rtype::A, &["198.51.100.1"])));
        assert!(filter.is_bogus(&response(
            Rtype::A,
            &["198.51.100.1", "2001:4860::1", "2001:db8::1"]
        )));
        assert!(!filter.is_bogus(&response(Rtype::A, &[])));
        assert!(!filter.is_bogus(&response(Rtype::TXT, &["192.0.2.10"])));
        assert!(!BogusNxDomain::default()
            .is_bogus(&response(Rtype::A, &["192.0.2.10"])));
    }
}
