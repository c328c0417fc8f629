//! Synthetic loopback addresses.
//!
//! Every tunnel gets an address inside `127.244.0.0/16` derived from a
//! stable cluster identity, so the same service lands on the same address
//! on every run without any persisted state.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// First two octets of every allocated address
pub const ADDRESS_PREFIX: [u8; 2] = [127, 244];

/// Local address of a tunnel; also its identity when diffing tunnel sets.
///
/// Two identities hashing to the same host part share an address. That is
/// not detected: the later tunnel simply overwrites the earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(Ipv4Addr);

impl Address {
    /// Map an identity (pod FQDN or cluster IP) to its address
    pub fn allocate(identity: &str) -> Self {
        let digest = Sha256::digest(identity.as_bytes());
        Self(Ipv4Addr::new(
            ADDRESS_PREFIX[0],
            ADDRESS_PREFIX[1],
            digest[2],
            digest[3],
        ))
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.0
    }
}

impl From<Address> for Ipv4Addr {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
