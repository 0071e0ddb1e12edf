//! Networking utilities for the relay.
//!
//! This library provides helpers for:
//! - Parsing IPv6 prefixes in CIDR notation
//! - Validating a subnet that can carry an embedded IPv4 address
//! - Synthesizing per-client 4-in-6 source addresses

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// Number of trailing bits an embedded IPv4 address occupies.
pub const EMBEDDED_IPV4_BITS: u8 = 32;

/// Longest prefix that still leaves room for an embedded IPv4 address.
pub const MAX_EMBEDDING_PREFIX_LEN: u8 = 128 - EMBEDDED_IPV4_BITS;

/// Byte offset at which the IPv4 address is written into a synthesized address.
const EMBEDDING_OFFSET: usize = 12;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IPv6 address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Prefix leaves no room for an IPv4 address.
    #[error("subnet mask /{len} is too long; must be at most {max} bits to fit IPv4 addresses")]
    PrefixTooLong { len: u8, max: u8 },

    /// A zero-length prefix would let clients pick arbitrary sources.
    #[error("subnet mask /0 is not a usable subnet")]
    EmptyPrefix,
}

// ============================================================================
// IPv6 prefixes
// ============================================================================

/// IPv6 prefix in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Prefix {
    /// Base address of the prefix (host bits cleared).
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 96 for /96).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        // Mask the address to the prefix
        let masked = mask_ipv6(address, prefix_len);

        Ok(Self {
            address: masked,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "64:ff9b::/96").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv6Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let masked = mask_ipv6(addr, self.prefix_len);
        masked == self.address
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// 4-in-6 source subnets
// ============================================================================

/// An IPv6 subnet used as the source range for outbound connections.
///
/// Each client's IPv4 address is written into the last 32 bits of the
/// prefix, so backends see a distinct, stable IPv6 source per client.
/// The embedding offset is fixed; for prefixes shorter than /96 the bits
/// between the mask boundary and the embedded address are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetSpec {
    prefix: Ipv6Prefix,
}

impl SubnetSpec {
    /// Validate a prefix for IPv4 embedding.
    pub fn new(prefix: Ipv6Prefix) -> Result<Self, NetworkError> {
        if prefix.prefix_len == 0 {
            return Err(NetworkError::EmptyPrefix);
        }
        if prefix.prefix_len > MAX_EMBEDDING_PREFIX_LEN {
            return Err(NetworkError::PrefixTooLong {
                len: prefix.prefix_len,
                max: MAX_EMBEDDING_PREFIX_LEN,
            });
        }
        Ok(Self { prefix })
    }

    /// Parse and validate a CIDR string.
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        Self::new(Ipv6Prefix::from_cidr(s)?)
    }

    /// The validated prefix.
    pub fn prefix(&self) -> Ipv6Prefix {
        self.prefix
    }

    /// Build the source address for a client.
    pub fn synthesize(&self, client: Ipv4Addr) -> Ipv6Addr {
        let mut octets = self.prefix.address.octets();
        octets[EMBEDDING_OFFSET..].copy_from_slice(&client.octets());
        Ipv6Addr::from(octets)
    }
}

impl FromStr for SubnetSpec {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for SubnetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.prefix.fmt(f)
    }
}
