//! Outbound connection setup.
//!
//! A [`DialerFactory`] is chosen once at startup and asked for a
//! [`Dialer`] per accepted connection:
//! - [`SystemDialerFactory`] connects from the host's default source address
//! - [`SubnetDialerFactory`] binds each connection to an IPv6 address that
//!   embeds the client's IPv4 address
//!
//! Dialing resolves the destination, tries each admissible address in
//! order and gives up once the dial timeout expires.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use fourtosix_networking::{NetworkError, SubnetSpec};
use thiserror::Error;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Default timeout for outbound connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Address family allowed for backend connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Network {
    /// Any resolved address.
    #[default]
    Any,
    /// IPv4 addresses only.
    Ipv4,
    /// IPv6 addresses only.
    Ipv6,
}

impl Network {
    /// Whether `addr` belongs to this network.
    pub fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Ipv4 => addr.is_ipv4(),
            Self::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Errors raised while connecting to a backend.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("resolving {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("no usable {network} addresses for {host}")]
    NoAddresses { host: String, network: Network },

    #[error("binding source address {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("connect {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("client address {0} has no IPv4 address to embed")]
    NoEmbeddableAddress(IpAddr),
}

/// Per-connection information handed to a [`DialerFactory`].
#[derive(Debug, Clone, Copy)]
pub struct DialContext<'a> {
    /// Address of the accepted client.
    pub peer_addr: SocketAddr,
    /// Sniffed destination hostname.
    pub hostname: &'a str,
}

/// Produces the dialer for one proxied connection.
pub trait DialerFactory: Send + Sync {
    /// Build a dialer for the connection described by `ctx`.
    fn make_dialer(&self, ctx: &DialContext<'_>) -> Result<Dialer, DialError>;
}

/// Shared dialer factory reference.
pub type SharedDialerFactory = Arc<dyn DialerFactory>;

/// Build the factory for an optional subnet CIDR.
///
/// Without a subnet the system dialer is used.
pub fn build_dialer_factory(
    subnet_cidr: Option<&str>,
    dial_timeout: Duration,
) -> Result<SharedDialerFactory, NetworkError> {
    match subnet_cidr {
        Some(cidr) => {
            let subnet = SubnetSpec::from_cidr(cidr)?;
            Ok(Arc::new(SubnetDialerFactory::new(subnet, dial_timeout)))
        }
        None => Ok(Arc::new(SystemDialerFactory::new(dial_timeout))),
    }
}

/// Dials from the host's default source address.
#[derive(Debug, Clone)]
pub struct SystemDialerFactory {
    dial_timeout: Duration,
}

impl SystemDialerFactory {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for SystemDialerFactory {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

impl DialerFactory for SystemDialerFactory {
    fn make_dialer(&self, _ctx: &DialContext<'_>) -> Result<Dialer, DialError> {
        Ok(Dialer::system(self.dial_timeout))
    }
}

/// Dials from a per-client address inside a 4-in-6 subnet.
#[derive(Debug, Clone)]
pub struct SubnetDialerFactory {
    subnet: SubnetSpec,
    dial_timeout: Duration,
}

impl SubnetDialerFactory {
    pub fn new(subnet: SubnetSpec, dial_timeout: Duration) -> Self {
        Self {
            subnet,
            dial_timeout,
        }
    }

    /// Source address used for connections from `peer`.
    ///
    /// IPv4-mapped IPv6 peers (dual-stack listeners) embed their IPv4
    /// address; native IPv6 peers cannot be mapped.
    pub fn source_addr_for(&self, peer: IpAddr) -> Result<Ipv6Addr, DialError> {
        let v4 = match peer {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .ok_or(DialError::NoEmbeddableAddress(peer))?,
        };
        Ok(self.subnet.synthesize(v4))
    }
}

impl DialerFactory for SubnetDialerFactory {
    fn make_dialer(&self, ctx: &DialContext<'_>) -> Result<Dialer, DialError> {
        let local = self.source_addr_for(ctx.peer_addr.ip())?;
        debug!(
            hostname = %ctx.hostname,
            source_addr = %local,
            "Synthesized source address"
        );
        Ok(Dialer::bound(local, self.dial_timeout))
    }
}

/// Connects to backends, optionally from a fixed IPv6 source address.
#[derive(Debug, Clone)]
pub struct Dialer {
    local_addr: Option<Ipv6Addr>,
    dial_timeout: Duration,
}

impl Dialer {
    /// A dialer using the host's default source address.
    pub fn system(dial_timeout: Duration) -> Self {
        Self {
            local_addr: None,
            dial_timeout,
        }
    }

    /// A dialer bound to `local_addr`. It only reaches IPv6 destinations.
    pub fn bound(local_addr: Ipv6Addr, dial_timeout: Duration) -> Self {
        Self {
            local_addr: Some(local_addr),
            dial_timeout,
        }
    }

    /// Source address this dialer binds to, if any.
    pub fn local_addr(&self) -> Option<Ipv6Addr> {
        self.local_addr
    }

    /// Connect to `host:port`, restricted to `network`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        network: Network,
    ) -> Result<TcpStream, DialError> {
        match timeout(self.dial_timeout, self.connect_any(host, port, network)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout(self.dial_timeout)),
        }
    }

    async fn connect_any(
        &self,
        host: &str,
        port: u16,
        network: Network,
    ) -> Result<TcpStream, DialError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|source| DialError::Resolve {
                host: host.to_string(),
                source,
            })?
            .filter(|addr| network.admits(addr))
            .filter(|addr| self.local_addr.is_none() || addr.is_ipv6())
            .collect();

        let mut last_error = DialError::NoAddresses {
            host: host.to_string(),
            network,
        };

        for addr in addrs {
            debug!(
                backend_addr = %addr,
                source_addr = ?self.local_addr,
                "Connecting to backend"
            );
            match self.connect_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(backend_addr = %addr, error = %e, "Backend address failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let Some(local) = self.local_addr else {
            return TcpStream::connect(addr)
                .await
                .map_err(|source| DialError::Connect { addr, source });
        };

        let bind_addr = SocketAddr::new(IpAddr::V6(local), 0);
        let socket = TcpSocket::new_v6().map_err(|source| DialError::Bind {
            addr: bind_addr,
            source,
        })?;
        socket.bind(bind_addr).map_err(|source| DialError::Bind {
            addr: bind_addr,
            source,
        })?;
        socket
            .connect(addr)
            .await
            .map_err(|source| DialError::Connect { addr, source })
    }
}
