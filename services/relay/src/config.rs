//! Relay configuration.
//!
//! Every flag can also be set through a `FOURTOSIX_*` environment variable.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use fourtosix_relay::proxy::{AllowList, ListenerConfig, Network, Protocol};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// fourtosix - relay IPv4 clients to IPv6 backends by SNI or Host header.
#[derive(Debug, Clone, Parser)]
#[command(name = "fourtosix")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// TLS listener address (`:PORT` for all IPv4 interfaces, empty to disable).
    #[arg(long, env = "FOURTOSIX_TLS_LISTEN", default_value = ":443")]
    pub tls_listen: String,

    /// Comma-separated hostname suffixes permitted over TLS (empty permits all).
    #[arg(long, env = "FOURTOSIX_TLS_PERMIT_SUFFIX", default_value = "")]
    pub tls_permit_suffix: String,

    /// Backend port for TLS connections.
    #[arg(long, env = "FOURTOSIX_TLS_BACKEND_PORT", default_value_t = 443)]
    pub tls_backend_port: u16,

    /// Address family for TLS backends.
    #[arg(long, env = "FOURTOSIX_TLS_BACKEND_NETWORK", value_enum, default_value = "any")]
    pub tls_backend_network: Network,

    /// HTTP listener address (`:PORT` for all IPv4 interfaces, empty to disable).
    #[arg(long, env = "FOURTOSIX_HTTP_LISTEN", default_value = ":80")]
    pub http_listen: String,

    /// Comma-separated hostname suffixes permitted over HTTP (empty permits all).
    #[arg(long, env = "FOURTOSIX_HTTP_PERMIT_SUFFIX", default_value = "")]
    pub http_permit_suffix: String,

    /// Backend port for HTTP connections.
    #[arg(long, env = "FOURTOSIX_HTTP_BACKEND_PORT", default_value_t = 80)]
    pub http_backend_port: u16,

    /// Address family for HTTP backends.
    #[arg(long, env = "FOURTOSIX_HTTP_BACKEND_NETWORK", value_enum, default_value = "any")]
    pub http_backend_network: Network,

    /// IPv6 subnet (mask 1-96) in which client IPv4 addresses are embedded
    /// to form outbound source addresses.
    ///
    /// The subnet must be routed to this host (for example with
    /// `ip -6 route add local <subnet> dev lo`).
    #[arg(long, env = "FOURTOSIX_V4_SUBNET")]
    pub v4_subnet: Option<String>,

    /// Deadline for reading the ClientHello or request headers, in milliseconds.
    #[arg(long, env = "FOURTOSIX_SNIFF_TIMEOUT_MS", default_value_t = 5000)]
    pub sniff_timeout_ms: u64,

    /// Timeout for connecting to a backend, in milliseconds.
    #[arg(long, env = "FOURTOSIX_DIAL_TIMEOUT_MS", default_value_t = 3000)]
    pub dial_timeout_ms: u64,

    /// Close spliced connections idle for this many seconds.
    #[arg(long, env = "FOURTOSIX_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "FOURTOSIX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "FOURTOSIX_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

impl Config {
    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Build configurations for the enabled listeners.
    pub fn listeners(&self) -> Result<Vec<ListenerConfig>> {
        let mut listeners = Vec::new();

        let tls_addr = parse_listen_addr(&self.tls_listen).context("invalid --tls-listen")?;
        if let Some(addr) = tls_addr {
            listeners.push(self.listener(
                addr,
                Protocol::Tls,
                &self.tls_permit_suffix,
                self.tls_backend_port,
                self.tls_backend_network,
            ));
        }

        let http_addr = parse_listen_addr(&self.http_listen).context("invalid --http-listen")?;
        if let Some(addr) = http_addr {
            listeners.push(self.listener(
                addr,
                Protocol::Http,
                &self.http_permit_suffix,
                self.http_backend_port,
                self.http_backend_network,
            ));
        }

        if listeners.is_empty() {
            bail!("no listeners enabled; set --tls-listen or --http-listen");
        }
        Ok(listeners)
    }

    fn listener(
        &self,
        bind_addr: SocketAddr,
        protocol: Protocol,
        permit_suffix: &str,
        backend_port: u16,
        backend_network: Network,
    ) -> ListenerConfig {
        let mut config = ListenerConfig::new(bind_addr, protocol);
        config.allow_list = AllowList::from_comma_separated(permit_suffix);
        config.backend_port = Some(backend_port);
        config.backend_network = backend_network;
        config.sniff_timeout = self.sniff_timeout();
        config.idle_timeout = self.idle_timeout_secs.map(Duration::from_secs);
        config
    }
}

/// Parse a listen address.
///
/// Empty disables the listener; `:PORT` binds every IPv4 interface.
pub fn parse_listen_addr(value: &str) -> Result<Option<SocketAddr>> {
    if value.is_empty() {
        return Ok(None);
    }

    if let Some(port) = value.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in listen address {value:?}"))?;
        return Ok(Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))));
    }

    let addr = value
        .parse()
        .with_context(|| format!("invalid listen address {value:?}"))?;
    Ok(Some(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["fourtosix"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(parse_listen_addr("").unwrap(), None);
        assert_eq!(
            parse_listen_addr(":443").unwrap(),
            Some("0.0.0.0:443".parse().unwrap())
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:8080").unwrap(),
            Some("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(
            parse_listen_addr("[::]:80").unwrap(),
            Some("[::]:80".parse().unwrap())
        );
        assert!(parse_listen_addr(":https").is_err());
        assert!(parse_listen_addr("localhost").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        let listeners = config.listeners().unwrap();
        assert_eq!(listeners.len(), 2);

        let tls = &listeners[0];
        assert_eq!(tls.protocol, Protocol::Tls);
        assert_eq!(tls.bind_addr, "0.0.0.0:443".parse().unwrap());
        assert_eq!(tls.target_port(), 443);
        assert!(tls.allow_list.is_open());
        assert_eq!(tls.sniff_timeout, Duration::from_secs(5));
        assert_eq!(tls.idle_timeout, None);

        let http = &listeners[1];
        assert_eq!(http.protocol, Protocol::Http);
        assert_eq!(http.target_port(), 80);

        assert_eq!(config.dial_timeout(), Duration::from_secs(3));
        assert_eq!(config.v4_subnet, None);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--http-listen",
            "",
            "--tls-listen",
            "127.0.0.1:8443",
            "--tls-permit-suffix",
            ".example.com,.example.net",
            "--tls-backend-port",
            "9443",
            "--tls-backend-network",
            "ipv6",
            "--v4-subnet",
            "64:ff9b::/96",
            "--idle-timeout-secs",
            "30",
            "--log-format",
            "text",
        ]);
        let listeners = config.listeners().unwrap();
        assert_eq!(listeners.len(), 1);

        let tls = &listeners[0];
        assert_eq!(tls.bind_addr, "127.0.0.1:8443".parse().unwrap());
        assert_eq!(tls.target_port(), 9443);
        assert_eq!(tls.backend_network, Network::Ipv6);
        assert!(tls.allow_list.allowed("api.example.net"));
        assert!(!tls.allow_list.allowed("example.org"));
        assert_eq!(tls.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.v4_subnet.as_deref(), Some("64:ff9b::/96"));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_all_listeners_disabled() {
        let config = parse(&["--tls-listen", "", "--http-listen", ""]);
        assert!(config.listeners().is_err());
    }
}
