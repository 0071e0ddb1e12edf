//! 4-to-6 relay implementation.
//!
//! This module provides:
//! - TCP listeners, one per protocol
//! - TLS ClientHello SNI and HTTP Host header sniffing
//! - Destination suffix allow-lists
//! - Per-client IPv6 source address synthesis
//! - Replay of sniffed bytes and bidirectional splicing
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Sniffer -> AllowList -> DialerFactory -> Backend
//!                          |                                       ^
//!                   RecordedStream ------- replayed prefix --------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use fourtosix_relay::proxy::{build_dialer_factory, Listener, ListenerConfig, Protocol};
//!
//! let factory = build_dialer_factory(Some("64:ff9b::/96"), DEFAULT_DIAL_TIMEOUT)?;
//! let config = ListenerConfig::new("0.0.0.0:443".parse()?, Protocol::Tls);
//! let listener = Listener::bind(config, factory).await?;
//! Arc::new(listener).run().await?;
//! ```

mod dialer;
mod handler;
mod http;
mod listener;
mod policy;
mod record;
mod recorder;
mod sni;

pub use dialer::{
    build_dialer_factory, DialContext, DialError, Dialer, DialerFactory, Network,
    SharedDialerFactory, SubnetDialerFactory, SystemDialerFactory, DEFAULT_DIAL_TIMEOUT,
};
pub use handler::{
    ConnectionHandler, ConnectionState, ErrorClass, HandlerError, Protocol, RoutingDecision,
    SessionSummary,
};
pub use http::{
    read_host_header, HostHeader, HostHeaderError, BAD_REQUEST_RESPONSE, MAX_LINE_LEN,
    SERVICE_UNAVAILABLE_RESPONSE,
};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_IDLE_TIMEOUT, DEFAULT_SNIFF_TIMEOUT,
};
pub use policy::AllowList;
pub use record::{read_record, AlertDescription};
pub use recorder::RecordedStream;
pub use sni::{
    parse_client_hello, read_client_hello, ClientHelloError, ClientHelloInfo, ProtocolVersion,
    MAX_HANDSHAKE_MESSAGE_LEN,
};
