//! TCP listener and connection accounting.
//!
//! Each listener is dedicated to one [`Protocol`]. Accepted connections are
//! handed to a [`ConnectionHandler`] on their own task; the accept loop
//! itself never waits on a connection.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, Instrument};

use super::dialer::{Network, SharedDialerFactory};
use super::handler::{ConnectionHandler, ErrorClass, Protocol};
use super::policy::AllowList;

/// Default deadline for reading the ClientHello or request headers.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle timeout (none; splicing is unbounded).
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Protocol spoken on this listener.
    pub protocol: Protocol,
    /// Permitted destination suffixes.
    pub allow_list: AllowList,
    /// Backend port override; the protocol default is used when unset.
    pub backend_port: Option<u16>,
    /// Address family for backend connections.
    pub backend_network: Network,
    /// Deadline for sniffing the destination.
    pub sniff_timeout: Duration,
    /// Idle timeout while splicing.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, protocol: Protocol) -> Self {
        Self {
            bind_addr,
            protocol,
            allow_list: AllowList::open(),
            backend_port: None,
            backend_network: Network::Any,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Port dialed on the backend.
    pub fn target_port(&self) -> u16 {
        self.backend_port
            .unwrap_or_else(|| self.protocol.default_backend_port())
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Malformed, unsupported or timed out sniffs.
    pub sniff_failed: AtomicU64,
    /// Missing or disallowed hostnames.
    pub policy_rejected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Failures writing the sniffed bytes to the backend.
    pub replay_failed: AtomicU64,
    /// Connections that reached splicing.
    pub connections_proxied: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record_rejection(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::MalformedInput | ErrorClass::UnsupportedFeature => &self.sniff_failed,
            ErrorClass::PolicyRejected => &self.policy_rejected,
            ErrorClass::BackendUnavailable => &self.backend_failed,
            ErrorClass::ReplayFailed => &self.replay_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A TCP listener for one protocol.
pub struct Listener {
    /// Listener configuration.
    config: Arc<ListenerConfig>,
    /// The TCP listener.
    listener: TcpListener,
    /// Per-connection state machine.
    handler: ConnectionHandler,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener to `config.bind_addr`.
    pub async fn bind(
        config: ListenerConfig,
        dialer_factory: SharedDialerFactory,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Self::from_tcp(listener, config, dialer_factory)
    }

    /// Wrap an already bound listener. `config.bind_addr` is informational.
    pub fn from_tcp(
        listener: TcpListener,
        config: ListenerConfig,
        dialer_factory: SharedDialerFactory,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            protocol = %config.protocol,
            allow_list = %config.allow_list,
            backend_port = config.target_port(),
            backend_network = %config.backend_network,
            "Listener bound"
        );

        let config = Arc::new(config);
        Ok(Self {
            handler: ConnectionHandler::new(Arc::clone(&config), dialer_factory),
            config,
            listener,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Shared handle to the statistics, usable after `run` takes the listener.
    pub fn stats_handle(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            protocol = %self.config.protocol,
            "Listener started"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let span = tracing::info_span!(
                        "connection",
                        peer = %peer_addr,
                        protocol = %self.config.protocol
                    );

                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream, peer_addr).await;
                            listener
                                .stats
                                .connections_active
                                .fetch_sub(1, Ordering::Relaxed);
                            listener
                                .stats
                                .connections_closed
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Handle a single connection and account for its outcome.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!(peer_addr = %peer_addr, "Handling connection");

        match self.handler.handle(stream, peer_addr).await {
            Ok(summary) => {
                self.stats
                    .connections_proxied
                    .fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_to_backend
                    .fetch_add(summary.bytes_to_backend, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(summary.bytes_from_backend, Ordering::Relaxed);
            }
            Err(e) => self.stats.record_rejection(e.class()),
        }
    }
}
