//! Per-connection state machine.
//!
//! ```text
//! Sniffing -> PolicyCheck -> Dialing -> Replaying -> Splicing -> Closed
//!     |            |            |            |
//!     +------------+------------+------------+--> rejection -> Closed
//! ```
//!
//! The sniffed bytes are recorded and written to the backend before any
//! other client data, so the backend sees the connection exactly as the
//! client sent it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::dialer::{DialContext, DialError, SharedDialerFactory};
use super::http::{
    read_host_header, HostHeaderError, BAD_REQUEST_RESPONSE, MAX_LINE_LEN,
    SERVICE_UNAVAILABLE_RESPONSE,
};
use super::listener::ListenerConfig;
use super::record::AlertDescription;
use super::recorder::RecordedStream;
use super::sni::{read_client_hello, ClientHelloError};

/// Upper bound on sending a rejection to the client.
const REJECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Splice copy buffer size.
const COPY_BUFFER_SIZE: usize = 8192;

/// Protocol a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TLS; the destination comes from the ClientHello SNI.
    Tls,
    /// Plaintext HTTP/1.x; the destination comes from the Host header.
    Http,
}

impl Protocol {
    /// Backend port used when the listener does not override it.
    pub fn default_backend_port(self) -> u16 {
        match self {
            Self::Tls => 443,
            Self::Http => 80,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls => write!(f, "tls"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading the ClientHello or request headers.
    Sniffing,
    /// Checking the hostname against the allow-list.
    PolicyCheck,
    /// Connecting to the backend.
    Dialing,
    /// Writing the sniffed bytes to the backend.
    Replaying,
    /// Copying bytes in both directions.
    Splicing,
    /// Both directions have ended.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sniffing => "sniffing",
            Self::PolicyCheck => "policy_check",
            Self::Dialing => "dialing",
            Self::Replaying => "replaying",
            Self::Splicing => "splicing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Failure classes; each maps to one on-wire rejection per protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    MalformedInput,
    UnsupportedFeature,
    PolicyRejected,
    BackendUnavailable,
    ReplayFailed,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedInput => "malformed_input",
            Self::UnsupportedFeature => "unsupported_feature",
            Self::PolicyRejected => "policy_rejected",
            Self::BackendUnavailable => "backend_unavailable",
            Self::ReplayFailed => "replay_failed",
        };
        f.write_str(name)
    }
}

/// Reasons a connection is rejected before splicing starts.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no complete request within {0:?}")]
    SniffTimeout(Duration),

    #[error("reading ClientHello: {0}")]
    ClientHello(#[from] ClientHelloError),

    #[error("reading request headers: {0}")]
    Headers(#[from] HostHeaderError),

    #[error("input ended before the end of the request headers")]
    IncompleteHeaders,

    #[error("no destination hostname")]
    MissingHostname,

    #[error("hostname {0:?} is not permitted")]
    HostnameNotAllowed(String),

    #[error("dialing {host}: {source}")]
    Dial {
        host: String,
        #[source]
        source: DialError,
    },

    #[error("replaying sniffed bytes to {host}: {source}")]
    Replay {
        host: String,
        #[source]
        source: io::Error,
    },
}

impl HandlerError {
    /// Classify the failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ClientHello(e) if e.is_unsupported() => ErrorClass::UnsupportedFeature,
            Self::SniffTimeout(_)
            | Self::ClientHello(_)
            | Self::Headers(_)
            | Self::IncompleteHeaders => ErrorClass::MalformedInput,
            Self::MissingHostname | Self::HostnameNotAllowed(_) => ErrorClass::PolicyRejected,
            Self::Dial { .. } => ErrorClass::BackendUnavailable,
            Self::Replay { .. } => ErrorClass::ReplayFailed,
        }
    }

    /// State the connection was in when it failed.
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::SniffTimeout(_)
            | Self::ClientHello(_)
            | Self::Headers(_)
            | Self::IncompleteHeaders => ConnectionState::Sniffing,
            Self::MissingHostname | Self::HostnameNotAllowed(_) => ConnectionState::PolicyCheck,
            Self::Dial { .. } => ConnectionState::Dialing,
            Self::Replay { .. } => ConnectionState::Replaying,
        }
    }

    /// TLS alert sent for this failure.
    pub fn alert(&self) -> AlertDescription {
        match self {
            Self::ClientHello(e) => e.alert(),
            Self::MissingHostname | Self::HostnameNotAllowed(_) | Self::Dial { .. } => {
                AlertDescription::UnrecognizedName
            }
            _ => AlertDescription::InternalError,
        }
    }

    /// Bytes written to the client when rejecting the connection.
    pub fn rejection(&self, protocol: Protocol) -> Vec<u8> {
        match protocol {
            Protocol::Tls => self.alert().to_record().to_vec(),
            Protocol::Http => match self.class() {
                ErrorClass::BackendUnavailable | ErrorClass::ReplayFailed => {
                    SERVICE_UNAVAILABLE_RESPONSE.to_vec()
                }
                _ => BAD_REQUEST_RESPONSE.to_vec(),
            },
        }
    }
}

/// Destination and recorded bytes produced by sniffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    /// Hostname exactly as sent by the client.
    pub hostname: String,
    /// Every byte read from the client while sniffing.
    pub prefix: Vec<u8>,
}

/// Outcome of a proxied connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Hostname the connection was routed by.
    pub hostname: String,
    /// Backend peer address, if the socket still reported one.
    pub backend_addr: Option<SocketAddr>,
    /// Bytes written to the backend, replayed prefix included.
    pub bytes_to_backend: u64,
    /// Bytes written to the client.
    pub bytes_from_backend: u64,
}

/// Drives one client connection from first byte to close.
#[derive(Clone)]
pub struct ConnectionHandler {
    config: Arc<ListenerConfig>,
    dialer_factory: SharedDialerFactory,
}

impl ConnectionHandler {
    pub fn new(config: Arc<ListenerConfig>, dialer_factory: SharedDialerFactory) -> Self {
        Self {
            config,
            dialer_factory,
        }
    }

    /// Handle a client connection.
    ///
    /// On failure before splicing, a protocol-appropriate rejection is sent
    /// (best effort) and the error is returned. Splice errors end the
    /// session but are not reported as failures.
    pub async fn handle<S>(
        &self,
        mut client: S,
        peer_addr: SocketAddr,
    ) -> Result<SessionSummary, HandlerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (decision, backend) = match self.establish(&mut client, peer_addr).await {
            Ok(established) => established,
            Err(e) => {
                self.reject(&mut client, &e).await;
                return Err(e);
            }
        };

        let backend_addr = backend.peer_addr().ok();
        self.forward(client, decision, backend, backend_addr).await
    }

    /// Replay the sniffed bytes to `backend`, then splice until both
    /// directions close.
    async fn forward<S, B>(
        &self,
        mut client: S,
        decision: RoutingDecision,
        mut backend: B,
        backend_addr: Option<SocketAddr>,
    ) -> Result<SessionSummary, HandlerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(
            hostname = %decision.hostname,
            replay_bytes = decision.prefix.len(),
            state = %ConnectionState::Replaying,
            "Replaying sniffed bytes"
        );
        if let Err(source) = backend.write_all(&decision.prefix).await {
            let e = HandlerError::Replay {
                host: decision.hostname,
                source,
            };
            self.reject(&mut client, &e).await;
            return Err(e);
        }

        debug!(
            hostname = %decision.hostname,
            backend_addr = ?backend_addr,
            state = %ConnectionState::Splicing,
            "Splicing"
        );

        let (to_backend, from_backend) = splice(client, backend, self.config.idle_timeout).await;

        let summary = SessionSummary {
            hostname: decision.hostname,
            backend_addr,
            bytes_to_backend: decision.prefix.len() as u64 + to_backend,
            bytes_from_backend: from_backend,
        };
        debug!(
            hostname = %summary.hostname,
            bytes_to_backend = summary.bytes_to_backend,
            bytes_from_backend = summary.bytes_from_backend,
            state = %ConnectionState::Closed,
            "Connection closed"
        );
        Ok(summary)
    }

    /// Run the states up to and including the dial.
    async fn establish<S>(
        &self,
        client: &mut S,
        peer_addr: SocketAddr,
    ) -> Result<(RoutingDecision, TcpStream), HandlerError>
    where
        S: AsyncRead + Unpin,
    {
        let decision = self.sniff(client).await?;
        debug!(
            hostname = %decision.hostname,
            sniffed_bytes = decision.prefix.len(),
            state = %ConnectionState::PolicyCheck,
            "Sniffed destination"
        );

        if decision.hostname.is_empty() {
            return Err(HandlerError::MissingHostname);
        }
        if !self.config.allow_list.allowed(&decision.hostname) {
            return Err(HandlerError::HostnameNotAllowed(decision.hostname));
        }

        let host = decision.hostname.as_str();
        let port = self.config.target_port();
        debug!(
            hostname = %host,
            port,
            network = %self.config.backend_network,
            state = %ConnectionState::Dialing,
            "Dialing backend"
        );

        let dial_error = |source| HandlerError::Dial {
            host: host.to_string(),
            source,
        };
        let ctx = DialContext {
            peer_addr,
            hostname: host,
        };
        let dialer = self.dialer_factory.make_dialer(&ctx).map_err(dial_error)?;
        let backend = dialer
            .connect(host, port, self.config.backend_network)
            .await
            .map_err(dial_error)?;

        Ok((decision, backend))
    }

    /// Read the destination hostname under the sniff deadline, recording
    /// every byte consumed.
    async fn sniff<S>(&self, client: &mut S) -> Result<RoutingDecision, HandlerError>
    where
        S: AsyncRead + Unpin,
    {
        let mut recorder = RecordedStream::new(client);
        let sniff_timeout = self.config.sniff_timeout;

        let hostname = match timeout(sniff_timeout, self.read_hostname(&mut recorder)).await {
            Ok(result) => result?,
            Err(_) => return Err(HandlerError::SniffTimeout(sniff_timeout)),
        };

        Ok(RoutingDecision {
            hostname,
            prefix: recorder.into_buffer(),
        })
    }

    async fn read_hostname<R>(&self, reader: &mut R) -> Result<String, HandlerError>
    where
        R: AsyncRead + Unpin,
    {
        match self.config.protocol {
            Protocol::Tls => Ok(read_client_hello(reader).await?.server_name),
            Protocol::Http => {
                let mut reader = BufReader::with_capacity(MAX_LINE_LEN, reader);
                let header = read_host_header(&mut reader).await?;
                if !header.saw_all_headers {
                    return Err(HandlerError::IncompleteHeaders);
                }
                Ok(header.host)
            }
        }
    }

    /// Send the rejection for `error` and close the write side. Failures
    /// are only logged.
    async fn reject<S>(&self, client: &mut S, error: &HandlerError)
    where
        S: AsyncWrite + Unpin,
    {
        warn!(
            state = %error.state(),
            class = %error.class(),
            error = %error,
            "Rejecting connection"
        );

        let response = error.rejection(self.config.protocol);
        let send = async {
            client.write_all(&response).await?;
            client.flush().await?;
            client.shutdown().await
        };
        match timeout(REJECTION_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Failed to send rejection"),
            Err(_) => debug!("Timed out sending rejection"),
        }
    }
}

/// Time of the last byte moved in either splice direction.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Resolve once neither direction has moved bytes for `limit`.
    async fn wait_idle(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            sleep(limit - idle).await;
        }
    }
}

/// Copy both directions until each reaches end of stream.
///
/// The directions run concurrently; the end of one shuts down the write
/// side of the other socket. With an idle timeout, the session ends in
/// both directions once neither has moved bytes for that long. Returns
/// (client_to_backend, backend_to_client) byte counts.
async fn splice<C, B>(client: C, backend: B, idle_timeout: Option<Duration>) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let activity = Activity::new();
    let to_backend = AtomicU64::new(0);
    let from_backend = AtomicU64::new(0);

    let copies = async {
        tokio::join!(
            copy_half(client_read, backend_write, &to_backend, &activity),
            copy_half(backend_read, client_write, &from_backend, &activity),
        )
    };
    let idle = async {
        match idle_timeout {
            Some(limit) => activity.wait_idle(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    // Losing the race drops every half, closing both sockets.
    tokio::select! {
        (upstream, downstream) = copies => {
            if let Err(e) = upstream {
                debug!(error = %e, direction = "client_to_backend", "Splice ended with error");
            }
            if let Err(e) = downstream {
                debug!(error = %e, direction = "backend_to_client", "Splice ended with error");
            }
        }
        _ = idle => {
            debug!(idle_timeout = ?idle_timeout, "Session idle, closing both directions");
        }
    }

    (
        to_backend.load(Ordering::Relaxed),
        from_backend.load(Ordering::Relaxed),
    )
}

/// Copy `reader` into `writer`, then shut `writer` down.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    transferred: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                activity.touch();
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                transferred.fetch_add(n as u64, Ordering::Relaxed);
                activity.touch();
            }
            Err(e) => break Err(e),
        }
    };

    // Propagate the half-close even if the copy failed.
    let shutdown = writer.shutdown().await;
    result.and(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::dialer::{Network, SystemDialerFactory};
    use crate::proxy::policy::AllowList;
    use crate::proxy::sni::fixtures::{client_hello_body, client_hello_records, handshake, records};
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;

    fn peer() -> SocketAddr {
        "192.0.2.10:50000".parse().unwrap()
    }

    fn handler(config: ListenerConfig) -> ConnectionHandler {
        ConnectionHandler::new(
            Arc::new(config),
            Arc::new(SystemDialerFactory::default()),
        )
    }

    fn tls_config() -> ListenerConfig {
        ListenerConfig::new("127.0.0.1:0".parse().unwrap(), Protocol::Tls)
    }

    fn http_config() -> ListenerConfig {
        ListenerConfig::new("127.0.0.1:0".parse().unwrap(), Protocol::Http)
    }

    /// Send `input` through the handler and collect what the client gets back.
    async fn reject_with(
        handler: ConnectionHandler,
        input: &[u8],
    ) -> (Vec<u8>, HandlerError) {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server, peer()).await });

        client.write_all(input).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        (response, err)
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_garbage_gets_internal_error_alert() {
        let (response, err) = reject_with(handler(tls_config()), b"GARBAGE!").await;
        assert_eq!(response, [21, 3, 1, 0, 2, 2, 80]);
        assert_eq!(err.class(), ErrorClass::MalformedInput);
        assert_eq!(err.state(), ConnectionState::Sniffing);
    }

    #[tokio::test]
    async fn test_missing_sni_gets_unrecognized_name() {
        let input = records(&handshake(&client_hello_body([3, 3], None)), 16384);
        let (response, err) = reject_with(handler(tls_config()), &input).await;
        assert_eq!(response, [21, 3, 1, 0, 2, 2, 112]);
        assert!(matches!(err, HandlerError::MissingHostname));
        assert_eq!(err.class(), ErrorClass::PolicyRejected);
    }

    #[tokio::test]
    async fn test_disallowed_sni_gets_unrecognized_name() {
        let mut config = tls_config();
        config.allow_list = AllowList::new(["allowed.test"]);

        let input = client_hello_records("denied.test");
        let (response, err) = reject_with(handler(config), &input).await;
        assert_eq!(response, [21, 3, 1, 0, 2, 2, 112]);
        assert!(matches!(err, HandlerError::HostnameNotAllowed(ref h) if h == "denied.test"));
    }

    #[tokio::test]
    async fn test_old_tls_version_is_unsupported() {
        let input = records(&handshake(&client_hello_body([3, 1], None)), 16384);
        let (response, err) = reject_with(handler(tls_config()), &input).await;
        assert_eq!(response, [21, 3, 1, 0, 2, 2, 80]);
        assert_eq!(err.class(), ErrorClass::UnsupportedFeature);
    }

    #[tokio::test]
    async fn test_http_without_host_is_bad_request() {
        let (response, err) =
            reject_with(handler(http_config()), b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").await;
        assert_eq!(response, BAD_REQUEST_RESPONSE);
        assert!(matches!(err, HandlerError::MissingHostname));
    }

    #[tokio::test]
    async fn test_http_disallowed_host_is_bad_request() {
        let mut config = http_config();
        config.allow_list = AllowList::new([".allowed.test"]);

        let (response, err) =
            reject_with(handler(config), b"GET / HTTP/1.1\r\nHost: other.test\r\n\r\n").await;
        assert_eq!(response, BAD_REQUEST_RESPONSE);
        assert_eq!(err.class(), ErrorClass::PolicyRejected);
    }

    #[tokio::test]
    async fn test_http_incomplete_headers_is_bad_request() {
        let (mut client, server) = duplex(4096);
        let handler = handler(http_config());
        let task = tokio::spawn(async move { handler.handle(server, peer()).await });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: foo.test\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, BAD_REQUEST_RESPONSE);
        assert!(matches!(
            task.await.unwrap(),
            Err(HandlerError::IncompleteHeaders)
        ));
    }

    #[tokio::test]
    async fn test_tls_dial_failure_gets_unrecognized_name() {
        let mut config = tls_config();
        config.backend_port = Some(unused_port().await);

        let input = client_hello_records("127.0.0.1");
        let (response, err) = reject_with(handler(config), &input).await;
        assert_eq!(response, [21, 3, 1, 0, 2, 2, 112]);
        assert_eq!(err.class(), ErrorClass::BackendUnavailable);
        assert_eq!(err.state(), ConnectionState::Dialing);
    }

    #[tokio::test]
    async fn test_http_dial_failure_is_service_unavailable() {
        let mut config = http_config();
        config.backend_port = Some(unused_port().await);

        let (response, err) =
            reject_with(handler(config), b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").await;
        assert_eq!(response, SERVICE_UNAVAILABLE_RESPONSE);
        assert_eq!(err.class(), ErrorClass::BackendUnavailable);
    }

    #[tokio::test]
    async fn test_network_override_rejects_ipv4_backend() {
        let mut config = http_config();
        config.backend_network = Network::Ipv6;

        let (response, err) =
            reject_with(handler(config), b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").await;
        assert_eq!(response, SERVICE_UNAVAILABLE_RESPONSE);
        assert!(matches!(
            err,
            HandlerError::Dial {
                source: DialError::NoAddresses { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sniff_timeout() {
        let mut config = tls_config();
        config.sniff_timeout = Duration::from_millis(50);
        let handler = handler(config);

        let (mut client, server): (DuplexStream, DuplexStream) = duplex(4096);
        let task = tokio::spawn(async move { handler.handle(server, peer()).await });

        // Partial record header, then silence.
        client.write_all(&[22, 3]).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, [21, 3, 1, 0, 2, 2, 80]);
        assert!(matches!(
            task.await.unwrap(),
            Err(HandlerError::SniffTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_replays_sniffed_bytes_and_splices() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = http_config();
        config.backend_port = Some(backend.local_addr().unwrap().port());
        let handler = handler(config);

        let request = b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\nGET /next HTTP/1.1\r\n";

        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server, peer()).await });

        client.write_all(request).await.unwrap();

        let (mut upstream, _) = backend.accept().await.unwrap();
        let mut received = vec![0u8; request.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, request);

        upstream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        upstream.shutdown().await.unwrap();

        client.write_all(b"tail").await.unwrap();
        client.shutdown().await.unwrap();

        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"tail");

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\n");

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.hostname, "127.0.0.1");
        assert_eq!(summary.bytes_to_backend, (request.len() + 4) as u64);
        assert_eq!(summary.bytes_from_backend, 19);
    }

    async fn reject_replay(handler: ConnectionHandler) -> (Vec<u8>, HandlerError) {
        let decision = RoutingDecision {
            hostname: "a.test".to_string(),
            prefix: b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n".to_vec(),
        };
        let backend = tokio_test::io::Builder::new()
            .write_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        let (mut client, server) = duplex(4096);
        let err = handler
            .forward(server, decision, backend, None)
            .await
            .unwrap_err();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        (response, err)
    }

    #[tokio::test]
    async fn test_failed_replay_is_rejected() {
        let (response, err) = reject_replay(handler(http_config())).await;
        assert_eq!(response, SERVICE_UNAVAILABLE_RESPONSE);
        assert_eq!(err.class(), ErrorClass::ReplayFailed);
        assert_eq!(err.state(), ConnectionState::Replaying);

        let (response, err) = reject_replay(handler(tls_config())).await;
        assert_eq!(response, [21, 3, 1, 0, 2, 2, 80]);
        assert!(matches!(err, HandlerError::Replay { ref host, .. } if host == "a.test"));
    }

    #[tokio::test]
    async fn test_idle_timeout_spares_one_way_stream() {
        let (mut client, client_inner) = duplex(4096);
        let (backend_inner, mut backend) = duplex(4096);
        let session = tokio::spawn(splice(
            client_inner,
            backend_inner,
            Some(Duration::from_millis(100)),
        ));

        // Only the backend talks, for three times the idle timeout.
        for _ in 0..10 {
            backend.write_all(b"chunk").await.unwrap();
            sleep(Duration::from_millis(30)).await;
        }
        let mut streamed = vec![0u8; 50];
        client.read_exact(&mut streamed).await.unwrap();
        assert_eq!(streamed, b"chunk".repeat(10));

        // The silent direction must still be open.
        client.write_all(b"done").await.unwrap();
        let mut done = [0u8; 4];
        backend.read_exact(&mut done).await.unwrap();
        assert_eq!(&done, b"done");

        backend.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        let counts = timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts, (4, 50));
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_silent_session() {
        let (mut client, client_inner) = duplex(4096);
        let (backend_inner, mut backend) = duplex(4096);
        let session = tokio::spawn(splice(
            client_inner,
            backend_inner,
            Some(Duration::from_millis(50)),
        ));

        let counts = timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts, (0, 0));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_rejection_bytes() {
        let dial = HandlerError::Dial {
            host: "a.test".to_string(),
            source: DialError::Timeout(Duration::from_secs(3)),
        };
        assert_eq!(dial.rejection(Protocol::Tls), [21, 3, 1, 0, 2, 2, 112]);
        assert_eq!(dial.rejection(Protocol::Http), SERVICE_UNAVAILABLE_RESPONSE);

        let replay = HandlerError::Replay {
            host: "a.test".to_string(),
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert_eq!(replay.rejection(Protocol::Tls), [21, 3, 1, 0, 2, 2, 80]);
        assert_eq!(replay.rejection(Protocol::Http), SERVICE_UNAVAILABLE_RESPONSE);

        let unsupported = HandlerError::ClientHello(ClientHelloError::UnsupportedNameType(1));
        assert_eq!(unsupported.rejection(Protocol::Tls), [21, 3, 1, 0, 2, 2, 112]);
        assert_eq!(unsupported.class(), ErrorClass::UnsupportedFeature);
    }
}
