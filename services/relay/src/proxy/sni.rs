//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! The ClientHello is reassembled from one or more handshake records and
//! then decoded with a bounds-checked cursor. Every length field is
//! validated against the remaining bytes before anything is sliced, so a
//! malformed message fails with a classified error instead of reading past
//! the buffer.
//!
//! Handshake ClientHello:
//! - byte 0: handshake type (0x01 = ClientHello)
//! - bytes 1-3: length
//! - bytes 4-5: legacy client version
//! - bytes 6-37: random (32 bytes)
//! - 1 byte: session ID length, then session ID
//! - 2 bytes: cipher suites length, then cipher suites
//! - 1 byte: compression methods length, then compression methods
//! - 2 bytes: extensions length (optional), then extensions
//!
//! Reference: RFC 5246 section 7.4.1.2, RFC 6066 section 3

use std::io;

use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::debug;

use super::record::{read_record, AlertDescription, CONTENT_TYPE_HANDSHAKE};

/// Largest handshake message accepted (same bound crypto stacks use).
pub const MAX_HANDSHAKE_MESSAGE_LEN: usize = 65536;

const HANDSHAKE_HEADER_LEN: usize = 4;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
const RANDOM_LEN: usize = 32;
const MAX_SESSION_ID_LEN: usize = 32;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;

/// Lowest legacy version accepted (TLS 1.2).
const MIN_VERSION: ProtocolVersion = ProtocolVersion { major: 3, minor: 3 };

/// Errors raised while reading a ClientHello.
#[derive(Debug, Error)]
pub enum ClientHelloError {
    #[error("reading record header: {0}")]
    RecordHeader(#[source] io::Error),

    #[error("reading {length}-byte record fragment: {source}")]
    RecordFragment { length: usize, source: io::Error },

    #[error("unexpected content type {got}, wanted {want}")]
    UnexpectedContentType { got: u8, want: u8 },

    #[error("empty handshake record")]
    EmptyHandshakeRecord,

    #[error("expected handshake type ClientHello (1), got {0}")]
    UnexpectedHandshakeType(u8),

    #[error("handshake message of {length} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { length: usize, max: usize },

    #[error("client offered version {major}.{minor}, below minimum of 3.3")]
    VersionTooOld { major: u8, minor: u8 },

    #[error("{field}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("session id length {0} out of range (max 32)")]
    InvalidSessionIdLength(usize),

    #[error("cipher suites length {0} is not even")]
    OddCipherSuitesLength(usize),

    #[error("extensions length {claimed} does not match remaining {actual} bytes")]
    ExtensionsLengthMismatch { claimed: usize, actual: usize },

    #[error("server name list length {claimed} does not match extension payload of {actual} bytes")]
    ServerNameListMismatch { claimed: usize, actual: usize },

    #[error("unsupported server name type {0}")]
    UnsupportedNameType(u8),

    #[error("server name is not valid UTF-8")]
    InvalidServerName,
}

impl ClientHelloError {
    /// Alert to send the client for this failure.
    pub fn alert(&self) -> AlertDescription {
        match self {
            Self::UnsupportedNameType(_) => AlertDescription::UnrecognizedName,
            _ => AlertDescription::InternalError,
        }
    }

    /// Whether the input was well formed but asked for something unsupported.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedHandshakeType(_)
                | Self::VersionTooOld { .. }
                | Self::UnsupportedNameType(_)
        )
    }
}

/// Legacy protocol version from the ClientHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// Routing-relevant fields of a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// Legacy client version.
    pub version: ProtocolVersion,
    /// First host_name entry of the server_name extension, empty if absent.
    pub server_name: String,
}

/// Read a complete ClientHello from `reader`.
///
/// Only whole records are consumed; bytes following the last record that
/// carries the message are left unread.
pub async fn read_client_hello<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ClientHelloInfo, ClientHelloError> {
    let mut message = read_handshake_fragment(reader).await?;

    if message[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(ClientHelloError::UnexpectedHandshakeType(message[0]));
    }

    // The handshake header itself may be split across records.
    while message.len() < HANDSHAKE_HEADER_LEN {
        let fragment = read_handshake_fragment(reader).await?;
        message.extend_from_slice(&fragment);
    }

    let length = u32::from_be_bytes([0, message[1], message[2], message[3]]) as usize;
    if length > MAX_HANDSHAKE_MESSAGE_LEN {
        return Err(ClientHelloError::MessageTooLarge {
            length,
            max: MAX_HANDSHAKE_MESSAGE_LEN,
        });
    }

    let total = HANDSHAKE_HEADER_LEN + length;
    while message.len() < total {
        debug!(
            have = message.len(),
            want = total,
            "ClientHello continues in another record"
        );
        let fragment = read_handshake_fragment(reader).await?;
        message.extend_from_slice(&fragment);
    }

    parse_client_hello(&message[HANDSHAKE_HEADER_LEN..total])
}

async fn read_handshake_fragment<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, ClientHelloError> {
    let fragment = read_record(reader, CONTENT_TYPE_HANDSHAKE).await?;
    if fragment.is_empty() {
        return Err(ClientHelloError::EmptyHandshakeRecord);
    }
    Ok(fragment)
}

/// Parse a ClientHello body (the bytes after the 4-byte handshake header).
pub fn parse_client_hello(body: &[u8]) -> Result<ClientHelloInfo, ClientHelloError> {
    let mut cursor = ByteCursor::new(body);

    let version = ProtocolVersion {
        major: cursor.read_u8("legacy_version")?,
        minor: cursor.read_u8("legacy_version")?,
    };
    if version < MIN_VERSION {
        return Err(ClientHelloError::VersionTooOld {
            major: version.major,
            minor: version.minor,
        });
    }

    cursor.skip(RANDOM_LEN, "random")?;

    let session_id_len = cursor.read_u8("session_id length")? as usize;
    if session_id_len > MAX_SESSION_ID_LEN {
        return Err(ClientHelloError::InvalidSessionIdLength(session_id_len));
    }
    cursor.skip(session_id_len, "session_id")?;

    let cipher_suites_len = cursor.read_u16("cipher_suites length")? as usize;
    if cipher_suites_len % 2 != 0 {
        return Err(ClientHelloError::OddCipherSuitesLength(cipher_suites_len));
    }
    cursor.skip(cipher_suites_len, "cipher_suites")?;

    let compression_len = cursor.read_u8("compression_methods length")? as usize;
    cursor.skip(compression_len, "compression_methods")?;

    let mut info = ClientHelloInfo {
        version,
        server_name: String::new(),
    };

    if cursor.is_empty() {
        return Ok(info);
    }

    let extensions_len = cursor.read_u16("extensions length")? as usize;
    if extensions_len != cursor.remaining() {
        return Err(ClientHelloError::ExtensionsLengthMismatch {
            claimed: extensions_len,
            actual: cursor.remaining(),
        });
    }

    let mut server_name = None;
    while !cursor.is_empty() {
        let extension_type = cursor.read_u16("extension type")?;
        let extension_len = cursor.read_u16("extension length")? as usize;
        let payload = cursor.take(extension_len, "extension payload")?;

        if extension_type != EXTENSION_SERVER_NAME {
            continue;
        }

        let name = parse_server_name_extension(payload)?;
        if server_name.is_none() {
            server_name = name;
        }
    }

    if let Some(name) = server_name {
        info.server_name = name;
    }
    Ok(info)
}

/// Parse a server_name extension payload, returning the first host_name.
///
/// - 2 bytes: list length
/// - for each entry: 1 byte name type, 2 bytes name length, name
fn parse_server_name_extension(payload: &[u8]) -> Result<Option<String>, ClientHelloError> {
    let mut cursor = ByteCursor::new(payload);

    let list_len = cursor.read_u16("server_name list length")? as usize;
    if list_len != cursor.remaining() {
        return Err(ClientHelloError::ServerNameListMismatch {
            claimed: list_len,
            actual: cursor.remaining(),
        });
    }

    let mut first = None;
    while !cursor.is_empty() {
        let name_type = cursor.read_u8("name_type")?;
        if name_type != NAME_TYPE_HOST_NAME {
            return Err(ClientHelloError::UnsupportedNameType(name_type));
        }

        let name_len = cursor.read_u16("host_name length")? as usize;
        let name = cursor.take(name_len, "host_name")?;

        if first.is_none() {
            let name = std::str::from_utf8(name)
                .map_err(|_| ClientHelloError::InvalidServerName)?;
            first = Some(name.to_string());
        }
    }

    Ok(first)
}

/// Forward-only reader over a byte slice.
///
/// Every read checks the requested length against what is left before
/// touching the data.
struct ByteCursor<'a> {
    rest: &'a [u8],
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    fn remaining(&self) -> usize {
        self.rest.len()
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], ClientHelloError> {
        if n > self.rest.len() {
            return Err(ClientHelloError::Truncated {
                field,
                needed: n,
                remaining: self.rest.len(),
            });
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize, field: &'static str) -> Result<(), ClientHelloError> {
        self.take(n, field).map(|_| ())
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, ClientHelloError> {
        Ok(self.take(1, field)?[0])
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, ClientHelloError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders for hand-assembled ClientHello messages.

    fn push_u16(out: &mut Vec<u8>, value: usize) {
        out.extend_from_slice(&(value as u16).to_be_bytes());
    }

    /// Encode an extension.
    pub fn extension(extension_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = extension_type.to_be_bytes().to_vec();
        push_u16(&mut out, payload.len());
        out.extend_from_slice(payload);
        out
    }

    /// Encode a server_name extension with the given (type, name) entries.
    pub fn server_name_extension(entries: &[(u8, &[u8])]) -> Vec<u8> {
        let mut list = Vec::new();
        for (name_type, name) in entries {
            list.push(*name_type);
            push_u16(&mut list, name.len());
            list.extend_from_slice(name);
        }
        let mut payload = Vec::new();
        push_u16(&mut payload, list.len());
        payload.extend_from_slice(&list);
        extension(0, &payload)
    }

    /// Encode a ClientHello body.
    pub fn client_hello_body(version: [u8; 2], extensions: Option<&[u8]>) -> Vec<u8> {
        let mut body = version.to_vec();
        body.extend_from_slice(&[0x5a; 32]);
        // 32-byte session id
        body.push(32);
        body.extend_from_slice(&[0x07; 32]);
        // TLS_AES_128_GCM_SHA256, TLS_RSA_WITH_AES_128_CBC_SHA
        body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x00, 0x2f]);
        // null compression
        body.extend_from_slice(&[0x01, 0x00]);
        if let Some(extensions) = extensions {
            push_u16(&mut body, extensions.len());
            body.extend_from_slice(extensions);
        }
        body
    }

    /// Prefix a body with the ClientHello handshake header.
    pub fn handshake(body: &[u8]) -> Vec<u8> {
        let len = (body.len() as u32).to_be_bytes();
        let mut out = vec![1, len[1], len[2], len[3]];
        out.extend_from_slice(body);
        out
    }

    /// Split a handshake message into records of at most `max_fragment` bytes.
    pub fn records(message: &[u8], max_fragment: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in message.chunks(max_fragment) {
            out.extend_from_slice(&[22, 3, 1]);
            push_u16(&mut out, chunk.len());
            out.extend_from_slice(chunk);
        }
        out
    }

    /// A complete single-record ClientHello for `server_name`, with a
    /// padding extension ahead of the server_name extension.
    pub fn client_hello_records(server_name: &str) -> Vec<u8> {
        let mut extensions = extension(0x0015, &[0; 16]);
        extensions.extend(server_name_extension(&[(0, server_name.as_bytes())]));
        let body = client_hello_body([3, 3], Some(&extensions));
        records(&handshake(&body), 16384)
    }
}
