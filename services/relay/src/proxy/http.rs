//! HTTP/1.x Host header sniffing.
//!
//! Reads the request line and headers of a plaintext HTTP request to find
//! the `Host` header. Lines are capped at [`MAX_LINE_LEN`] bytes; the
//! request line is ignored.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Maximum length of a single request or header line, terminator included.
pub const MAX_LINE_LEN: usize = 1024;

/// Header prefix matched byte-for-byte (case-sensitive, single space).
const HOST_HEADER_PREFIX: &[u8] = b"Host: ";

/// Response for malformed or disallowed requests.
pub const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.0 400 Bad Request\r\nContent-Type: text/plain\r\n\r\nBad Request\r\n";

/// Response when the backend cannot be reached.
pub const SERVICE_UNAVAILABLE_RESPONSE: &[u8] =
    b"HTTP/1.0 503 Service Unavailable\r\nContent-Type: text/plain\r\n\r\nService Unavailable\r\n";

/// Errors raised while reading request headers.
#[derive(Debug, Error)]
pub enum HostHeaderError {
    #[error("reading request: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read initial line")]
    MissingRequestLine,

    #[error("line exceeds 1024 bytes")]
    LineTooLong,

    #[error("saw multiple Host headers")]
    MultipleHostHeaders,

    #[error("Host header is not valid UTF-8")]
    InvalidHost,
}

/// Outcome of reading the request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostHeader {
    /// Value of the Host header, empty if none was sent.
    pub host: String,
    /// Whether the blank line ending the headers was reached.
    pub saw_all_headers: bool,
}

/// Read the request line and headers, returning the Host header value.
///
/// Stops at the first blank line. Input that ends before the blank line
/// is reported through [`HostHeader::saw_all_headers`] rather than as an
/// error.
pub async fn read_host_header<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<HostHeader, HostHeaderError> {
    let mut line = Vec::with_capacity(MAX_LINE_LEN);

    if !next_line(reader, &mut line).await? {
        return Err(HostHeaderError::MissingRequestLine);
    }

    let mut host: Option<String> = None;
    let mut saw_all_headers = false;

    while next_line(reader, &mut line).await? {
        if line.is_empty() {
            saw_all_headers = true;
            break;
        }

        let Some(value) = line.strip_prefix(HOST_HEADER_PREFIX) else {
            continue;
        };

        if host.is_some() {
            return Err(HostHeaderError::MultipleHostHeaders);
        }
        let value = std::str::from_utf8(value).map_err(|_| HostHeaderError::InvalidHost)?;
        host = Some(value.to_string());
    }

    Ok(HostHeader {
        host: host.unwrap_or_default(),
        saw_all_headers,
    })
}

/// Read one line into `line` without its `\n` or `\r\n` terminator.
///
/// Returns false at end of input. A final unterminated line is returned
/// as-is.
async fn next_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
) -> Result<bool, HostHeaderError> {
    line.clear();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', line)
        .await?;

    if n == 0 {
        return Ok(false);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if n == MAX_LINE_LEN {
        return Err(HostHeaderError::LineTooLong);
    }

    Ok(true)
}
