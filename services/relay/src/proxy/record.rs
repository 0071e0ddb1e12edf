//! TLS record layer framing.
//!
//! Record structure:
//! - byte 0: content type (22 = handshake, 21 = alert)
//! - bytes 1-2: legacy record version
//! - bytes 3-4: fragment length
//! - bytes 5+: fragment
//!
//! Reference: RFC 5246 section 6.2.1

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::sni::ClientHelloError;

/// Length of a TLS record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Content type of handshake records.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// Content type of alert records.
pub const CONTENT_TYPE_ALERT: u8 = 21;

/// Alert level for fatal alerts.
const ALERT_LEVEL_FATAL: u8 = 2;

/// TLS alert descriptions the relay sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    /// Structural violations and anything the relay cannot handle.
    InternalError = 80,
    /// Missing, unsupported or disallowed server names.
    UnrecognizedName = 112,
}

impl AlertDescription {
    /// Wire code of this alert.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Encode a fatal alert record carrying this description.
    ///
    /// The record advertises TLS 1.0 so that any client can parse it.
    pub fn to_record(self) -> [u8; 7] {
        [
            CONTENT_TYPE_ALERT,
            3,
            1,
            0,
            2,
            ALERT_LEVEL_FATAL,
            self.code(),
        ]
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InternalError => write!(f, "internal_error({})", self.code()),
            Self::UnrecognizedName => write!(f, "unrecognized_name({})", self.code()),
        }
    }
}

/// Read one record of the expected content type and return its fragment.
///
/// Fails if the header or fragment is cut short, or if the content type
/// does not match.
pub async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    content_type: u8,
) -> Result<Vec<u8>, ClientHelloError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(ClientHelloError::RecordHeader)?;

    if header[0] != content_type {
        return Err(ClientHelloError::UnexpectedContentType {
            got: header[0],
            want: content_type,
        });
    }

    let length = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut fragment = vec![0u8; length];
    reader
        .read_exact(&mut fragment)
        .await
        .map_err(|source| ClientHelloError::RecordFragment { length, source })?;

    Ok(fragment)
}
