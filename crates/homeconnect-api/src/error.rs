use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the `homeconnect-api` crate.
///
/// Covers every failure mode across the wire stack: key material,
/// framing, transport, the session handshake, and appliance-reported
/// errors. Frame-local failures ([`Error::Protocol`]) are logged and
/// dropped by the session; everything else propagates to the caller
/// that triggered it.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame (length, padding), MAC mismatch, or envelope
    /// decode failure. The offending frame is dropped; the session
    /// keeps running.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The session is not connected, or the socket closed underneath
    /// an in-flight call.
    #[error("session is not connected")]
    NotConnected,

    /// No response arrived in time. The timeout form of a dead link --
    /// callers that only care about "is the appliance gone" should use
    /// [`Error::is_disconnect`].
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// A RESPONSE carried an error `code`.
    #[error("appliance returned code {code} on {resource}")]
    Remote { code: i32, resource: String },

    /// The handshake aborted; carries the first error encountered.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// WebSocket connection or upgrade failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocket(String),

    /// TLS-PSK context construction or handshake failed.
    #[error("TLS-PSK setup failed: {0}")]
    Tls(String),

    /// PSK or IV material could not be decoded.
    #[error("invalid key material: {0}")]
    KeyMaterial(String),
}

impl Error {
    /// Returns `true` when the failure means the link is gone (or never
    /// came up), as opposed to the appliance rejecting one request.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Timeout(_) | Self::WebSocket(_)
        )
    }

    /// Returns the appliance error code, if this is a remote rejection.
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
