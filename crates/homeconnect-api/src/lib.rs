//! Async Rust client for the Home Connect local-network protocol.
//!
//! Home Connect appliances (ovens, dishwashers, washers, ...) expose a
//! JSON-over-WebSocket service on the LAN. Depending on the appliance
//! generation the socket is protected one of two ways:
//!
//! - **AES mode** ([`Mode::Aes`]) — plain `ws://` on port 80, with every
//!   frame wrapped in AES-256-CBC ciphertext and a rolling truncated
//!   HMAC-SHA-256 chain that binds each frame to all prior frames in the
//!   same direction. See [`framing`].
//! - **TLS-PSK mode** ([`Mode::TlsPsk`]) — `wss://` on port 443 over
//!   TLS 1.2 with a pre-shared-key cipher suite and no certificates.
//!   See [`tls`].
//!
//! Either way the payload is the same message envelope ([`Message`]) and
//! the same session protocol: an appliance-initiated handshake, numeric
//! request/response correlation, push notifications, and idle keepalive
//! probing. [`Session`] owns all of that.
//!
//! Higher layers (the entity runtime in `homeconnect-core`) depend on this
//! crate only through the [`Transport`] trait, so they can be tested
//! against a fake without a socket.

pub mod error;
pub mod framing;
pub mod message;
pub mod psk;
pub mod session;
pub mod tls;
pub mod transport;

pub use error::{Error, Result};
pub use message::{lenient_i64, Action, Message};
pub use session::{Mode, Session, SessionConfig, SessionPhase};
pub use transport::Transport;
