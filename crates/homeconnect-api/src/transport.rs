// ── Transport seam ──
//
// The entity runtime in `homeconnect-core` issues high-level operations
// as envelope messages and only needs one capability from the wire
// stack: send a request, get the correlated response. Keeping that seam
// a trait lets unit tests substitute a scripted fake for the socket.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

/// Request/response transport over one appliance session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` and wait up to `timeout` for the correlated
    /// RESPONSE. A RESPONSE carrying an error `code` surfaces as
    /// [`crate::Error::Remote`].
    async fn send_sync(&self, message: Message, timeout: Duration) -> Result<Message>;
}
