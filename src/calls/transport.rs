//! Signaling transport boundary.
//!
//! The transport is relay-backed and store-and-forward: delivery is
//! best-effort, unordered across envelope kinds, at-most-once per send, with
//! no guarantee after disconnect. The protocol layer never relies on
//! ordering; every handler re-validates against current call state.

use async_trait::async_trait;

use super::envelope::CallEnvelope;

/// Delivers opaque signaling envelopes to a recipient identity.
///
/// Send failures are non-fatal to the call: the session logs them and keeps
/// its current state, since the call either resolves via a later envelope or
/// via the ring timeout.
///
/// Inbound envelopes are not part of this trait; the application subscribes
/// to its relay connection and forwards each received envelope through
/// [`CallSessionHandle::handle_envelope`](crate::calls::CallSessionHandle::handle_envelope).
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, to_did: &str, envelope: CallEnvelope) -> Result<(), anyhow::Error>;
}
