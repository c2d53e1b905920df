//! Peer-to-peer call session manager for Umbra.
//!
//! Negotiates, maintains, and tears down a single live voice/video call
//! between two identities over an unreliable, store-and-forward signaling
//! relay. The media engine, the transport, the end-to-end signal codec, and
//! the recoverable call store are external collaborators consumed through
//! trait boundaries; everything stateful lives in the single-writer
//! [`calls::CallSession`] actor.

pub mod calls;
pub mod types;

pub use calls::{CallSession, CallSessionConfig, CallSessionHandle};
pub use types::call::{
    CallDirection, CallId, CallMediaType, EndCallReason, PeerIdentity, StreamHandle,
};
