//! Peer-to-peer call session management.
//!
//! This module owns the lifecycle of a single live voice/video call between
//! two DID-addressed identities, negotiated over an asynchronous, unordered,
//! relay-backed signaling channel.
//!
//! # Architecture
//!
//! - [`Call`] & [`CallPhase`]: the single mutable call aggregate and its
//!   transition table
//! - [`SignalPayload`] & [`CallEnvelope`]: the five signaling envelope kinds
//!   and their best-effort-encrypted wire form
//! - [`CallSession`] & [`CallSessionHandle`]: the single-writer actor that
//!   serializes every mutation through one mailbox
//! - [`MediaEngine`], [`SignalingTransport`], [`SignalCodec`], [`CallStore`]:
//!   the external collaborators, as trait boundaries
//!
//! # Protocol Overview
//!
//! An outgoing call sends `offer` and arms a ring timer; the callee rings,
//! accepts with `answer`, and both sides exchange `ice_candidate` envelopes
//! until media connects. `state` envelopes mirror mute/camera flags
//! best-effort, and `end` carries one of the five terminal reasons. Delivery
//! is unordered and at-most-once, so every handler re-validates against the
//! current call id and phase instead of assuming a prior step completed.

mod codec;
mod envelope;
mod error;
mod media;
mod session;
mod state;
mod store;
mod transport;


pub use codec::{EncryptedPayload, PlaintextCodec, SignalCodec};
pub use envelope::{CallEnvelope, SignalKind, SignalPayload};
pub use error::CallError;
pub use media::{
    IceCandidate, MediaConnectionState, MediaEngine, MediaEngineFactory, MediaEvent, MediaStats,
    SessionDescription,
};
pub use session::{CallSession, CallSessionConfig, CallSessionHandle};
pub use state::{Call, CallPhase, CallSnapshot, CallStatus, CallTransition, InvalidTransition};
pub use store::{CallStore, MemoryCallStore, PendingCallRecord};
pub use transport::SignalingTransport;
