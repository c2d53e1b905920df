//! Typed call event bus.
//!
//! The snapshot `watch` channel answers "what is the call state now"; the
//! bus carries the edge-triggered notifications (ringing, connected, ended,
//! remote flags, stats) that a UI reacts to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::calls::MediaStats;
use crate::types::call::{CallId, CallMediaType, EndCallReason, PeerIdentity};

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 64;

/// An incoming call started ringing locally.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub conversation_id: String,
    pub peer: PeerIdentity,
    pub media_type: CallMediaType,
    pub received_at: DateTime<Utc>,
}

/// The call reached media connectivity for the first time.
#[derive(Debug, Clone)]
pub struct CallConnected {
    pub call_id: CallId,
    pub connected_at: DateTime<Utc>,
}

/// The call ended, from whatever cause. The reason is the complete
/// user-visible failure surface.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: CallId,
    pub reason: EndCallReason,
    pub ended_at: DateTime<Utc>,
    /// Seconds of connected time, when the call had connected.
    pub duration_secs: Option<i64>,
}

/// The peer's mirrored mute/camera flags changed.
#[derive(Debug, Clone)]
pub struct RemoteStateChanged {
    pub call_id: CallId,
    pub muted: bool,
    pub camera_off: bool,
}

/// Periodic quality statistics from the media engine.
#[derive(Debug, Clone)]
pub struct CallStatsUpdate {
    pub call_id: CallId,
    pub stats: MediaStats,
}

// Macro to generate CallEventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        #[derive(Debug)]
        pub struct CallEventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl CallEventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (incoming_call, Arc<IncomingCall>),
    (connected, Arc<CallConnected>),
    (ended, Arc<CallEnded>),
    (remote_state, Arc<RemoteStateChanged>),
    (stats, Arc<CallStatsUpdate>),
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}
