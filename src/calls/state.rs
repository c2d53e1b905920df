//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::media::SessionDescription;
use crate::types::call::{
    CallDirection, CallId, CallMediaType, EndCallReason, PeerIdentity, StreamHandle,
};

/// Current phase of a call.
///
/// `Outgoing` and `Incoming` are the ringing phases; `Ended` is terminal and
/// reachable from every other phase.
#[derive(Debug, Clone, Serialize)]
pub enum CallPhase {
    /// Outgoing call: offer sent (or being produced), waiting for an answer.
    Outgoing { since: DateTime<Utc> },
    /// Incoming call: ringing locally, remote offer buffered.
    Incoming { received_at: DateTime<Utc> },
    /// Answer exchanged, media handshake in progress.
    Connecting { accepted_at: DateTime<Utc> },
    /// Media flowing.
    Connected { connected_at: DateTime<Utc> },
    /// Transient media loss; nothing is torn down.
    Reconnecting {
        connected_at: DateTime<Utc>,
        lost_at: DateTime<Utc>,
    },
    /// Call over.
    Ended {
        reason: EndCallReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallPhase {
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Outgoing { .. } | Self::Incoming { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Incoming { .. })
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// The remote answered our offer.
    RemoteAnswered,
    /// We accepted the remote's offer.
    LocalAccepted,
    /// The media transport reached connectivity. Idempotent while connected.
    MediaConnected,
    /// Transient media connectivity loss.
    MediaInterrupted,
    Terminated { reason: EndCallReason },
}

/// The single mutable call aggregate.
///
/// Owned exclusively by the session actor; every mutation flows through its
/// mailbox, so there is no locking here.
#[derive(Debug, Clone)]
pub struct Call {
    pub call_id: CallId,
    pub conversation_id: String,
    pub direction: CallDirection,
    pub media_type: CallMediaType,
    pub peer: PeerIdentity,
    pub phase: CallPhase,
    pub started_at: DateTime<Utc>,
    /// Locally authoritative; mirrored to the peer via `state` envelopes.
    pub muted: bool,
    pub camera_off: bool,
    /// Peer's mirrored flags, tracked for UI only. Never drive the local
    /// media engine.
    pub remote_muted: bool,
    pub remote_camera_off: bool,
    pub local_stream: Option<StreamHandle>,
    /// Replaced, never appended, on renegotiation.
    pub remote_stream: Option<StreamHandle>,
    /// Buffered remote offer for incoming calls, consumed by accept.
    pub pending_offer: Option<SessionDescription>,
}

impl Call {
    pub fn new_outgoing(
        call_id: CallId,
        conversation_id: String,
        peer: PeerIdentity,
        media_type: CallMediaType,
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id,
            conversation_id,
            direction: CallDirection::Outgoing,
            media_type,
            peer,
            phase: CallPhase::Outgoing { since: now },
            started_at: now,
            muted: false,
            camera_off: !media_type.is_video(),
            remote_muted: false,
            remote_camera_off: !media_type.is_video(),
            local_stream: None,
            remote_stream: None,
            pending_offer: None,
        }
    }

    pub fn new_incoming(
        call_id: CallId,
        conversation_id: String,
        peer: PeerIdentity,
        media_type: CallMediaType,
        offer: SessionDescription,
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id,
            conversation_id,
            direction: CallDirection::Incoming,
            media_type,
            peer,
            phase: CallPhase::Incoming { received_at: now },
            started_at: now,
            muted: false,
            camera_off: !media_type.is_video(),
            remote_muted: false,
            remote_camera_off: !media_type.is_video(),
            local_stream: None,
            remote_stream: None,
            pending_offer: Some(offer),
        }
    }

    /// When the call first reached `Connected`, preserved across
    /// `Connected ⇄ Reconnecting`.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        match &self.phase {
            CallPhase::Connected { connected_at }
            | CallPhase::Reconnecting { connected_at, .. } => Some(*connected_at),
            _ => None,
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_phase = match (&self.phase, transition) {
            (CallPhase::Outgoing { .. }, CallTransition::RemoteAnswered) => CallPhase::Connecting {
                accepted_at: Utc::now(),
            },
            (CallPhase::Incoming { .. }, CallTransition::LocalAccepted) => CallPhase::Connecting {
                accepted_at: Utc::now(),
            },
            (CallPhase::Connecting { .. }, CallTransition::MediaConnected) => {
                CallPhase::Connected {
                    connected_at: Utc::now(),
                }
            }
            // Repeated connectivity notifications while connected are a no-op.
            (CallPhase::Connected { .. }, CallTransition::MediaConnected) => return Ok(()),
            (CallPhase::Reconnecting { connected_at, .. }, CallTransition::MediaConnected) => {
                CallPhase::Connected {
                    connected_at: *connected_at,
                }
            }
            (CallPhase::Connected { connected_at }, CallTransition::MediaInterrupted) => {
                CallPhase::Reconnecting {
                    connected_at: *connected_at,
                    lost_at: Utc::now(),
                }
            }
            (phase, CallTransition::Terminated { reason }) if !phase.is_ended() => {
                let ended_at = Utc::now();
                let duration_secs = self
                    .connected_at()
                    .map(|at| ended_at.signed_duration_since(at).num_seconds());
                CallPhase::Ended {
                    reason,
                    ended_at,
                    duration_secs,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.phase = new_phase;
        Ok(())
    }

    /// Read-only view published to observers.
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            conversation_id: self.conversation_id.clone(),
            direction: self.direction,
            media_type: self.media_type,
            peer: self.peer.clone(),
            status: match self.phase {
                CallPhase::Outgoing { .. } => CallStatus::Outgoing,
                CallPhase::Incoming { .. } => CallStatus::Incoming,
                CallPhase::Connecting { .. } => CallStatus::Connecting,
                CallPhase::Connected { .. } => CallStatus::Connected,
                CallPhase::Reconnecting { .. } => CallStatus::Reconnecting,
                CallPhase::Ended { .. } => CallStatus::Ended,
            },
            started_at: self.started_at,
            connected_at: self.connected_at(),
            muted: self.muted,
            camera_off: self.camera_off,
            remote_muted: self.remote_muted,
            remote_camera_off: self.remote_camera_off,
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
        }
    }
}

/// Flat status for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Outgoing,
    Incoming,
    Connecting,
    Connected,
    Reconnecting,
    Ended,
}

/// Consistent read-only view of the current call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub conversation_id: String,
    pub direction: CallDirection,
    pub media_type: CallMediaType,
    pub peer: PeerIdentity,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub camera_off: bool,
    pub remote_muted: bool,
    pub remote_camera_off: bool,
    pub local_stream: Option<StreamHandle>,
    pub remote_stream: Option<StreamHandle>,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_outgoing_call() -> Call {
        Call::new_outgoing(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            "conv-alice-bob".to_string(),
            PeerIdentity::new("did:key:z6MkBob").with_display_name("Bob"),
            CallMediaType::Voice,
        )
    }

    fn make_incoming_call() -> Call {
        Call::new_incoming(
            CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
            "conv-alice-bob".to_string(),
            PeerIdentity::new("did:key:z6MkAlice"),
            CallMediaType::Video,
            SessionDescription::offer("v=0"),
        )
    }

    /// Flow: Outgoing → Connecting → Connected → Ended.
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing_call();
        assert!(call.phase.is_ringing());

        call.apply_transition(CallTransition::RemoteAnswered).unwrap();
        assert!(matches!(call.phase, CallPhase::Connecting { .. }));

        call.apply_transition(CallTransition::MediaConnected).unwrap();
        assert!(call.connected_at().is_some());

        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::Completed,
        })
        .unwrap();
        assert!(call.phase.is_ended());

        if let CallPhase::Ended { duration_secs, .. } = call.phase {
            assert!(duration_secs.is_some());
        }
    }

    /// Flow: Incoming → Connecting → Connected → Ended.
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming_call();
        assert!(call.phase.can_accept());
        assert!(call.pending_offer.is_some());

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        assert!(matches!(call.phase, CallPhase::Connecting { .. }));

        call.apply_transition(CallTransition::MediaConnected).unwrap();
        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::Completed,
        })
        .unwrap();
        assert!(call.phase.is_ended());
    }

    /// An outgoing ring can end as declined without ever connecting.
    #[test]
    fn test_outgoing_call_declined() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::Declined,
        })
        .unwrap();

        if let CallPhase::Ended {
            reason,
            duration_secs,
            ..
        } = call.phase
        {
            assert_eq!(reason, EndCallReason::Declined);
            assert_eq!(duration_secs, None);
        } else {
            panic!("call should be ended");
        }
    }

    /// Repeated connected notifications while connected are a no-op.
    #[test]
    fn test_media_connected_is_idempotent() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::RemoteAnswered).unwrap();
        call.apply_transition(CallTransition::MediaConnected).unwrap();

        let first = call.connected_at().unwrap();
        call.apply_transition(CallTransition::MediaConnected).unwrap();
        assert_eq!(call.connected_at(), Some(first));
    }

    /// Reconnecting keeps connected_at so duration spans the interruption.
    #[test]
    fn test_reconnect_preserves_connected_at() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::RemoteAnswered).unwrap();
        call.apply_transition(CallTransition::MediaConnected).unwrap();
        let connected_at = call.connected_at().unwrap();

        call.apply_transition(CallTransition::MediaInterrupted).unwrap();
        assert!(matches!(call.phase, CallPhase::Reconnecting { .. }));
        assert_eq!(call.connected_at(), Some(connected_at));

        call.apply_transition(CallTransition::MediaConnected).unwrap();
        assert!(matches!(call.phase, CallPhase::Connected { .. }));
        assert_eq!(call.connected_at(), Some(connected_at));
    }

    /// Termination is allowed from every non-ended phase.
    #[test]
    fn test_terminate_from_any_phase() {
        for transitions in [
            vec![],
            vec![CallTransition::RemoteAnswered],
            vec![CallTransition::RemoteAnswered, CallTransition::MediaConnected],
            vec![
                CallTransition::RemoteAnswered,
                CallTransition::MediaConnected,
                CallTransition::MediaInterrupted,
            ],
        ] {
            let mut call = make_outgoing_call();
            for t in transitions {
                call.apply_transition(t).unwrap();
            }
            call.apply_transition(CallTransition::Terminated {
                reason: EndCallReason::Cancelled,
            })
            .unwrap();
            assert!(call.phase.is_ended());
        }
    }

    /// Invalid transitions are rejected without mutating the call.
    #[test]
    fn test_invalid_transitions() {
        let mut call = make_outgoing_call();

        // Can't accept our own outgoing call.
        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        // Can't reach connected straight from ringing.
        assert!(call.apply_transition(CallTransition::MediaConnected).is_err());
        // Can't lose media before having it.
        assert!(
            call.apply_transition(CallTransition::MediaInterrupted)
                .is_err()
        );
        assert!(call.phase.is_ringing());
    }

    /// Ended is terminal.
    #[test]
    fn test_ended_call_rejects_transitions() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::Declined,
        })
        .unwrap();

        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        assert!(call.apply_transition(CallTransition::MediaConnected).is_err());
        assert!(
            call.apply_transition(CallTransition::Terminated {
                reason: EndCallReason::Completed,
            })
            .is_err()
        );
    }

    /// Voice calls start camera-off, video calls camera-on.
    #[test]
    fn test_initial_camera_flag_follows_media_type() {
        assert!(make_outgoing_call().camera_off);
        assert!(!make_incoming_call().camera_off);
    }

    #[test]
    fn test_snapshot_reflects_phase() {
        let mut call = make_outgoing_call();
        assert_eq!(call.snapshot().status, CallStatus::Outgoing);
        assert_eq!(call.snapshot().connected_at, None);

        call.apply_transition(CallTransition::RemoteAnswered).unwrap();
        call.apply_transition(CallTransition::MediaConnected).unwrap();
        let snapshot = call.snapshot();
        assert_eq!(snapshot.status, CallStatus::Connected);
        assert!(snapshot.connected_at.is_some());
        assert_eq!(snapshot.peer.label(), "Bob");
    }
}
