//! Signaling envelope protocol.
//!
//! Five envelope kinds, each scoped by call id and carrying the sender's
//! DID: `offer`, `answer`, `ice_candidate`, `state`, `end`. Envelopes ride
//! the relay as JSON; outbound payloads are sealed through the signal codec
//! when it is available and fall back to plaintext otherwise, and inbound
//! payloads are opened opportunistically.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::codec::{EncryptedPayload, SignalCodec};
use super::error::CallError;
use super::media::SessionDescription;
use crate::types::call::{CallId, CallMediaType, EndCallReason};

/// The body of a signaling envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Initial call offer. Carries everything the callee needs to ring.
    Offer {
        call_type: CallMediaType,
        conversation_id: String,
        sdp: SessionDescription,
    },
    /// Answer from the callee; completes the offer/answer exchange.
    Answer { sdp: SessionDescription },
    /// A single negotiation candidate. May arrive at any point relative to
    /// the other kinds.
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
    /// Best-effort mirror of the sender's mute/camera flags. Loss only
    /// delays UI reflection.
    State { muted: bool, camera_off: bool },
    /// Call termination with reason. Sent by either side.
    End { reason: EndCallReason },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::IceCandidate { .. } => SignalKind::IceCandidate,
            Self::State { .. } => SignalKind::State,
            Self::End { .. } => SignalKind::End,
        }
    }
}

/// Signaling kinds, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    State,
    End,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
        Self::State,
        Self::End,
    ];

    /// Tag used on the wire (the serde `type` field).
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::State => "state",
            Self::End => "end",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice_candidate" => Some(Self::IceCandidate),
            "state" => Some(Self::State),
            "end" => Some(Self::End),
            _ => None,
        }
    }

    /// Whether this kind changes call lifecycle state, as opposed to the
    /// best-effort kinds whose loss only degrades quality or UI.
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::End)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// A call-id-scoped signaling envelope as delivered by the transport.
///
/// Exactly one of `enc` and `signal` is populated by [`CallEnvelope::seal`];
/// inbound envelopes may carry either shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub call_id: CallId,
    /// Sender DID.
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc: Option<EncryptedPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalPayload>,
}

impl CallEnvelope {
    /// Build an outbound envelope, encrypting the payload for the recipient
    /// when the codec is available and falling back to plaintext when it is
    /// not (or when encryption fails). Signaling availability wins over
    /// confidentiality enforcement at this layer.
    pub async fn seal(
        call_id: &CallId,
        sender_did: &str,
        recipient_did: &str,
        payload: SignalPayload,
        codec: &dyn SignalCodec,
    ) -> CallEnvelope {
        if codec.is_available() {
            match serde_json::to_vec(&payload) {
                Ok(body) => match codec.encrypt(recipient_did, &body, call_id).await {
                    Ok(enc) => {
                        return CallEnvelope {
                            call_id: call_id.clone(),
                            sender: sender_did.to_string(),
                            enc: Some(enc),
                            signal: None,
                        };
                    }
                    Err(e) => {
                        warn!(
                            "encryption failed for {} envelope on call {call_id}, sending plaintext: {e}",
                            payload.kind()
                        );
                    }
                },
                Err(e) => warn!("failed to serialize {} payload: {e}", payload.kind()),
            }
        }
        CallEnvelope {
            call_id: call_id.clone(),
            sender: sender_did.to_string(),
            enc: None,
            signal: Some(payload),
        }
    }

    /// Recover the payload from an inbound envelope.
    ///
    /// Encrypted payloads are decrypted; on decryption failure, or when the
    /// envelope lacks the encrypted shape entirely, the plaintext `signal`
    /// field is used instead. An envelope carrying neither is a protocol
    /// error.
    pub async fn open(self, codec: &dyn SignalCodec) -> Result<SignalPayload, CallError> {
        if let Some(enc) = &self.enc {
            match codec.decrypt(&self.sender, enc, &self.call_id).await {
                Ok(body) => match serde_json::from_slice::<SignalPayload>(&body) {
                    Ok(payload) => return Ok(payload),
                    Err(e) => {
                        warn!(
                            "decrypted payload for call {} is malformed: {e}",
                            self.call_id
                        );
                    }
                },
                Err(e) => {
                    debug!(
                        "decryption failed for call {} from {}, trying plaintext: {e}",
                        self.call_id, self.sender
                    );
                }
            }
        }
        self.signal.ok_or_else(|| {
            CallError::Parse("envelope carries neither ciphertext nor plaintext signal".into())
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CallError> {
        serde_json::to_vec(self).map_err(|e| CallError::Parse(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CallError> {
        serde_json::from_slice(bytes).map_err(|e| CallError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::codec::{HexCodec, PlaintextCodec};

    fn offer_payload() -> SignalPayload {
        SignalPayload::Offer {
            call_type: CallMediaType::Voice,
            conversation_id: "conv-1".to_string(),
            sdp: SessionDescription::offer("v=0"),
        }
    }

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_tag(kind.tag_name()), Some(kind));
        }
        assert_eq!(SignalKind::from_tag("preaccept"), None);
    }

    #[test]
    fn test_critical_kinds() {
        assert!(SignalKind::Offer.is_critical());
        assert!(SignalKind::Answer.is_critical());
        assert!(SignalKind::End.is_critical());
        assert!(!SignalKind::IceCandidate.is_critical());
        assert!(!SignalKind::State.is_critical());
    }

    #[test]
    fn test_wire_format_tags() {
        let json = serde_json::to_value(offer_payload()).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["call_type"], "voice");

        let end = serde_json::to_value(SignalPayload::End {
            reason: EndCallReason::Busy,
        })
        .unwrap();
        assert_eq!(end["type"], "end");
        assert_eq!(end["reason"], "busy");
    }

    #[tokio::test]
    async fn test_seal_falls_back_to_plaintext_when_codec_unavailable() {
        let call_id = CallId::generate();
        let envelope = CallEnvelope::seal(
            &call_id,
            "did:key:z6MkAlice",
            "did:key:z6MkBob",
            offer_payload(),
            &PlaintextCodec,
        )
        .await;

        assert!(envelope.enc.is_none());
        assert_eq!(envelope.signal, Some(offer_payload()));
        assert_eq!(
            envelope.open(&PlaintextCodec).await.unwrap(),
            offer_payload()
        );
    }

    #[tokio::test]
    async fn test_seal_encrypts_when_codec_available() {
        let call_id = CallId::generate();
        let envelope = CallEnvelope::seal(
            &call_id,
            "did:key:z6MkAlice",
            "did:key:z6MkBob",
            offer_payload(),
            &HexCodec,
        )
        .await;

        assert!(envelope.enc.is_some());
        assert!(envelope.signal.is_none());
        assert_eq!(envelope.open(&HexCodec).await.unwrap(), offer_payload());
    }

    #[tokio::test]
    async fn test_open_treats_unencrypted_envelope_as_plaintext() {
        // Receiver has a working codec, sender did not encrypt.
        let envelope = CallEnvelope {
            call_id: CallId::generate(),
            sender: "did:key:z6MkAlice".to_string(),
            enc: None,
            signal: Some(SignalPayload::State {
                muted: true,
                camera_off: false,
            }),
        };
        let payload = envelope.open(&HexCodec).await.unwrap();
        assert_eq!(
            payload,
            SignalPayload::State {
                muted: true,
                camera_off: false,
            }
        );
    }

    #[tokio::test]
    async fn test_open_rejects_empty_envelope() {
        let envelope = CallEnvelope {
            call_id: CallId::generate(),
            sender: "did:key:z6MkAlice".to_string(),
            enc: None,
            signal: None,
        };
        assert!(matches!(
            envelope.open(&PlaintextCodec).await,
            Err(CallError::Parse(_))
        ));
    }

    #[test]
    fn test_envelope_bytes_roundtrip() {
        let envelope = CallEnvelope {
            call_id: CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            sender: "did:key:z6MkAlice".to_string(),
            enc: None,
            signal: Some(SignalPayload::End {
                reason: EndCallReason::Timeout,
            }),
        };
        let bytes = envelope.to_bytes().unwrap();
        let parsed = CallEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.call_id, envelope.call_id);
        assert_eq!(parsed.signal, envelope.signal);
    }
}
