//! Core call types shared across the crate.

use serde::{Deserialize, Serialize};

/// Unique call identifier: 32 uppercase hex characters.
///
/// Generated locally for outgoing calls, echoed from the offer for incoming
/// ones. Immutable for the call's lifetime and the sole correlation key for
/// every signaling envelope belonging to the call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random call id.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The counterpart in a call: a DID plus an optional display name.
///
/// The DID is the routing address; the display name is carried for UI
/// association only and is never trusted for correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub did: String,
    pub display_name: Option<String>,
}

impl PeerIdentity {
    pub fn new(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name to render for this peer.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.did)
    }
}

/// Media type of a call, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMediaType {
    Voice,
    Video,
}

impl CallMediaType {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::fmt::Display for CallMediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Voice => "voice",
            Self::Video => "video",
        })
    }
}

/// Direction of a call relative to the local identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call ended. This is the complete user-visible failure surface;
/// internal errors never propagate past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndCallReason {
    /// Normal hang-up of a connected call.
    Completed,
    /// Caller gave up before the callee answered.
    Cancelled,
    /// Ring timer fired before the call was answered.
    Timeout,
    /// Callee already had a call in progress.
    Busy,
    /// Callee rejected the call.
    Declined,
}

impl EndCallReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::Declined => "declined",
        }
    }
}

impl std::fmt::Display for EndCallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested video capture/encode quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    Standard,
    High,
}

/// Requested audio capture/encode quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Low,
    Standard,
    High,
}

/// Opaque handle to a media stream owned by the media engine.
///
/// The session tracks handles only; the engine owns the actual streams and
/// releases them when the engine is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle(String);

impl StreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_generate_shape() {
        let id = CallId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(
            id.as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
        );
        assert_ne!(id, CallId::generate());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&CallMediaType::Voice).unwrap(),
            "\"voice\""
        );
        assert_eq!(
            serde_json::to_string(&EndCallReason::Busy).unwrap(),
            "\"busy\""
        );
        assert_eq!(
            serde_json::from_str::<EndCallReason>("\"timeout\"").unwrap(),
            EndCallReason::Timeout
        );
    }

    #[test]
    fn test_peer_label_falls_back_to_did() {
        let bare = PeerIdentity::new("did:key:z6MkTest");
        assert_eq!(bare.label(), "did:key:z6MkTest");

        let named = bare.clone().with_display_name("Alice");
        assert_eq!(named.label(), "Alice");
    }
}
