//! Signal codec boundary: end-to-end encryption of signaling payloads.
//!
//! Encryption of signaling is a best-effort enhancement, never a
//! precondition for call establishment. When the codec reports itself
//! unavailable (no end-to-end session with the peer yet), envelopes are sent
//! as plaintext; inbound envelopes are decrypted opportunistically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::CallError;
use crate::types::call::CallId;

/// An encrypted signaling payload, addressed by call id and sender.
///
/// The timestamp is bound into the AAD by the codec along with the sender
/// and recipient DIDs, so a payload cannot be replayed across calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Hex-encoded ciphertext with authentication tag.
    pub ciphertext: String,
    /// Hex-encoded AES-GCM nonce.
    pub nonce: String,
    /// Unix millisecond timestamp at encryption time.
    pub timestamp: i64,
}

/// End-to-end encryption primitive for signaling payloads.
#[async_trait]
pub trait SignalCodec: Send + Sync {
    /// Whether an end-to-end session is usable at all. When false, callers
    /// fall back to plaintext envelopes.
    fn is_available(&self) -> bool;

    async fn encrypt(
        &self,
        to_did: &str,
        plaintext: &[u8],
        call_id: &CallId,
    ) -> Result<EncryptedPayload, CallError>;

    async fn decrypt(
        &self,
        from_did: &str,
        payload: &EncryptedPayload,
        call_id: &CallId,
    ) -> Result<Vec<u8>, CallError>;
}

/// Codec used when no end-to-end session exists: always unavailable.
pub struct PlaintextCodec;

#[async_trait]
impl SignalCodec for PlaintextCodec {
    fn is_available(&self) -> bool {
        false
    }

    async fn encrypt(
        &self,
        _to_did: &str,
        _plaintext: &[u8],
        _call_id: &CallId,
    ) -> Result<EncryptedPayload, CallError> {
        Err(CallError::Encryption("no end-to-end session".into()))
    }

    async fn decrypt(
        &self,
        _from_did: &str,
        _payload: &EncryptedPayload,
        _call_id: &CallId,
    ) -> Result<Vec<u8>, CallError> {
        Err(CallError::Encryption("no end-to-end session".into()))
    }
}

/// Toy codec for tests: hex-encodes the payload and reports available.
#[cfg(test)]
pub(crate) struct HexCodec;

#[cfg(test)]
#[async_trait]
impl SignalCodec for HexCodec {
    fn is_available(&self) -> bool {
        true
    }

    async fn encrypt(
        &self,
        _to_did: &str,
        plaintext: &[u8],
        _call_id: &CallId,
    ) -> Result<EncryptedPayload, CallError> {
        Ok(EncryptedPayload {
            ciphertext: hex::encode_upper(plaintext),
            nonce: hex::encode_upper([0u8; 12]),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn decrypt(
        &self,
        _from_did: &str,
        payload: &EncryptedPayload,
        _call_id: &CallId,
    ) -> Result<Vec<u8>, CallError> {
        hex::decode(&payload.ciphertext).map_err(|e| CallError::Encryption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plaintext_codec_is_unavailable() {
        let codec = PlaintextCodec;
        assert!(!codec.is_available());
        assert!(
            codec
                .encrypt("did:key:z6MkPeer", b"hello", &CallId::generate())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_hex_codec_roundtrip() {
        let codec = HexCodec;
        let call_id = CallId::generate();
        let sealed = codec
            .encrypt("did:key:z6MkPeer", b"signal body", &call_id)
            .await
            .unwrap();
        let opened = codec
            .decrypt("did:key:z6MkPeer", &sealed, &call_id)
            .await
            .unwrap();
        assert_eq!(opened, b"signal body");
    }
}
