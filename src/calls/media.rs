//! Media engine boundary.
//!
//! The media engine produces and consumes session descriptions, gathers ICE
//! candidates, and owns the actual capture/playback resources. The session
//! drives it through [`MediaEngine`] and receives engine-originated events
//! over an mpsc channel handed to the [`MediaEngineFactory`]. A fresh engine
//! is constructed for every call and discarded at teardown; engines are
//! never reused across calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::CallError;
use crate::types::call::{AudioQuality, StreamHandle, VideoQuality};

/// A negotiated media-capability document exchanged during offer/answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer".
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// A single ICE candidate fragment with its optional SDP metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}

/// Connectivity of the engine's underlying media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    /// Media is flowing.
    Connected,
    /// Transient connectivity loss; the engine is trying to recover.
    Disconnected,
    /// Unrecoverable failure.
    Failed,
    /// The engine was closed.
    Closed,
}

/// Periodic call quality statistics reported by the engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaStats {
    pub rtt_ms: Option<u32>,
    pub packets_lost: u64,
    pub audio_bitrate_kbps: Option<u32>,
    pub video_bitrate_kbps: Option<u32>,
}

/// Events originated by the media engine, delivered to the owning session.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A locally gathered ICE candidate that must be signaled to the peer.
    IceCandidate(IceCandidate),
    /// The remote stream became available or was renegotiated. Replaces any
    /// previously attached remote stream.
    RemoteStream(StreamHandle),
    ConnectionState(MediaConnectionState),
    Stats(MediaStats),
}

/// Narrow interface over the platform media stack.
///
/// `create_offer`, `accept_offer` and `complete_handshake` may take
/// arbitrary wall-clock time (permission prompts, hardware acquisition); the
/// session runs them off its mailbox and discards stale results.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self, video: bool) -> Result<SessionDescription, CallError>;

    async fn accept_offer(
        &self,
        remote: &SessionDescription,
        video: bool,
    ) -> Result<SessionDescription, CallError>;

    async fn complete_handshake(&self, remote: &SessionDescription) -> Result<(), CallError>;

    /// Candidates received before the handshake completes are buffered by
    /// the engine.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    /// Returns the new muted flag.
    async fn toggle_mute(&self) -> bool;

    /// Returns the new camera-off flag.
    async fn toggle_camera(&self) -> bool;

    async fn set_video_quality(&self, quality: VideoQuality);

    async fn set_audio_quality(&self, quality: AudioQuality);

    /// Playback gain, 0.0..=2.0.
    async fn set_volume(&self, level: f32);

    async fn switch_camera(&self);

    async fn start_screen_share(&self) -> Result<(), CallError>;

    async fn stop_screen_share(&self);

    async fn start_stats(&self, interval: Duration);

    async fn stop_stats(&self);

    /// Handle to the local capture stream, available from construction.
    fn local_stream(&self) -> StreamHandle;

    /// Release all engine resources. Called exactly once, at call teardown.
    async fn close(&self);
}

/// Constructs one fresh [`MediaEngine`] per call.
pub trait MediaEngineFactory: Send + Sync {
    fn create(&self, events: mpsc::UnboundedSender<MediaEvent>) -> Arc<dyn MediaEngine>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_candidate_builder() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0);

        assert!(candidate.candidate.starts_with("candidate:"));
        assert_eq!(candidate.sdp_mid, Some("0".to_string()));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_session_description_constructors() {
        let offer = SessionDescription::offer("v=0");
        assert_eq!(offer.sdp_type, "offer");
        let answer = SessionDescription::answer("v=0");
        assert_eq!(answer.sdp_type, "answer");
    }
}
