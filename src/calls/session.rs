//! Single-writer call session actor.
//!
//! One tokio task owns the one [`Call`] aggregate. Local UI commands,
//! inbound signaling envelopes, media engine events, ring-timer firings and
//! the completions of spawned media operations are all messages into a
//! single mailbox, processed strictly in arrival order — so an accept that
//! is enqueued before the ring timeout always beats the timer, and there is
//! no check/use gap anywhere.
//!
//! Long-running media operations (capture, offer/answer production) run in
//! spawned tasks and post their results back tagged with the owning call
//! id; results for a call that is no longer current are discarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::codec::SignalCodec;
use super::envelope::{CallEnvelope, SignalPayload};
use super::error::CallError;
use super::media::{
    IceCandidate, MediaConnectionState, MediaEngine, MediaEngineFactory, MediaEvent,
    SessionDescription,
};
use super::state::{Call, CallPhase, CallSnapshot, CallTransition, InvalidTransition};
use super::store::{CallStore, PendingCallRecord};
use super::transport::SignalingTransport;
use crate::types::call::{
    AudioQuality, CallDirection, CallId, CallMediaType, EndCallReason, PeerIdentity, VideoQuality,
};
use crate::types::events::{
    CallConnected, CallEnded, CallEventBus, CallStatsUpdate, IncomingCall, RemoteStateChanged,
};

/// Configuration for the call session.
#[derive(Debug, Clone)]
pub struct CallSessionConfig {
    /// How long an unanswered call may ring before automatic termination.
    pub ring_timeout: Duration,
    /// Stats collection interval once connected; `None` disables stats.
    pub stats_interval: Option<Duration>,
}

impl Default for CallSessionConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            stats_interval: Some(Duration::from_secs(2)),
        }
    }
}

enum SessionCommand {
    Start {
        conversation_id: String,
        peer: PeerIdentity,
        media_type: CallMediaType,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reason: Option<EndCallReason>,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    SetVideoQuality(VideoQuality),
    SetAudioQuality(AudioQuality),
    SetVolume(f32),
    SwitchCamera,
    StartScreenShare {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    StopScreenShare,
    Envelope(CallEnvelope),
    Media {
        call_id: CallId,
        event: MediaEvent,
    },
    OfferReady {
        call_id: CallId,
        result: Result<SessionDescription, CallError>,
    },
    AnswerReady {
        call_id: CallId,
        result: Result<SessionDescription, CallError>,
    },
    HandshakeFinished {
        call_id: CallId,
        result: Result<(), CallError>,
    },
    RingTimeout {
        call_id: CallId,
    },
}

/// Cloneable handle to a running call session.
///
/// This is the surface the UI/API layer and the transport subscription talk
/// to; all methods funnel into the session mailbox.
#[derive(Clone)]
pub struct CallSessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot_rx: watch::Receiver<Option<CallSnapshot>>,
    events: Arc<CallEventBus>,
}

impl CallSessionHandle {
    pub async fn start_call(
        &self,
        conversation_id: impl Into<String>,
        peer: PeerIdentity,
        media_type: CallMediaType,
    ) -> Result<CallId, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Start {
            conversation_id: conversation_id.into(),
            peer,
            media_type,
            reply,
        })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Accept { reply })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// End the current call. Without an explicit reason, the reason is
    /// derived from the call phase (`completed` once connected, `cancelled`
    /// for an outgoing ring, `declined` for an incoming one).
    pub async fn end_call(&self, reason: Option<EndCallReason>) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::End { reason, reply })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Returns the new muted flag.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ToggleMute { reply })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Returns the new camera-off flag.
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ToggleCamera { reply })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    pub fn set_video_quality(&self, quality: VideoQuality) {
        let _ = self.send(SessionCommand::SetVideoQuality(quality));
    }

    pub fn set_audio_quality(&self, quality: AudioQuality) {
        let _ = self.send(SessionCommand::SetAudioQuality(quality));
    }

    pub fn set_volume(&self, level: f32) {
        let _ = self.send(SessionCommand::SetVolume(level));
    }

    pub fn switch_camera(&self) {
        let _ = self.send(SessionCommand::SwitchCamera);
    }

    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::StartScreenShare { reply })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    pub fn stop_screen_share(&self) {
        let _ = self.send(SessionCommand::StopScreenShare);
    }

    /// Feed an inbound envelope from the transport subscription.
    pub fn handle_envelope(&self, envelope: CallEnvelope) {
        let _ = self.send(SessionCommand::Envelope(envelope));
    }

    /// Read-only view of the current call, `None` when idle.
    pub fn current_call(&self) -> Option<CallSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn watch_call(&self) -> watch::Receiver<Option<CallSnapshot>> {
        self.snapshot_rx.clone()
    }

    pub fn events(&self) -> Arc<CallEventBus> {
        self.events.clone()
    }

    fn send(&self, command: SessionCommand) -> Result<(), CallError> {
        self.commands
            .send(command)
            .map_err(|_| CallError::SessionClosed)
    }
}

struct ActiveCall {
    call: Call,
    engine: Arc<dyn MediaEngine>,
    ring_timer: Option<JoinHandle<()>>,
    /// Forwards engine events into the mailbox, tagged with the call id.
    media_feed: JoinHandle<()>,
}

/// The call session actor.
pub struct CallSession {
    identity: PeerIdentity,
    config: CallSessionConfig,
    engines: Arc<dyn MediaEngineFactory>,
    transport: Arc<dyn SignalingTransport>,
    codec: Arc<dyn SignalCodec>,
    store: Arc<dyn CallStore>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot_tx: watch::Sender<Option<CallSnapshot>>,
    events: Arc<CallEventBus>,
    call: Option<ActiveCall>,
}

impl CallSession {
    /// Spawn the session task and return its handle.
    pub fn spawn(
        identity: PeerIdentity,
        engines: Arc<dyn MediaEngineFactory>,
        transport: Arc<dyn SignalingTransport>,
        codec: Arc<dyn SignalCodec>,
        store: Arc<dyn CallStore>,
        config: CallSessionConfig,
    ) -> CallSessionHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let events = Arc::new(CallEventBus::new());

        let session = CallSession {
            identity,
            config,
            engines,
            transport,
            codec,
            store,
            commands: commands.clone(),
            command_rx,
            snapshot_tx,
            events: events.clone(),
            call: None,
        };
        tokio::spawn(session.run());

        CallSessionHandle {
            commands,
            snapshot_rx,
            events,
        }
    }

    async fn run(mut self) {
        info!("call session started for {}", self.identity.did);
        while let Some(command) = self.command_rx.recv().await {
            self.handle_command(command).await;
        }
        // All handles dropped; release whatever is still held.
        if self.call.is_some() {
            self.teardown(EndCallReason::Cancelled, false).await;
        }
        info!("call session stopped for {}", self.identity.did);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start {
                conversation_id,
                peer,
                media_type,
                reply,
            } => self.on_start(conversation_id, peer, media_type, reply),
            SessionCommand::Accept { reply } => self.on_accept(reply),
            SessionCommand::End { reason, reply } => {
                let result = self.on_end(reason).await;
                let _ = reply.send(result);
            }
            SessionCommand::ToggleMute { reply } => {
                let result = self.on_toggle_mute().await;
                let _ = reply.send(result);
            }
            SessionCommand::ToggleCamera { reply } => {
                let result = self.on_toggle_camera().await;
                let _ = reply.send(result);
            }
            SessionCommand::SetVideoQuality(quality) => {
                if let Some(active) = &self.call {
                    active.engine.set_video_quality(quality).await;
                }
            }
            SessionCommand::SetAudioQuality(quality) => {
                if let Some(active) = &self.call {
                    active.engine.set_audio_quality(quality).await;
                }
            }
            SessionCommand::SetVolume(level) => {
                if let Some(active) = &self.call {
                    active.engine.set_volume(level).await;
                }
            }
            SessionCommand::SwitchCamera => {
                if let Some(active) = &self.call {
                    active.engine.switch_camera().await;
                }
            }
            SessionCommand::StartScreenShare { reply } => {
                let result = match &self.call {
                    Some(active) => active.engine.start_screen_share().await,
                    None => Err(CallError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            SessionCommand::StopScreenShare => {
                if let Some(active) = &self.call {
                    active.engine.stop_screen_share().await;
                }
            }
            SessionCommand::Envelope(envelope) => self.on_envelope(envelope).await,
            SessionCommand::Media { call_id, event } => self.on_media(call_id, event).await,
            SessionCommand::OfferReady { call_id, result } => {
                self.on_offer_ready(call_id, result).await
            }
            SessionCommand::AnswerReady { call_id, result } => {
                self.on_answer_ready(call_id, result).await
            }
            SessionCommand::HandshakeFinished { call_id, result } => {
                self.on_handshake_finished(call_id, result).await
            }
            SessionCommand::RingTimeout { call_id } => self.on_ring_timeout(call_id).await,
        }
    }

    // ---- local commands ----

    fn on_start(
        &mut self,
        conversation_id: String,
        peer: PeerIdentity,
        media_type: CallMediaType,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    ) {
        if let Some(active) = &self.call {
            let _ = reply.send(Err(CallError::CallInProgress(active.call.call_id.clone())));
            return;
        }

        let call_id = CallId::generate();
        info!("starting {media_type} call {call_id} to {}", peer.did);

        let (engine, media_feed) = self.attach_engine(&call_id);
        let mut call = Call::new_outgoing(
            call_id.clone(),
            conversation_id.clone(),
            peer.clone(),
            media_type,
        );
        call.local_stream = Some(engine.local_stream());

        // Best-effort recovery record; failures never affect the call.
        let record = PendingCallRecord {
            call_id: call_id.clone(),
            conversation_id,
            peer,
            media_type,
            started_at: call.started_at,
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_pending(&record).await {
                warn!("failed to persist pending call record: {e:#}");
            }
        });

        let ring_timer = self.arm_ring_timer(&call_id);

        let offer_engine = engine.clone();
        let commands = self.commands.clone();
        let offer_call_id = call_id.clone();
        let video = media_type.is_video();
        tokio::spawn(async move {
            let result = offer_engine.create_offer(video).await;
            let _ = commands.send(SessionCommand::OfferReady {
                call_id: offer_call_id,
                result,
            });
        });

        self.call = Some(ActiveCall {
            call,
            engine,
            ring_timer: Some(ring_timer),
            media_feed,
        });
        self.publish_snapshot();
        let _ = reply.send(Ok(call_id));
    }

    fn on_accept(&mut self, reply: oneshot::Sender<Result<(), CallError>>) {
        let Some(active) = self.call.as_mut() else {
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        };
        if !active.call.phase.can_accept() {
            let _ = reply.send(Err(CallError::InvalidTransition(InvalidTransition {
                current_state: format!("{:?}", active.call.phase),
                attempted: "LocalAccepted".to_string(),
            })));
            return;
        }
        // Defensive guard against a malformed lifecycle; not a normal path.
        let Some(offer) = active.call.pending_offer.take() else {
            warn!(
                "accept for call {} but no buffered offer",
                active.call.call_id
            );
            let _ = reply.send(Err(CallError::PendingOfferMissing(
                active.call.call_id.clone(),
            )));
            return;
        };

        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }
        if let Err(e) = active.call.apply_transition(CallTransition::LocalAccepted) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        info!("accepted incoming call {}", active.call.call_id);

        let engine = active.engine.clone();
        let commands = self.commands.clone();
        let call_id = active.call.call_id.clone();
        let video = active.call.media_type.is_video();
        tokio::spawn(async move {
            let result = engine.accept_offer(&offer, video).await;
            let _ = commands.send(SessionCommand::AnswerReady { call_id, result });
        });

        self.publish_snapshot();
        let _ = reply.send(Ok(()));
    }

    async fn on_end(&mut self, reason: Option<EndCallReason>) -> Result<(), CallError> {
        let Some(active) = self.call.as_ref() else {
            return Err(CallError::NoActiveCall);
        };
        let reason = reason.unwrap_or_else(|| default_end_reason(&active.call));
        self.teardown(reason, true).await;
        Ok(())
    }

    async fn on_toggle_mute(&mut self) -> Result<bool, CallError> {
        let Some(active) = self.call.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let muted = active.engine.toggle_mute().await;
        active.call.muted = muted;
        let payload = SignalPayload::State {
            muted,
            camera_off: active.call.camera_off,
        };
        let to = active.call.peer.did.clone();
        let call_id = active.call.call_id.clone();
        self.send_signal(to, call_id, payload);
        self.publish_snapshot();
        Ok(muted)
    }

    async fn on_toggle_camera(&mut self) -> Result<bool, CallError> {
        let Some(active) = self.call.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let camera_off = active.engine.toggle_camera().await;
        active.call.camera_off = camera_off;
        let payload = SignalPayload::State {
            muted: active.call.muted,
            camera_off,
        };
        let to = active.call.peer.did.clone();
        let call_id = active.call.call_id.clone();
        self.send_signal(to, call_id, payload);
        self.publish_snapshot();
        Ok(camera_off)
    }

    // ---- inbound signaling ----

    async fn on_envelope(&mut self, envelope: CallEnvelope) {
        let call_id = envelope.call_id.clone();
        let sender = envelope.sender.clone();
        let codec = self.codec.clone();
        let payload = match envelope.open(codec.as_ref()).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("dropping malformed envelope for call {call_id} from {sender}: {e}");
                return;
            }
        };

        let kind = payload.kind();
        if kind.is_critical() {
            info!("received {kind} for call {call_id} from {sender}");
        } else {
            debug!("received {kind} for call {call_id} from {sender}");
        }

        match payload {
            SignalPayload::Offer {
                call_type,
                conversation_id,
                sdp,
            } => {
                self.on_remote_offer(call_id, sender, call_type, conversation_id, sdp);
            }
            SignalPayload::Answer { sdp } => self.on_remote_answer(call_id, sdp),
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => self.on_remote_candidate(call_id, candidate, sdp_mid, sdp_m_line_index),
            SignalPayload::State { muted, camera_off } => {
                self.on_remote_state(call_id, muted, camera_off);
            }
            SignalPayload::End { reason } => self.on_remote_end(call_id, reason).await,
        }
    }

    fn on_remote_offer(
        &mut self,
        call_id: CallId,
        sender: String,
        call_type: CallMediaType,
        conversation_id: String,
        sdp: SessionDescription,
    ) {
        if let Some(active) = &self.call {
            if active.call.call_id == call_id {
                debug!("duplicate offer for call {call_id}; dropping");
            } else {
                // A second offer never creates local state; under glare each
                // side's outgoing attempt is ended by the peer's busy reply.
                info!("busy: rejecting offer {call_id} from {sender}");
                self.send_signal(
                    sender,
                    call_id,
                    SignalPayload::End {
                        reason: EndCallReason::Busy,
                    },
                );
            }
            return;
        }

        let peer = PeerIdentity::new(sender);
        let (engine, media_feed) = self.attach_engine(&call_id);
        let mut call = Call::new_incoming(
            call_id.clone(),
            conversation_id.clone(),
            peer.clone(),
            call_type,
            sdp,
        );
        call.local_stream = Some(engine.local_stream());
        let ring_timer = self.arm_ring_timer(&call_id);

        self.call = Some(ActiveCall {
            call,
            engine,
            ring_timer: Some(ring_timer),
            media_feed,
        });
        self.publish_snapshot();
        let _ = self.events.incoming_call.send(Arc::new(IncomingCall {
            call_id,
            conversation_id,
            peer,
            media_type: call_type,
            received_at: Utc::now(),
        }));
    }

    fn on_remote_answer(&mut self, call_id: CallId, sdp: SessionDescription) {
        let Some(active) = self.call.as_mut() else {
            debug!("dropping answer for unknown call {call_id}");
            return;
        };
        if active.call.call_id != call_id {
            debug!("dropping answer for stale call {call_id}");
            return;
        }
        if !matches!(active.call.phase, CallPhase::Outgoing { .. }) {
            debug!(
                "dropping answer for call {call_id} in phase {:?}",
                active.call.phase
            );
            return;
        }

        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }
        if let Err(e) = active.call.apply_transition(CallTransition::RemoteAnswered) {
            warn!("answer for call {call_id} rejected: {e}");
            return;
        }

        let engine = active.engine.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = engine.complete_handshake(&sdp).await;
            let _ = commands.send(SessionCommand::HandshakeFinished { call_id, result });
        });
        self.publish_snapshot();
    }

    fn on_remote_candidate(
        &mut self,
        call_id: CallId,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    ) {
        let Some(active) = self.call.as_ref() else {
            debug!("dropping candidate for unknown call {call_id}");
            return;
        };
        if active.call.call_id != call_id {
            debug!("dropping candidate for stale call {call_id}");
            return;
        }

        let mut ice = IceCandidate::new(candidate);
        ice.sdp_mid = sdp_mid;
        ice.sdp_m_line_index = sdp_m_line_index;
        let engine = active.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.add_ice_candidate(ice).await {
                debug!("media engine rejected candidate for call {call_id}: {e}");
            }
        });
    }

    fn on_remote_state(&mut self, call_id: CallId, muted: bool, camera_off: bool) {
        let Some(active) = self.call.as_mut() else {
            debug!("ignoring state for unknown call {call_id}");
            return;
        };
        if active.call.call_id != call_id {
            debug!("ignoring state for stale call {call_id}");
            return;
        }
        active.call.remote_muted = muted;
        active.call.remote_camera_off = camera_off;
        let _ = self.events.remote_state.send(Arc::new(RemoteStateChanged {
            call_id,
            muted,
            camera_off,
        }));
        self.publish_snapshot();
    }

    async fn on_remote_end(&mut self, call_id: CallId, reason: EndCallReason) {
        let Some(active) = self.call.as_ref() else {
            debug!("ignoring end for unknown call {call_id}");
            return;
        };
        if active.call.call_id != call_id {
            debug!("ignoring end for stale call {call_id}");
            return;
        }
        info!("remote ended call {call_id} ({reason})");
        // The remote already knows; send nothing back.
        self.teardown(reason, false).await;
    }

    // ---- async operation completions ----

    async fn on_offer_ready(
        &mut self,
        call_id: CallId,
        result: Result<SessionDescription, CallError>,
    ) {
        let Some(active) = self.call.as_ref() else {
            debug!("discarding offer result for ended call {call_id}");
            return;
        };
        if active.call.call_id != call_id {
            debug!("discarding offer result for stale call {call_id}");
            return;
        }
        match result {
            Ok(sdp) => {
                let payload = SignalPayload::Offer {
                    call_type: active.call.media_type,
                    conversation_id: active.call.conversation_id.clone(),
                    sdp,
                };
                let to = active.call.peer.did.clone();
                self.send_signal(to, call_id, payload);
            }
            Err(e) => {
                warn!("local media setup failed for call {call_id}: {e}");
                self.fail_media(call_id).await;
            }
        }
    }

    async fn on_answer_ready(
        &mut self,
        call_id: CallId,
        result: Result<SessionDescription, CallError>,
    ) {
        let Some(active) = self.call.as_ref() else {
            debug!("discarding answer result for ended call {call_id}");
            return;
        };
        if active.call.call_id != call_id {
            debug!("discarding answer result for stale call {call_id}");
            return;
        }
        match result {
            Ok(sdp) => {
                let to = active.call.peer.did.clone();
                self.send_signal(to, call_id, SignalPayload::Answer { sdp });
            }
            Err(e) => {
                warn!("answering call {call_id} failed: {e}");
                self.fail_media(call_id).await;
            }
        }
    }

    async fn on_handshake_finished(&mut self, call_id: CallId, result: Result<(), CallError>) {
        if !self.is_current(&call_id) {
            debug!("discarding handshake result for stale call {call_id}");
            return;
        }
        if let Err(e) = result {
            warn!("media handshake failed for call {call_id}: {e}");
            self.fail_media(call_id).await;
        }
        // On success the engine reports connectivity through its own events.
    }

    // ---- timers and media events ----

    async fn on_ring_timeout(&mut self, call_id: CallId) {
        let Some(active) = self.call.as_ref() else {
            return;
        };
        // The timer may fire spuriously; re-check before acting.
        if active.call.call_id != call_id || !active.call.phase.is_ringing() {
            debug!("ignoring spurious ring timeout for call {call_id}");
            return;
        }
        info!(
            "call {call_id} timed out after {:?}",
            self.config.ring_timeout
        );
        self.teardown(EndCallReason::Timeout, true).await;
    }

    async fn on_media(&mut self, call_id: CallId, event: MediaEvent) {
        let Some(active) = self.call.as_mut() else {
            debug!("discarding media event for ended call {call_id}");
            return;
        };
        if active.call.call_id != call_id {
            debug!("discarding media event for stale call {call_id}");
            return;
        }

        match event {
            MediaEvent::IceCandidate(candidate) => {
                let payload = SignalPayload::IceCandidate {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_m_line_index: candidate.sdp_m_line_index,
                };
                let to = active.call.peer.did.clone();
                self.send_signal(to, call_id, payload);
            }
            MediaEvent::RemoteStream(handle) => {
                active.call.remote_stream = Some(handle);
                self.publish_snapshot();
            }
            MediaEvent::ConnectionState(MediaConnectionState::Connected) => {
                let first_connect = active.call.connected_at().is_none();
                match active.call.apply_transition(CallTransition::MediaConnected) {
                    Ok(()) => {
                        if first_connect {
                            info!("call {call_id} connected");
                            if let Some(interval) = self.config.stats_interval {
                                let engine = active.engine.clone();
                                tokio::spawn(async move {
                                    engine.start_stats(interval).await;
                                });
                            }
                            let connected_at =
                                active.call.connected_at().unwrap_or_else(Utc::now);
                            let _ = self.events.connected.send(Arc::new(CallConnected {
                                call_id,
                                connected_at,
                            }));
                        }
                        self.publish_snapshot();
                    }
                    Err(e) => debug!("ignoring media connectivity report: {e}"),
                }
            }
            MediaEvent::ConnectionState(MediaConnectionState::Disconnected) => {
                match active.call.apply_transition(CallTransition::MediaInterrupted) {
                    Ok(()) => {
                        info!("call {call_id} lost media connectivity; reconnecting");
                        self.publish_snapshot();
                    }
                    Err(e) => debug!("ignoring media interruption report: {e}"),
                }
            }
            MediaEvent::ConnectionState(MediaConnectionState::Failed) => {
                warn!("media engine failed for call {call_id}");
                self.fail_media(call_id).await;
            }
            MediaEvent::ConnectionState(MediaConnectionState::Closed) => {
                debug!("media engine closed for call {call_id}");
            }
            MediaEvent::Stats(stats) => {
                let _ = self
                    .events
                    .stats
                    .send(Arc::new(CallStatsUpdate { call_id, stats }));
            }
        }
    }

    // ---- shared plumbing ----

    fn is_current(&self, call_id: &CallId) -> bool {
        self.call
            .as_ref()
            .is_some_and(|active| &active.call.call_id == call_id)
    }

    /// Unrecoverable media failure: full teardown, no envelope (the remote
    /// resolves via its own timeout), reason kept within the user-visible
    /// set.
    async fn fail_media(&mut self, call_id: CallId) {
        let reason = match self.call.as_ref() {
            Some(active) if active.call.connected_at().is_some() => EndCallReason::Completed,
            Some(active) if active.call.direction == CallDirection::Incoming => {
                EndCallReason::Declined
            }
            _ => EndCallReason::Cancelled,
        };
        debug!("tearing down call {call_id} after media failure ({reason})");
        self.teardown(reason, false).await;
    }

    async fn teardown(&mut self, reason: EndCallReason, notify_remote: bool) {
        let Some(mut active) = self.call.take() else {
            return;
        };
        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }
        active.media_feed.abort();

        let _ = active
            .call
            .apply_transition(CallTransition::Terminated { reason });
        let duration_secs = match &active.call.phase {
            CallPhase::Ended { duration_secs, .. } => *duration_secs,
            _ => None,
        };

        if notify_remote {
            let to = active.call.peer.did.clone();
            self.send_signal(
                to,
                active.call.call_id.clone(),
                SignalPayload::End { reason },
            );
        }

        // One call, one resource set, freed together.
        let engine = active.engine;
        tokio::spawn(async move {
            engine.stop_stats().await;
            engine.close().await;
        });

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.clear_pending().await {
                warn!("failed to clear pending call record: {e:#}");
            }
        });

        info!("call {} ended ({reason})", active.call.call_id);
        let _ = self.events.ended.send(Arc::new(CallEnded {
            call_id: active.call.call_id,
            reason,
            ended_at: Utc::now(),
            duration_secs,
        }));
        self.snapshot_tx.send_replace(None);
    }

    /// Construct the fresh engine for a call and start forwarding its
    /// events into the mailbox tagged with the call id.
    fn attach_engine(&self, call_id: &CallId) -> (Arc<dyn MediaEngine>, JoinHandle<()>) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let engine = self.engines.create(events_tx);
        let commands = self.commands.clone();
        let call_id = call_id.clone();
        let feed = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if commands
                    .send(SessionCommand::Media {
                        call_id: call_id.clone(),
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        (engine, feed)
    }

    fn arm_ring_timer(&self, call_id: &CallId) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let call_id = call_id.clone();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(SessionCommand::RingTimeout { call_id });
        })
    }

    /// Seal and send an envelope off the mailbox; failures are logged and
    /// non-fatal.
    fn send_signal(&self, to_did: String, call_id: CallId, payload: SignalPayload) {
        let codec = self.codec.clone();
        let transport = self.transport.clone();
        let our_did = self.identity.did.clone();
        tokio::spawn(async move {
            let kind = payload.kind();
            let envelope =
                CallEnvelope::seal(&call_id, &our_did, &to_did, payload, codec.as_ref()).await;
            if let Err(e) = transport.send(&to_did, envelope).await {
                warn!("failed to deliver {kind} envelope for call {call_id}: {e:#}");
            }
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx
            .send_replace(self.call.as_ref().map(|active| active.call.snapshot()));
    }
}

fn default_end_reason(call: &Call) -> EndCallReason {
    if call.connected_at().is_some() {
        EndCallReason::Completed
    } else {
        match call.direction {
            CallDirection::Outgoing => EndCallReason::Cancelled,
            CallDirection::Incoming => EndCallReason::Declined,
        }
    }
}
