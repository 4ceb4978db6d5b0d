//! Offer/answer state machine for one call attempt.
//!
//! The engine is not shared: every method takes `&mut self` and the
//! [`crate::session::CallSession`] actor is the only caller in production.
//! Callbacks from the peer connection, the signaling channel and the restart
//! timer come back as [`EngineEvent`]s and are fed to
//! [`NegotiationEngine::handle_event`] between operations.

use std::collections::VecDeque;
use std::sync::Arc;

use duet_common::{CallConfig, Error, IceCandidate, Result, SessionDescription, SignalingMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::media::{
    self, LocalStream, MediaConstraints, MediaDevices, RemoteStream, RemoteTrack,
};
use crate::peer::{
    OfferOptions, PeerConnection, PeerConnectionState, PeerEvent, PeerEvents, PeerFactory,
};
use crate::signaling::{ChannelState, SignalingClient, SignalingEvent, SignalingHandler};
use crate::types::{NegotiationState, SessionEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Signal { channel: u64, event: SignalingEvent },
    Peer { generation: u64, event: PeerEvent },
    IceRestartDue { generation: u64 },
}

/// Candidates that arrived before a remote description could take them.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Take every queued candidate in receipt order, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Which side opened the negotiation. Only the offering side restarts ICE,
/// so a failure seen by both peers never produces two crossing offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

/// Reactive view of a call for the UI.
#[derive(Debug, Clone)]
pub struct SessionWatchers {
    pub local_stream: watch::Receiver<Option<LocalStream>>,
    pub remote_stream: watch::Receiver<Option<RemoteStream>>,
    pub active: watch::Receiver<bool>,
    pub state: watch::Receiver<NegotiationState>,
}

struct Publishers {
    local_stream: watch::Sender<Option<LocalStream>>,
    remote_stream: watch::Sender<Option<RemoteStream>>,
    active: watch::Sender<bool>,
    state: watch::Sender<NegotiationState>,
}

impl Publishers {
    fn new() -> Self {
        Self {
            local_stream: watch::channel(None).0,
            remote_stream: watch::channel(None).0,
            active: watch::channel(false).0,
            state: watch::channel(NegotiationState::Idle).0,
        }
    }
}

pub struct NegotiationEngine {
    config: CallConfig,
    constraints: MediaConstraints,
    peers: Arc<dyn PeerFactory>,
    devices: Arc<dyn MediaDevices>,
    events: mpsc::UnboundedSender<EngineEvent>,

    signaling: Option<SignalingClient>,
    channel_generation: u64,

    peer: Option<Arc<dyn PeerConnection>>,
    peer_generation: u64,
    attached_tracks: Vec<String>,
    has_remote_description: bool,
    role: Option<Role>,
    negotiated: bool,
    pending: PendingCandidates,
    restart_timer: Option<JoinHandle<()>>,

    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    state: NegotiationState,
    publishers: Publishers,
}

impl NegotiationEngine {
    /// Create an idle engine. Nothing touches the network until an
    /// operation asks for it.
    pub fn new(
        config: CallConfig,
        peers: Arc<dyn PeerFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            config,
            constraints: MediaConstraints::default(),
            peers,
            devices,
            events,
            signaling: None,
            channel_generation: 0,
            peer: None,
            peer_generation: 0,
            attached_tracks: Vec::new(),
            has_remote_description: false,
            role: None,
            negotiated: false,
            pending: PendingCandidates::default(),
            restart_timer: None,
            local_stream: None,
            remote_stream: None,
            state: NegotiationState::Idle,
            publishers: Publishers::new(),
        };
        (engine, rx)
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        *self.publishers.active.borrow()
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn pending_candidates(&self) -> &PendingCandidates {
        &self.pending
    }

    pub fn has_peer_connection(&self) -> bool {
        self.peer.is_some()
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    /// Whether an offer/answer exchange has completed on this call. Offers
    /// arriving after that are renegotiations.
    pub fn has_negotiated(&self) -> bool {
        self.negotiated
    }

    pub fn signaling_state(&self) -> Option<ChannelState> {
        self.signaling.as_ref().map(SignalingClient::state)
    }

    pub fn watchers(&self) -> SessionWatchers {
        SessionWatchers {
            local_stream: self.publishers.local_stream.subscribe(),
            remote_stream: self.publishers.remote_stream.subscribe(),
            active: self.publishers.active.subscribe(),
            state: self.publishers.state.subscribe(),
        }
    }

    /// Open the signaling channel for the configured token. An open channel
    /// is reused.
    pub async fn connect_signaling(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.signaling.as_ref().is_some_and(SignalingClient::is_open) {
            return Ok(());
        }

        self.channel_generation += 1;
        let channel = self.channel_generation;
        let tx = self.events.clone();
        let handler: SignalingHandler = Box::new(move |event| {
            let _ = tx.send(EngineEvent::Signal { channel, event });
        });

        let client =
            SignalingClient::connect(&self.config.signaling, &self.config.token, handler).await?;
        if let Some(stale) = self.signaling.replace(client) {
            stale.close();
        }
        Ok(())
    }

    /// Acquire local capture. An existing stream is reused, and the tracks
    /// are attached at once if a peer connection already exists.
    pub async fn start_local_stream(&mut self) -> Result<LocalStream> {
        self.ensure_open()?;
        if let Some(stream) = &self.local_stream {
            return Ok(stream.clone());
        }

        let stream = media::acquire(self.devices.as_ref(), &self.constraints).await?;
        self.local_stream = Some(stream.clone());
        self.publishers.local_stream.send_replace(Some(stream.clone()));

        self.attach_local_tracks().await?;
        Ok(stream)
    }

    /// Build the peer connection. A live one is reused.
    pub async fn create_peer_connection(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.peer.is_some() {
            return Ok(());
        }

        self.peer_generation += 1;
        let events = PeerEvents::new(self.peer_generation, self.events.clone());
        let peer = self.peers.create(&self.config.rtc, events).await?;
        debug!("peer connection #{} created", self.peer_generation);

        self.peer = Some(peer);
        self.attached_tracks.clear();
        self.has_remote_description = false;
        self.set_state(NegotiationState::Connecting);

        self.attach_local_tracks().await
    }

    /// Start negotiation from this side and send the offer to the peer.
    pub async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.create_peer_connection().await?;
        self.connect_signaling().await?;
        let peer = self.live_peer()?;

        let offer = peer.create_offer(OfferOptions::default()).await?;
        peer.set_local_description(offer.clone()).await?;
        self.send(offer.to_message());
        self.role.get_or_insert(Role::Offerer);
        info!("sent offer");
        Ok(offer)
    }

    /// Apply a remote offer and release any queued candidates.
    pub async fn handle_offer(&mut self, sdp: String) -> Result<()> {
        self.ensure_open()?;
        self.create_peer_connection().await?;
        let peer = self.live_peer()?;

        peer.set_remote_description(SessionDescription::offer(sdp)).await?;
        self.has_remote_description = true;
        self.role.get_or_insert(Role::Answerer);
        info!("applied remote offer");
        self.flush_pending(&peer).await;
        Ok(())
    }

    /// Answer the applied remote offer.
    pub async fn create_answer(&mut self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let peer = self
            .peer
            .clone()
            .ok_or_else(|| Error::call_order("cannot answer without a peer connection"))?;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.send(answer.to_message());
        self.negotiated = true;
        info!("sent answer");
        Ok(answer)
    }

    /// Apply a remote answer. Without a peer connection (or after hang-up)
    /// there is nothing to answer and the call is a no-op.
    pub async fn handle_answer(&mut self, sdp: String) -> Result<()> {
        let Some(peer) = self.peer.clone() else {
            debug!("ignoring answer without a peer connection");
            return Ok(());
        };

        peer.set_remote_description(SessionDescription::answer(sdp)).await?;
        self.has_remote_description = true;
        self.negotiated = true;
        info!("applied remote answer");
        self.flush_pending(&peer).await;
        Ok(())
    }

    /// Apply a remote candidate, or queue it until a remote description
    /// exists. Rejected candidates are logged and dropped.
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidate) {
        if self.state == NegotiationState::Closed {
            debug!("ignoring ICE candidate after hang-up");
            return;
        }

        match self.peer.clone() {
            Some(peer) if self.has_remote_description => {
                if let Err(e) = apply_candidate(&peer, candidate).await {
                    warn!("failed to apply ICE candidate: {}", e);
                }
            }
            _ => {
                self.pending.push(candidate);
                debug!("queued ICE candidate ({} pending)", self.pending.len());
            }
        }
    }

    /// Tear the call down. Safe to call any number of times.
    pub async fn hang_up(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }

        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("error closing peer connection: {}", e);
            }
        }
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
        if let Some(signaling) = self.signaling.take() {
            signaling.close();
        }

        self.remote_stream = None;
        self.pending.clear();
        self.attached_tracks.clear();
        self.has_remote_description = false;
        self.role = None;
        self.negotiated = false;

        self.publishers.local_stream.send_replace(None);
        self.publishers.remote_stream.send_replace(None);
        self.publishers.active.send_replace(false);
        self.set_state(NegotiationState::Closed);
        info!("call hung up");
    }

    /// Process one callback. Returns what the session should tell the UI.
    pub async fn handle_event(&mut self, event: EngineEvent) -> Option<SessionEvent> {
        if self.state == NegotiationState::Closed {
            return None;
        }

        match event {
            EngineEvent::Signal { channel, event } => {
                if channel != self.channel_generation {
                    debug!("dropping event from stale signaling channel #{}", channel);
                    return None;
                }
                match event {
                    SignalingEvent::Message(message) => self.dispatch(message).await,
                    SignalingEvent::Closed => {
                        info!("signaling channel closed by relay");
                        Some(SessionEvent::SignalingClosed)
                    }
                }
            }
            EngineEvent::Peer { generation, event } => {
                if generation != self.peer_generation || self.peer.is_none() {
                    debug!("dropping event from stale peer connection #{}", generation);
                    return None;
                }
                match event {
                    PeerEvent::Track(track) => {
                        self.add_remote_track(track);
                        None
                    }
                    PeerEvent::LocalCandidate(candidate) => {
                        self.send(SignalingMessage::IceCandidate { candidate });
                        None
                    }
                    PeerEvent::ConnectionState(state) => {
                        self.on_connection_state(state);
                        None
                    }
                }
            }
            EngineEvent::IceRestartDue { generation } => {
                if generation != self.peer_generation {
                    return None;
                }
                self.restart_timer = None;
                self.restart_ice().await
            }
        }
    }

    async fn dispatch(&mut self, message: SignalingMessage) -> Option<SessionEvent> {
        match message {
            SignalingMessage::Offer { sdp } => match self.handle_offer(sdp).await {
                Ok(()) => Some(SessionEvent::OfferReceived),
                Err(e) => {
                    warn!("failed to apply remote offer: {}", e);
                    Some(SessionEvent::NegotiationFailed(e.to_string()))
                }
            },
            SignalingMessage::Answer { sdp } => {
                let applies = self.peer.is_some();
                match self.handle_answer(sdp).await {
                    Ok(()) if applies => Some(SessionEvent::AnswerApplied),
                    Ok(()) => None,
                    Err(e) => {
                        warn!("failed to apply remote answer: {}", e);
                        Some(SessionEvent::NegotiationFailed(e.to_string()))
                    }
                }
            }
            SignalingMessage::IceCandidate { candidate } => {
                self.handle_ice_candidate(candidate).await;
                None
            }
        }
    }

    fn on_connection_state(&mut self, state: PeerConnectionState) {
        let active = state == PeerConnectionState::Connected;
        self.publishers.active.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });

        match state {
            PeerConnectionState::Connected => {
                if let Some(timer) = self.restart_timer.take() {
                    timer.abort();
                }
                self.set_state(NegotiationState::Connected);
            }
            PeerConnectionState::Failed => {
                self.set_state(NegotiationState::Failed);
                if self.role == Some(Role::Answerer) {
                    debug!("connection failed, waiting for the offering side to restart ICE");
                } else {
                    self.schedule_ice_restart();
                }
            }
            // Hang-up never gets here, so this is the transport giving up.
            PeerConnectionState::Closed => self.set_state(NegotiationState::Failed),
            PeerConnectionState::New
            | PeerConnectionState::Connecting
            | PeerConnectionState::Disconnected => {
                if self.state != NegotiationState::Failed {
                    self.set_state(NegotiationState::Connecting);
                }
            }
        }
    }

    fn schedule_ice_restart(&mut self) {
        if self.restart_timer.is_some() {
            return;
        }

        let tx = self.events.clone();
        let generation = self.peer_generation;
        let delay = self.config.ice_restart_delay;
        debug!("connection failed, re-checking in {:?}", delay);
        self.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::IceRestartDue { generation });
        }));
    }

    async fn restart_ice(&mut self) -> Option<SessionEvent> {
        let peer = self.peer.clone()?;
        if peer.connection_state() != PeerConnectionState::Failed {
            debug!("connection recovered, no ICE restart needed");
            return None;
        }

        info!("connection still failed, restarting ICE");
        let restart = async {
            let offer = peer
                .create_offer(OfferOptions { ice_restart: true })
                .await?;
            peer.set_local_description(offer.clone()).await?;
            Ok::<_, Error>(offer)
        };
        match restart.await {
            Ok(offer) => {
                self.send(offer.to_message());
                Some(SessionEvent::IceRestarted)
            }
            Err(e) => {
                warn!("ICE restart failed: {}", e);
                Some(SessionEvent::NegotiationFailed(e.to_string()))
            }
        }
    }

    async fn attach_local_tracks(&mut self) -> Result<()> {
        let (Some(peer), Some(stream)) = (self.peer.clone(), self.local_stream.clone()) else {
            return Ok(());
        };

        for track in stream.tracks() {
            if self.attached_tracks.iter().any(|id| id == track.id()) {
                continue;
            }
            peer.add_track(track).await?;
            self.attached_tracks.push(track.id().to_string());
            debug!("attached local {} track", track.kind());
        }
        Ok(())
    }

    async fn flush_pending(&mut self, peer: &Arc<dyn PeerConnection>) {
        let queued = self.pending.drain();
        if queued.is_empty() {
            return;
        }
        let total = queued.len();
        debug!("applying {} queued ICE candidate(s)", total);
        for (applied, candidate) in queued.into_iter().enumerate() {
            if let Err(e) = apply_candidate(peer, candidate).await {
                warn!(
                    "peer connection stopped taking candidates, dropping {} queued: {}",
                    total - applied,
                    e
                );
                break;
            }
        }
    }

    fn add_remote_track(&mut self, track: RemoteTrack) {
        let same_stream = self
            .remote_stream
            .as_ref()
            .is_some_and(|stream| stream.id == track.stream_id);
        if !same_stream {
            self.remote_stream = Some(RemoteStream::new(track.stream_id.clone()));
        }
        let Some(stream) = self.remote_stream.as_mut() else {
            return;
        };
        if stream.add_track(track) {
            self.publishers
                .remote_stream
                .send_replace(Some(stream.clone()));
        }
    }

    fn send(&self, message: SignalingMessage) {
        match &self.signaling {
            Some(signaling) => {
                signaling.send(&message);
            }
            None => debug!("no signaling channel, dropping {} message", message.kind()),
        }
    }

    fn set_state(&mut self, state: NegotiationState) {
        if self.state == state {
            return;
        }
        debug!("negotiation state {} -> {}", self.state, state);
        self.state = state;
        self.publishers.state.send_replace(state);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == NegotiationState::Closed {
            return Err(Error::call_order("the call has been hung up"));
        }
        Ok(())
    }

    fn live_peer(&self) -> Result<Arc<dyn PeerConnection>> {
        self.peer
            .clone()
            .ok_or_else(|| Error::internal("peer connection missing after creation"))
    }
}

/// Apply one remote candidate. A rejected candidate only costs one network
/// path and is skipped; any other error is returned.
async fn apply_candidate(peer: &Arc<dyn PeerConnection>, candidate: IceCandidate) -> Result<()> {
    match peer.add_ice_candidate(candidate).await {
        Err(e) if e.is_recoverable() => {
            warn!("skipping rejected ICE candidate: {}", e);
            Ok(())
        }
        other => other,
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_candidates_drain_in_order() {
        let mut pending = PendingCandidates::default();
        for i in 0..3 {
            pending.push(IceCandidate::new(format!("candidate:{i}")));
        }
        assert_eq!(pending.len(), 3);

        let drained: Vec<String> = pending.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, ["candidate:0", "candidate:1", "candidate:2"]);
        assert!(pending.is_empty());
        assert!(pending.drain().is_empty());
    }
}
