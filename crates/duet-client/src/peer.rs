//! Peer connection seam.
//!
//! The engine only talks to [`PeerConnection`]; the `webrtc` backed
//! implementation lives in [`crate::rtc`].

use std::sync::Arc;

use async_trait::async_trait;
use duet_common::{IceCandidate, Result, RtcConfig, SessionDescription};
use tokio::sync::mpsc;

use crate::engine::EngineEvent;
use crate::media::{LocalTrack, RemoteTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback output of a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Track(RemoteTrack),
    LocalCandidate(IceCandidate),
    ConnectionState(PeerConnectionState),
}

/// Sink handed to a peer connection at creation. Every event is tagged
/// with the generation of the connection that produced it.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl PeerEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the engine is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(EngineEvent::Peer {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    /// Gather fresh ICE credentials.
    pub ice_restart: bool,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Offer requesting audio and video from the remote side.
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn connection_state(&self) -> PeerConnectionState;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, config: &RtcConfig, events: PeerEvents)
        -> Result<Arc<dyn PeerConnection>>;
}
