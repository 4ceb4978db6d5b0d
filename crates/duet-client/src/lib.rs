//! Client side of a two-party WebRTC call.
//!
//! The [`engine::NegotiationEngine`] owns the peer connection and drives the
//! offer/answer exchange through a [`signaling::SignalingClient`]. A
//! [`session::CallSession`] runs one engine on a single task and exposes
//! its state to the UI.

#![forbid(unsafe_code)]

pub mod engine;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod types;

pub use engine::{EngineEvent, NegotiationEngine, PendingCandidates, SessionWatchers};
pub use media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, RemoteStream, RemoteTrack,
    SyntheticDevices,
};
pub use peer::{
    OfferOptions, PeerConnection, PeerConnectionState, PeerEvent, PeerEvents, PeerFactory,
};
pub use rtc::RtcPeerFactory;
pub use session::CallSession;
pub use signaling::{ChannelState, SignalingClient, SignalingEvent};
pub use types::{NegotiationState, SessionEvent};
