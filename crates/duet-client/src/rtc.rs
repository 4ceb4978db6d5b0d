//! `webrtc` backed peer connections.

use std::sync::Arc;

use async_trait::async_trait;
use duet_common::{
    BundlePolicy, Error, IceCandidate, IceTransportPolicy, MediaKind, Result, RtcConfig,
    RtcpMuxPolicy, SdpKind, SessionDescription,
};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

use crate::media::{LocalTrack, RemoteTrack};
use crate::peer::{
    OfferOptions, PeerConnection, PeerConnectionState, PeerEvent, PeerEvents, PeerFactory,
};

/// Map the call configuration onto the `webrtc` one.
pub fn rtc_configuration(config: &RtcConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_transport_policy: match config.ice_transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        rtcp_mux_policy: match config.rtcp_mux_policy {
            RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
            RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
        },
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

fn peer_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn media_kind(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(Error::negotiation)
}

/// Builds one `webrtc` API and peer connection per call attempt.
#[derive(Debug, Clone, Default)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        config: &RtcConfig,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().map_err(Error::internal)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut m).map_err(Error::internal)?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(config))
                .await
                .map_err(Error::internal)?,
        );
        let generation = events.generation();
        register_callbacks(&pc, events);
        debug!(
            "created peer connection #{} with {} ICE server(s), {} of them relays",
            generation,
            config.ice_servers.len(),
            config.ice_servers.iter().filter(|s| s.is_relay()).count()
        );

        Ok(Arc::new(RtcPeer { pc }))
    }
}

fn register_callbacks(pc: &Arc<RTCPeerConnection>, events: PeerEvents) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |c| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = c else {
                debug!("ICE gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    events.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!("failed to serialize local ICE candidate: {}", e),
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = track_events.clone();
        Box::pin(async move {
            let Some(kind) = media_kind(track.kind()) else {
                return;
            };
            let remote = RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            };
            info!("remote {} track {} arrived", kind, remote.id);
            events.emit(PeerEvent::Track(remote));

            // Nothing renders here; drain RTP so the receive buffers never fill.
            tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
        })
    }));

    pc.on_ice_connection_state_change(Box::new(move |state| {
        debug!("ICE connection state: {}", state);
        Box::pin(async {})
    }));

    pc.on_peer_connection_state_change(Box::new(move |state| {
        let events = events.clone();
        Box::pin(async move {
            info!("peer connection state: {}", state);
            events.emit(PeerEvent::ConnectionState(peer_state(state)));
        })
    }));
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    /// Make sure the next offer asks for both kinds even without local tracks.
    async fn ensure_receivers(&self) -> Result<()> {
        let existing: Vec<RTPCodecType> = self
            .pc
            .get_transceivers()
            .await
            .iter()
            .map(|t| t.kind())
            .collect();

        for kind in [MediaKind::Audio, MediaKind::Video] {
            let codec = codec_type(kind);
            if existing.contains(&codec) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    codec,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(Error::negotiation)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self
            .pc
            .add_track(track.sample_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(Error::internal)?;

        // Read incoming RTCP so interceptors (NACK, reports) keep working.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        self.ensure_receivers().await?;
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(Error::negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(Error::negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(Error::negotiation)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(Error::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| match e {
                webrtc::Error::ErrConnectionClosed => Error::internal(e),
                e => Error::candidate(e),
            })
    }

    fn connection_state(&self) -> PeerConnectionState {
        peer_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Error::internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_configuration_mapping() {
        let config = rtc_configuration(&RtcConfig::default());
        assert_eq!(config.ice_servers.len(), 9);
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(config.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
        assert_eq!(config.ice_transport_policy, RTCIceTransportPolicy::All);

        let anyfirewall = config
            .ice_servers
            .iter()
            .find(|s| s.urls[0].contains("anyfirewall"))
            .unwrap();
        assert_eq!(anyfirewall.username, "webrtc");
        assert_eq!(anyfirewall.credential, "webrtc");
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            peer_state(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
        assert_eq!(
            peer_state(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
    }

    #[tokio::test]
    async fn test_offer_requests_audio_and_video() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = RtcConfig {
            ice_servers: vec![],
            ..RtcConfig::default()
        };
        let peer = RtcPeerFactory::new()
            .create(&config, PeerEvents::new(1, tx))
            .await
            .unwrap();

        let offer = peer.create_offer(OfferOptions::default()).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_garbage_remote_description() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RtcPeerFactory::new()
            .create(
                &RtcConfig {
                    ice_servers: vec![],
                    ..RtcConfig::default()
                },
                PeerEvents::new(1, tx),
            )
            .await
            .unwrap();

        let err = peer
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
        peer.close().await.unwrap();
    }
}
