//! Shared fixtures: a scripted peer connection and an in-process relay.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use duet_client::{
    LocalTrack, OfferOptions, PeerConnection, PeerConnectionState, PeerEvent, PeerEvents,
    PeerFactory, RemoteTrack,
};
use duet_common::{
    CallConfig, CallToken, Error, IceCandidate, MediaKind, Result, RtcConfig, SdpKind,
    SessionDescription, SignalingConfig,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

pub const TOKEN: &str = "abc-123";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn candidate(n: u8) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn remote_sdp(label: &str) -> String {
    format!("v=0\r\no=- {label} 2 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n")
}

pub fn call_config(relay_url: &str, auto_answer: bool) -> CallConfig {
    CallConfig {
        signaling: SignalingConfig::new(relay_url),
        auto_answer,
        ..CallConfig::new(CallToken::new(TOKEN).unwrap())
    }
}

#[derive(Debug)]
pub struct FakeState {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub tracks: Vec<String>,
    pub applied: Vec<IceCandidate>,
    pub rejected: Vec<IceCandidate>,
    pub offers: usize,
    pub restarts: usize,
    pub connection: PeerConnectionState,
    pub closed: bool,
}

/// Peer connection double.
///
/// Accepts any description starting with `v=0`, emits one host candidate
/// per local description and an audio and a video track per remote one.
/// Reports connected once both descriptions and one remote candidate are in
/// place, unless auto-connect is off.
pub struct FakePeer {
    events: PeerEvents,
    auto_connect: bool,
    state: Mutex<FakeState>,
}

impl FakePeer {
    fn new(events: PeerEvents, auto_connect: bool) -> Self {
        Self {
            events,
            auto_connect,
            state: Mutex::new(FakeState {
                local: None,
                remote: None,
                tracks: Vec::new(),
                applied: Vec::new(),
                rejected: Vec::new(),
                offers: 0,
                restarts: 0,
                connection: PeerConnectionState::New,
                closed: false,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn applied(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.applied.iter().map(|c| c.candidate.clone()).collect()
    }

    pub fn rejected(&self) -> usize {
        self.state.lock().unwrap().rejected.len()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.state.lock().unwrap().tracks.clone()
    }

    pub fn offers(&self) -> usize {
        self.state.lock().unwrap().offers
    }

    pub fn restarts(&self) -> usize {
        self.state.lock().unwrap().restarts
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Move to `connection` and report it like the real stack would.
    pub fn set_connection(&self, connection: PeerConnectionState) {
        self.state.lock().unwrap().connection = connection;
        self.events.emit(PeerEvent::ConnectionState(connection));
    }

    fn maybe_connect(&self) {
        if !self.auto_connect {
            return;
        }
        let ready = {
            let mut state = self.state.lock().unwrap();
            let ready = state.local.is_some()
                && state.remote.is_some()
                && !state.applied.is_empty()
                && state.connection != PeerConnectionState::Connected;
            if ready {
                state.connection = PeerConnectionState::Connected;
            }
            ready
        };
        if ready {
            self.events
                .emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        }
    }
}

fn check_sdp(description: &SessionDescription) -> Result<()> {
    if description.sdp.starts_with("v=0") {
        Ok(())
    } else {
        Err(Error::negotiation("malformed session description"))
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.state.lock().unwrap().tracks.push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let mut state = self.state.lock().unwrap();
        state.offers += 1;
        if options.ice_restart {
            state.restarts += 1;
        }
        Ok(SessionDescription::offer(remote_sdp(&format!(
            "offer-{}",
            state.offers
        ))))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock().unwrap();
        match &state.remote {
            Some(remote) if remote.kind == SdpKind::Offer => {
                Ok(SessionDescription::answer(remote_sdp("answer")))
            }
            _ => Err(Error::negotiation("no remote offer to answer")),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        check_sdp(&description)?;
        self.state.lock().unwrap().local = Some(description);
        self.events
            .emit(PeerEvent::LocalCandidate(candidate(self.generation() as u8)));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        check_sdp(&description)?;
        self.state.lock().unwrap().remote = Some(description);
        for kind in [MediaKind::Audio, MediaKind::Video] {
            self.events.emit(PeerEvent::Track(RemoteTrack {
                id: format!("remote-{kind}"),
                kind,
                stream_id: "remote-stream".to_string(),
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                state.rejected.push(candidate);
                return Err(Error::internal("peer connection is closed"));
            }
            if state.remote.is_none() {
                return Err(Error::candidate("no remote description"));
            }
            if !candidate.candidate.starts_with("candidate:") {
                state.rejected.push(candidate);
                return Err(Error::candidate("unparseable candidate"));
            }
            state.applied.push(candidate);
        }
        self.maybe_connect();
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().unwrap().connection
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.connection = PeerConnectionState::Closed;
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakePeerFactory {
    auto_connect: bool,
    peers: Arc<Mutex<Vec<Arc<FakePeer>>>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self {
            auto_connect: true,
            peers: Arc::default(),
        }
    }

    /// Peers that only change connection state through `set_connection`.
    pub fn manual() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer connection was created")
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _config: &RtcConfig,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeer::new(events, self.auto_connect));
        self.peers.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

type Outbound = mpsc::UnboundedSender<WsMessage>;

#[derive(Default)]
struct RelayState {
    next_id: AtomicU64,
    rooms: Mutex<HashMap<String, Vec<(u64, Outbound)>>>,
    paths: Mutex<Vec<String>>,
    frames: Mutex<Vec<(String, String)>>,
}

impl RelayState {
    fn broadcast(&self, token: &str, from: Option<u64>, frame: WsMessage) {
        let rooms = self.rooms.lock().unwrap();
        for (id, tx) in rooms.get(token).into_iter().flatten() {
            if Some(*id) != from {
                let _ = tx.send(frame.clone());
            }
        }
    }
}

/// Minimal `/connect/<token>` relay: every text frame is forwarded to the
/// other clients holding the same token.
pub struct TestRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    task: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState::default());

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.paths.lock().unwrap().clone()
    }

    /// Text frames clients sent for `token`, in arrival order.
    pub fn frames(&self, token: &str) -> Vec<serde_json::Value> {
        self.state
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == token)
            .filter_map(|(_, text)| serde_json::from_str(text).ok())
            .collect()
    }

    pub fn peers(&self, token: &str) -> usize {
        self.state
            .rooms
            .lock()
            .unwrap()
            .get(token)
            .map_or(0, Vec::len)
    }

    pub async fn wait_for_peers(&self, token: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.peers(token) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("clients never joined the relay");
    }

    /// Push a raw text frame to every client holding `token`.
    pub fn inject(&self, token: &str, text: &str) {
        self.state
            .broadcast(token, None, WsMessage::Text(text.to_string()));
    }

    pub fn close_room(&self, token: &str) {
        self.state.broadcast(token, None, WsMessage::Close(None));
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<RelayState>) {
    let mut path = String::new();
    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    state.paths.lock().unwrap().push(path.clone());
    let Some(token) = path.strip_prefix("/connect/").map(str::to_string) else {
        return;
    };

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel();
    state
        .rooms
        .lock()
        .unwrap()
        .entry(token.clone())
        .or_default()
        .push((id, tx));

    let (mut write, mut read) = ws.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, WsMessage::Close(_));
            if write.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = read.next().await {
        match frame {
            WsMessage::Text(text) => {
                state
                    .frames
                    .lock()
                    .unwrap()
                    .push((token.clone(), text.clone()));
                state.broadcast(&token, Some(id), WsMessage::Text(text));
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    if let Some(room) = state.rooms.lock().unwrap().get_mut(&token) {
        room.retain(|(peer, _)| *peer != id);
    }
    writer.abort();
}
