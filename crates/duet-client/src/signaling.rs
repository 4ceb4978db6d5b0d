//! WebSocket channel to the signaling relay.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use duet_common::{CallToken, Error, Result, SignalingConfig, SignalingMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Message(SignalingMessage),
    /// The relay closed the channel or the transport broke.
    Closed,
}

/// Receives everything the channel reads. Called from the reader task.
pub type SignalingHandler = Box<dyn Fn(SignalingEvent) + Send + Sync>;

#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new(state: ChannelState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Open channel to `<relay>/connect/<token>`.
///
/// Nothing is queued or retried: a send while the channel is not open is
/// dropped, and a closed channel stays closed.
pub struct SignalingClient {
    endpoint: String,
    state: SharedState,
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingClient {
    /// Open the channel for `token`. Resolves once the WebSocket handshake
    /// has completed and the channel can send.
    pub async fn connect(
        config: &SignalingConfig,
        token: &CallToken,
        handler: SignalingHandler,
    ) -> Result<Self> {
        let endpoint = config.endpoint(token)?.to_string();
        debug!("connecting to signaling relay: {}", endpoint);

        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::signaling(format!("failed to open {endpoint}: {e}")))?;
        info!("connected to signaling relay with token {}", token);

        let state = SharedState::new(ChannelState::Open);
        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        let writer_state = state.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if let Err(e) = write.send(frame).await {
                    error!("failed to send signaling message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
            writer_state.set(ChannelState::Closed);
        });

        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match SignalingMessage::decode(&text) {
                        Ok(Some(message)) => {
                            debug!("received {} message", message.kind());
                            handler(SignalingEvent::Message(message));
                        }
                        Ok(None) => debug!("ignoring signaling message of unknown type"),
                        Err(e) => warn!("dropping malformed signaling message: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        error!("signaling websocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            reader_state.set(ChannelState::Closed);
            info!("disconnected from signaling relay");
            handler(SignalingEvent::Closed);
        });

        Ok(Self {
            endpoint,
            state,
            outbound,
            reader,
            writer,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Serialize and transmit `message` if the channel is open.
    ///
    /// Returns whether the message was handed to the transport.
    pub fn send(&self, message: &SignalingMessage) -> bool {
        if !self.is_open() {
            debug!(
                "signaling channel is {:?}, dropping {} message",
                self.state(),
                message.kind()
            );
            return false;
        }

        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode {} message: {}", message.kind(), e);
                return false;
            }
        };
        self.outbound.send(WsMessage::Text(text)).is_ok()
    }

    /// Close the channel. Safe to call more than once.
    pub fn close(&self) {
        match self.state() {
            ChannelState::Closing | ChannelState::Closed => {}
            _ => {
                self.state.set(ChannelState::Closing);
                self.reader.abort();
                let _ = self.outbound.send(WsMessage::Close(None));
                debug!("closing signaling channel {}", self.endpoint);
            }
        }
        if self.writer.is_finished() {
            self.state.set(ChannelState::Closed);
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
