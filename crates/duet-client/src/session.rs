//! One call, driven from a single task.
//!
//! [`CallSession`] is the handle the UI holds. Operations are queued to the
//! task that owns the [`NegotiationEngine`] and run one at a time, in
//! between signaling messages, peer callbacks and the restart timer.
//! Hanging up interrupts whatever the task is awaiting.

use std::future::Future;
use std::sync::Arc;

use duet_common::{CallConfig, Error, IceCandidate, Result, SessionDescription};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, NegotiationEngine, SessionWatchers};
use crate::media::{LocalStream, MediaConstraints, MediaDevices, RemoteStream};
use crate::peer::PeerFactory;
use crate::types::{NegotiationState, SessionEvent};

const EVENT_CAPACITY: usize = 32;

type Responder<T> = oneshot::Sender<Result<T>>;

enum Command {
    ConnectSignaling(Responder<()>),
    StartLocalStream(Responder<LocalStream>),
    CreatePeerConnection(Responder<()>),
    CreateOffer(Responder<SessionDescription>),
    HandleOffer(String, Responder<()>),
    CreateAnswer(Responder<SessionDescription>),
    HandleAnswer(String, Responder<()>),
    HandleIceCandidate(IceCandidate, oneshot::Sender<()>),
}

fn hung_up() -> Error {
    Error::call_order("the call was hung up")
}

pub struct CallSession {
    commands: mpsc::UnboundedSender<Command>,
    hang_up: watch::Sender<bool>,
    watchers: SessionWatchers,
    events: broadcast::Sender<SessionEvent>,
    task: JoinHandle<()>,
}

impl CallSession {
    /// Build an engine for `config` and start driving it.
    pub fn new(
        config: CallConfig,
        constraints: MediaConstraints,
        peers: Arc<dyn PeerFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (engine, events) = NegotiationEngine::new(config, peers, devices);
        Self::start(engine.with_constraints(constraints), events)
    }

    /// Move `engine` onto its own task. Must be called inside a tokio runtime.
    pub fn start(
        engine: NegotiationEngine,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Self {
        let watchers = engine.watchers();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (hang_up, hang_up_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let driver = Driver {
            auto_answer: engine.config().auto_answer,
            engine,
            engine_events,
            commands: command_rx,
            hang_up: hang_up_rx,
            notify: events.clone(),
        };
        let task = tokio::spawn(driver.run());

        Self {
            commands,
            hang_up,
            watchers,
            events,
            task,
        }
    }

    async fn call<T>(&self, make: impl FnOnce(Responder<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| hung_up())?;
        rx.await.map_err(|_| hung_up())?
    }

    pub async fn connect_signaling(&self) -> Result<()> {
        self.call(Command::ConnectSignaling).await
    }

    pub async fn start_local_stream(&self) -> Result<LocalStream> {
        self.call(Command::StartLocalStream).await
    }

    pub async fn create_peer_connection(&self) -> Result<()> {
        self.call(Command::CreatePeerConnection).await
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.call(Command::CreateOffer).await
    }

    pub async fn handle_offer(&self, sdp: impl Into<String>) -> Result<()> {
        let sdp = sdp.into();
        self.call(|tx| Command::HandleOffer(sdp, tx)).await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        self.call(Command::CreateAnswer).await
    }

    pub async fn handle_answer(&self, sdp: impl Into<String>) -> Result<()> {
        let sdp = sdp.into();
        self.call(|tx| Command::HandleAnswer(sdp, tx)).await
    }

    /// Hand a remote candidate to the engine. Resolves once it has been
    /// applied or queued.
    pub async fn handle_ice_candidate(&self, candidate: IceCandidate) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::HandleIceCandidate(candidate, tx))
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// End the call and wait until everything is torn down. Interrupts any
    /// operation in flight. Safe to call any number of times.
    pub async fn hang_up(&self) {
        self.hang_up.send_replace(true);
        let mut state = self.watchers.state.clone();
        let _ = state.wait_for(|s| *s == NegotiationState::Closed).await;
    }

    /// Resolve once the connection is up. Fails if the call ends first.
    pub async fn wait_until_active(&self) -> Result<()> {
        let mut active = self.watchers.active.clone();
        let mut state = self.watchers.state.clone();
        loop {
            if *active.borrow_and_update() {
                return Ok(());
            }
            if *state.borrow_and_update() == NegotiationState::Closed {
                return Err(Error::call_order("the call ended before connecting"));
            }
            tokio::select! {
                changed = active.changed() => changed.map_err(|_| hung_up())?,
                changed = state.changed() => changed.map_err(|_| hung_up())?,
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn watchers(&self) -> SessionWatchers {
        self.watchers.clone()
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.watchers.local_stream.borrow().clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.watchers.remote_stream.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        *self.watchers.active.borrow()
    }

    pub fn state(&self) -> NegotiationState {
        *self.watchers.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // The driver hangs up on its way out.
        self.hang_up.send_replace(true);
    }
}

struct Driver {
    engine: NegotiationEngine,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    hang_up: watch::Receiver<bool>,
    notify: broadcast::Sender<SessionEvent>,
    auto_answer: bool,
}

impl Driver {
    async fn run(mut self) {
        debug!("call session started for token {}", self.engine.config().token);
        loop {
            tokio::select! {
                biased;
                _ = self.hang_up.changed() => break,
                Some(command) = self.commands.recv() => {
                    let mut hang_up = self.hang_up.clone();
                    if !interruptible(&mut hang_up, execute(&mut self.engine, command)).await {
                        break;
                    }
                }
                Some(event) = self.engine_events.recv() => {
                    if !self.on_engine_event(event).await {
                        break;
                    }
                }
            }
        }

        self.engine.hang_up().await;
        info!("call session ended");
    }

    /// Returns `false` when a hang-up interrupted the work.
    async fn on_engine_event(&mut self, event: EngineEvent) -> bool {
        let mut hang_up = self.hang_up.clone();
        let mut outcome = None;
        let completed = interruptible(&mut hang_up, async {
            outcome = self.engine.handle_event(event).await;
        })
        .await;
        if !completed {
            return false;
        }
        let Some(event) = outcome else {
            return true;
        };

        // Renegotiation offers, such as an ICE restart from the other side,
        // are always answered. The first offer waits for the application
        // unless auto-answer is on.
        let answer = event == SessionEvent::OfferReceived
            && (self.auto_answer || self.engine.has_negotiated());
        self.publish(event);

        if answer {
            let mut failure = None;
            let completed = interruptible(&mut hang_up, async {
                if let Err(e) = self.engine.create_answer().await {
                    warn!("failed to answer remote offer: {}", e);
                    failure = Some(e.to_string());
                }
            })
            .await;
            if !completed {
                return false;
            }
            if let Some(reason) = failure {
                self.publish(SessionEvent::NegotiationFailed(reason));
            }
        }
        true
    }

    fn publish(&self, event: SessionEvent) {
        debug!("session event: {:?}", event);
        let _ = self.notify.send(event);
    }
}

/// Run `work` unless a hang-up arrives first. Returns whether it completed.
async fn interruptible(
    hang_up: &mut watch::Receiver<bool>,
    work: impl Future<Output = ()>,
) -> bool {
    tokio::select! {
        biased;
        _ = hang_up.changed() => false,
        _ = work => true,
    }
}

async fn execute(engine: &mut NegotiationEngine, command: Command) {
    match command {
        Command::ConnectSignaling(tx) => {
            let _ = tx.send(engine.connect_signaling().await);
        }
        Command::StartLocalStream(tx) => {
            let _ = tx.send(engine.start_local_stream().await);
        }
        Command::CreatePeerConnection(tx) => {
            let _ = tx.send(engine.create_peer_connection().await);
        }
        Command::CreateOffer(tx) => {
            let _ = tx.send(engine.create_offer().await);
        }
        Command::HandleOffer(sdp, tx) => {
            let _ = tx.send(engine.handle_offer(sdp).await);
        }
        Command::CreateAnswer(tx) => {
            let _ = tx.send(engine.create_answer().await);
        }
        Command::HandleAnswer(sdp, tx) => {
            let _ = tx.send(engine.handle_answer(sdp).await);
        }
        Command::HandleIceCandidate(candidate, tx) => {
            engine.handle_ice_candidate(candidate).await;
            let _ = tx.send(());
        }
    }
}
