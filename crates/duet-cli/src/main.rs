//! Duet CLI: place a call or join one from a call link.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use duet_client::{CallSession, MediaConstraints, RtcPeerFactory, SessionEvent, SyntheticDevices};
use duet_common::config::DEFAULT_RELAY_URL;
use duet_common::{CallConfig, SignalingConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(about = "Peer-to-peer audio/video calls")]
struct Args {
    /// Signaling relay address
    #[arg(
        long,
        env = "DUET_RELAY_URL",
        default_value = DEFAULT_RELAY_URL,
        global = true
    )]
    relay_url: String,

    /// Do not send video
    #[arg(long, global = true)]
    no_video: bool,

    /// Do not send audio
    #[arg(long, global = true)]
    no_audio: bool,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a call and wait for the other side to join
    Call {
        /// Call link to use instead of generating one
        #[arg(short, long)]
        link: Option<String>,

        /// Base address for generated call links
        #[arg(long, env = "DUET_BASE_URL", default_value = "http://localhost:3000")]
        base_url: String,
    },

    /// Join a call from its link and answer the caller
    Join {
        /// Call link shared by the caller
        #[arg(short, long)]
        link: String,
    },

    /// Show version information
    Version,
}

impl Args {
    fn constraints(&self) -> Result<MediaConstraints> {
        let mut constraints = MediaConstraints::default();
        if self.no_video {
            constraints.video = None;
        }
        if self.no_audio {
            constraints.audio = None;
        }
        if constraints.requested_kinds().is_empty() {
            bail!("--no-video and --no-audio leave nothing to send");
        }
        Ok(constraints)
    }

    fn session(&self, link: &str, auto_answer: bool) -> Result<CallSession> {
        let config = CallConfig {
            signaling: SignalingConfig::new(self.relay_url.clone()),
            auto_answer,
            ..CallConfig::from_link(link)?
        };
        info!("call token: {}", config.token);

        Ok(CallSession::new(
            config,
            self.constraints()?,
            Arc::new(RtcPeerFactory::new()),
            Arc::new(SyntheticDevices::default().with_silence(true)),
        ))
    }
}

fn call_link(base_url: &str) -> String {
    format!(
        "{}/call/{}",
        base_url.trim_end_matches('/'),
        uuid::Uuid::new_v4()
    )
}

/// Keep the call up until Ctrl-C, reporting what happens along the way.
async fn run_until_interrupted(session: &CallSession) {
    let mut events = session.subscribe();
    let mut active = session.watchers().active;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, hanging up");
                break;
            }
            changed = active.changed() => {
                if changed.is_err() {
                    break;
                }
                if *active.borrow_and_update() {
                    println!("Call connected");
                } else {
                    println!("Call interrupted, waiting for the connection to recover");
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::SignalingClosed) => {
                    warn!("signaling relay closed the channel");
                }
                Ok(SessionEvent::NegotiationFailed(reason)) => {
                    warn!("negotiation failed: {}", reason);
                }
                Ok(event) => debug!("session event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("missed {} session events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    duet_common::init_tracing_with_default(&args.log_level);

    match &args.command {
        Command::Call { link, base_url } => {
            let link = link.clone().unwrap_or_else(|| call_link(base_url));
            let session = args.session(&link, false)?;
            println!("Share this link: {}", link);

            session.start_local_stream().await?;
            session.create_offer().await?;
            println!("Waiting for the other side to join...");

            run_until_interrupted(&session).await;
            session.hang_up().await;
        }
        Command::Join { link } => {
            let session = args.session(link, true)?;

            session.start_local_stream().await?;
            session.connect_signaling().await?;
            println!("Joined, waiting for the caller's offer...");

            run_until_interrupted(&session).await;
            session.hang_up().await;
        }
        Command::Version => {
            println!("duet {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
