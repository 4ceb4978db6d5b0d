//! Static call configuration.
//!
//! The NAT-traversal server list is fixed; only the relay address and a few
//! behaviour switches can be overridden from the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::helpers::{env_bool, env_string};
use crate::protocol::CallToken;

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080";
pub const DEFAULT_ICE_CANDIDATE_POOL_SIZE: u8 = 10;
pub const DEFAULT_ICE_RESTART_DELAY: Duration = Duration::from_secs(2);

const RELAY_URL_ENV: &str = "DUET_RELAY_URL";
const AUTO_ANSWER_ENV: &str = "DUET_AUTO_ANSWER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    Negotiate,
    Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceTransportPolicy {
    /// Host, server-reflexive and relayed paths.
    All,
    /// Relayed paths only.
    Relay,
}

/// Peer connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
    pub ice_transport_policy: IceTransportPolicy,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
                IceServer::stun("stun:stun3.l.google.com:19302"),
                IceServer::stun("stun:stun4.l.google.com:19302"),
                IceServer::turn(
                    "turn:openrelay.metered.ca:80",
                    "openrelayproject",
                    "openrelayproject",
                ),
                IceServer::turn(
                    "turn:openrelay.metered.ca:443",
                    "openrelayproject",
                    "openrelayproject",
                ),
                IceServer::turn(
                    "turn:openrelay.metered.ca:443?transport=tcp",
                    "openrelayproject",
                    "openrelayproject",
                ),
                IceServer::turn(
                    "turn:turn.anyfirewall.com:443?transport=tcp",
                    "webrtc",
                    "webrtc",
                ),
            ],
            ice_candidate_pool_size: DEFAULT_ICE_CANDIDATE_POOL_SIZE,
            bundle_policy: BundlePolicy::MaxBundle,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
            ice_transport_policy: IceTransportPolicy::All,
        }
    }
}

/// Where the signaling relay lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingConfig {
    pub relay_url: String,
}

impl SignalingConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(env_string(RELAY_URL_ENV).unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()))
    }

    /// Address of the relay endpoint for one call: `<relay>/connect/<token>`.
    ///
    /// `http(s)` relay addresses are mapped to `ws(s)`.
    pub fn endpoint(&self, token: &CallToken) -> Result<url::Url> {
        let mut url = url::Url::parse(self.relay_url.trim())
            .map_err(|e| Error::config(format!("invalid relay url `{}`: {e}", self.relay_url)))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(Error::config(format!(
                    "unsupported relay url scheme `{other}`"
                )))
            }
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| Error::config("cannot rewrite relay url scheme"))?;
        }

        url.path_segments_mut()
            .map_err(|_| Error::config("relay url cannot carry a path"))?
            .pop_if_empty()
            .push("connect")
            .push(token.as_str());
        Ok(url)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_URL)
    }
}

/// Everything one call attempt needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    pub token: CallToken,
    pub signaling: SignalingConfig,
    pub rtc: RtcConfig,
    /// Delay before re-checking a failed connection and restarting ICE.
    pub ice_restart_delay: Duration,
    /// Answer every applied remote offer without waiting for the caller of
    /// the session to do it.
    pub auto_answer: bool,
}

impl CallConfig {
    pub fn new(token: CallToken) -> Self {
        Self {
            token,
            signaling: SignalingConfig::default(),
            rtc: RtcConfig::default(),
            ice_restart_delay: DEFAULT_ICE_RESTART_DELAY,
            auto_answer: false,
        }
    }

    /// Same as [`CallConfig::new`] but with `DUET_*` environment overrides applied.
    pub fn from_env(token: CallToken) -> Self {
        Self {
            signaling: SignalingConfig::from_env(),
            auto_answer: env_bool(AUTO_ANSWER_ENV, false),
            ..Self::new(token)
        }
    }

    pub fn from_link(link: &str) -> Result<Self> {
        Ok(Self::new(CallToken::from_link(link)?))
    }
}
