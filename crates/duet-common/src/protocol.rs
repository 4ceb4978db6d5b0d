use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const OFFER_TAG: &str = "offer";
const ANSWER_TAG: &str = "answer";
const ICE_CANDIDATE_TAG: &str = "ice-candidate";

/// Tags understood by [`SignalingMessage::decode`]. Anything else is skipped.
pub const KNOWN_MESSAGE_TYPES: [&str; 3] = [OFFER_TAG, ANSWER_TAG, ICE_CANDIDATE_TAG];

/// Message exchanged with the peer through the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Session description proposed by the calling side.
    Offer { sdp: String },

    /// Session description accepted by the called side.
    Answer { sdp: String },

    /// Trickled network-path candidate.
    IceCandidate { candidate: IceCandidate },
}

impl SignalingMessage {
    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => OFFER_TAG,
            Self::Answer { .. } => ANSWER_TAG,
            Self::IceCandidate { .. } => ICE_CANDIDATE_TAG,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::serialization)
    }

    /// Decode a text frame.
    ///
    /// Returns `Ok(None)` for well-formed frames carrying a tag this client
    /// does not know, so newer relays or peers can add message types.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(Error::serialization)?;
        let tag = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::protocol("signaling message has no string `type` field"))?;

        if !KNOWN_MESSAGE_TYPES.contains(&tag) {
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(Error::serialization)
    }
}

/// ICE candidate in the shape browsers put on the wire (`RTCIceCandidateInit`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description with its role in the offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Signaling message carrying this description.
    pub fn to_message(&self) -> SignalingMessage {
        match self.kind {
            SdpKind::Offer => SignalingMessage::Offer {
                sdp: self.sdp.clone(),
            },
            SdpKind::Answer => SignalingMessage::Answer {
                sdp: self.sdp.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Identifier binding two clients to the same signaling session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallToken(String);

impl CallToken {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::InvalidToken("call token is empty".to_string()));
        }
        Ok(Self(token))
    }

    /// Derive the token from a shareable call link.
    ///
    /// The token is the last path segment; query string and fragment are ignored.
    pub fn from_link(link: &str) -> Result<Self> {
        let path = link
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let segment = path.rsplit('/').next().unwrap_or_default();
        Self::new(segment).map_err(|_| {
            Error::InvalidToken(format!("call link `{link}` has no trailing token segment"))
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
