use std::fmt;

/// Where a call attempt stands.
///
/// `Idle → Connecting → Connected`; `Failed` is reachable from both
/// `Connecting` and `Connected` and may recover through an ICE restart.
/// `Closed` is only entered by hanging up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// The "call active" projection.
    pub fn is_active(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Things that happened without the UI asking for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A remote offer was applied; the session is ready to answer.
    OfferReceived,
    /// A remote answer was applied.
    AnswerApplied,
    /// A failed connection was still failed after the grace period and an
    /// ICE-restart offer was sent.
    IceRestarted,
    /// An inbound negotiation step failed.
    NegotiationFailed(String),
    /// The relay closed the signaling channel.
    SignalingClosed,
}
