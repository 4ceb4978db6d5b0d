use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use duet_common::{Error, MediaAccessError, MediaKind, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
/// A single Opus frame that decodes to 20 ms of silence.
const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub ideal_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
            ideal_frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Quality hints passed to the capture backend. `None` means the kind is
/// not requested at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints::default()),
            audio: Some(AudioConstraints::default()),
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            video: None,
            ..Self::default()
        }
    }

    pub fn video_only() -> Self {
        Self {
            audio: None,
            ..Self::default()
        }
    }

    pub fn requested_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio.is_some() {
            kinds.push(MediaKind::Audio);
        }
        if self.video.is_some() {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

struct LocalTrackInner {
    id: String,
    kind: MediaKind,
    sample_track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

/// Captured track that can be attached to a peer connection.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{kind}-{}", Uuid::new_v4());
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_owned(),
        ));

        Self {
            inner: Arc::new(LocalTrackInner {
                id,
                kind,
                sample_track,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.sample_track)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop capturing. Samples written afterwards are discarded.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("stopped local {} track {}", self.inner.kind, self.inner.id);
        }
    }

    /// Push one encoded frame to every peer connection the track is attached to.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        self.inner
            .sample_track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaAccessError::Device(e.to_string()).into())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
}

/// Inbound media as announced by track events. Not complete until the
/// connection reports connected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Returns `false` if a track with the same id was already present.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|existing| existing.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|track| track.kind == kind)
    }
}

/// Capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<LocalStream, MediaAccessError>;
}

/// Request capture from `devices`. Failures are logged and returned as-is.
pub async fn acquire(
    devices: &dyn MediaDevices,
    constraints: &MediaConstraints,
) -> Result<LocalStream> {
    match devices.get_user_media(constraints).await {
        Ok(stream) => {
            info!(
                "local stream {} started with {} track(s)",
                stream.id(),
                stream.tracks().len()
            );
            Ok(stream)
        }
        Err(e) => {
            error!("error accessing media devices: {}", e);
            Err(Error::MediaAccess(e))
        }
    }
}

/// Capture backend that fabricates its tracks.
///
/// Audio can optionally carry generated silence; anything else has to be
/// fed through [`LocalTrack::write_sample`].
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    permission_granted: bool,
    audio_available: bool,
    video_available: bool,
    generate_silence: bool,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            permission_granted: true,
            audio_available: true,
            video_available: true,
            generate_silence: false,
        }
    }
}

impl SyntheticDevices {
    pub fn denied() -> Self {
        Self {
            permission_granted: false,
            ..Self::default()
        }
    }

    pub fn without(mut self, kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => self.audio_available = false,
            MediaKind::Video => self.video_available = false,
        }
        self
    }

    pub fn with_silence(mut self, enabled: bool) -> Self {
        self.generate_silence = enabled;
        self
    }

    fn available(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_available,
            MediaKind::Video => self.video_available,
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<LocalStream, MediaAccessError> {
        if !self.permission_granted {
            return Err(MediaAccessError::PermissionDenied);
        }

        let kinds = constraints.requested_kinds();
        if kinds.is_empty() {
            return Err(MediaAccessError::Device(
                "neither audio nor video was requested".to_string(),
            ));
        }
        if let Some(missing) = kinds.iter().copied().find(|kind| !self.available(*kind)) {
            return Err(MediaAccessError::NotFound(missing));
        }

        let stream_id = format!("local-{}", Uuid::new_v4());
        let tracks: Vec<LocalTrack> = kinds
            .into_iter()
            .map(|kind| LocalTrack::new(kind, &stream_id))
            .collect();

        if let Some(video) = constraints.video {
            debug!(
                "synthetic video at {}x{}@{}",
                video.ideal_width, video.ideal_height, video.ideal_frame_rate
            );
        }
        if self.generate_silence {
            if let Some(audio) = tracks.iter().find(|t| t.kind() == MediaKind::Audio) {
                spawn_silence(audio.clone());
            }
        }

        Ok(LocalStream::new(stream_id, tracks))
    }
}

fn spawn_silence(track: LocalTrack) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OPUS_FRAME_DURATION);
        while !track.is_stopped() {
            ticker.tick().await;
            if let Err(e) = track
                .write_sample(Bytes::from_static(&OPUS_SILENCE_FRAME), OPUS_FRAME_DURATION)
                .await
            {
                warn!("silence generator stopped: {}", e);
                break;
            }
        }
    });
}
