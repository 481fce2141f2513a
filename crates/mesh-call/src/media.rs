//! Local media source — owns the single local capture stream of a call.
//!
//! The stream is acquired once when the local participant joins and released
//! when they leave. Every connection attaches the same tracks read-only; only
//! this module starts or stops them.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use mesh_common::config::MediaConfig;
use mesh_common::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// One captured track. Clones share the same liveness flag.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// The local capture handle: audio and/or video tracks under one stream id.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Tracks that have not been stopped.
    pub fn live_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.is_live())
    }

    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Media capture device API.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Request a capture stream. Fails with [`MeshError::MediaUnavailable`] when
    /// permission is denied or no device exists.
    async fn request_capture(&self, constraints: &MediaConfig) -> MeshResult<LocalStream>;

    /// Every track of `stream` has been stopped.
    fn released(&self, _stream: &LocalStream) {}
}

/// Acquisition status, also reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    /// Not joined yet.
    Idle,
    Acquiring,
    Ready,
    /// Capture failed or the device went away; the call continues without it.
    Unavailable,
    Released,
}

/// Result of completing an acquisition.
#[derive(Debug)]
pub enum AcquireOutcome {
    Ready,
    Unavailable(MeshError),
    /// The acquisition was superseded by a leave (or a newer join).
    Stale,
}

/// An acquisition to run off the event loop; its result goes back through
/// [`LocalMediaSource::finish_acquire`] with the same epoch.
pub struct PendingCapture {
    pub epoch: u64,
    pub capture: BoxFuture<'static, MeshResult<LocalStream>>,
}

pub struct LocalMediaSource {
    device: Arc<dyn CaptureDevice>,
    constraints: MediaConfig,
    status: MediaStatus,
    stream: Option<LocalStream>,
    epoch: u64,
}

impl LocalMediaSource {
    pub fn new(device: Arc<dyn CaptureDevice>, constraints: MediaConfig) -> Self {
        Self {
            device,
            constraints,
            status: MediaStatus::Idle,
            stream: None,
            epoch: 0,
        }
    }

    pub fn status(&self) -> MediaStatus {
        self.status
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    /// Acquisition has finished one way or the other.
    pub fn is_settled(&self) -> bool {
        matches!(self.status, MediaStatus::Ready | MediaStatus::Unavailable)
    }

    /// Start acquiring. Returns `None` when a stream is already active or being
    /// acquired, so at most one stream exists per session.
    pub fn begin_acquire(&mut self) -> Option<PendingCapture> {
        if matches!(self.status, MediaStatus::Acquiring | MediaStatus::Ready) {
            return None;
        }
        self.epoch += 1;
        self.status = MediaStatus::Acquiring;

        let device = self.device.clone();
        let constraints = self.constraints.clone();
        Some(PendingCapture {
            epoch: self.epoch,
            capture: Box::pin(async move { device.request_capture(&constraints).await }),
        })
    }

    pub fn finish_acquire(&mut self, epoch: u64, result: MeshResult<LocalStream>) -> AcquireOutcome {
        if epoch != self.epoch || self.status != MediaStatus::Acquiring {
            if let Ok(stream) = result {
                // Nobody will ever attach this one.
                stream.stop();
                self.device.released(&stream);
            }
            return AcquireOutcome::Stale;
        }

        match result {
            Ok(stream) => {
                tracing::info!(
                    stream = %stream.id,
                    tracks = stream.tracks.len(),
                    "Local media acquired"
                );
                self.stream = Some(stream);
                self.status = MediaStatus::Ready;
                AcquireOutcome::Ready
            }
            Err(e) => {
                tracing::warn!(error = %e, "Local media unavailable, continuing without it");
                self.status = MediaStatus::Unavailable;
                let e = match e {
                    MeshError::MediaUnavailable { .. } => e,
                    other => MeshError::MediaUnavailable {
                        reason: other.to_string(),
                    },
                };
                AcquireOutcome::Unavailable(e)
            }
        }
    }

    /// The capture device disappeared mid-call. Returns the lost stream so
    /// connections can detach it.
    pub fn lose_device(&mut self) -> Option<LocalStream> {
        let stream = self.stream.take()?;
        stream.stop();
        self.device.released(&stream);
        self.status = MediaStatus::Unavailable;
        tracing::warn!(stream = %stream.id, "Local capture device lost");
        Some(stream)
    }

    /// Stop all tracks. Idempotent; also invalidates an in-flight acquisition.
    pub fn release(&mut self) -> bool {
        self.epoch += 1;
        let released = match self.stream.take() {
            Some(stream) => {
                stream.stop();
                self.device.released(&stream);
                tracing::info!(stream = %stream.id, "Local media released");
                true
            }
            None => false,
        };
        self.status = MediaStatus::Released;
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Camera {
        deny: bool,
        released: AtomicUsize,
    }

    impl Camera {
        fn new(deny: bool) -> Arc<Self> {
            Arc::new(Self {
                deny,
                released: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CaptureDevice for Camera {
        async fn request_capture(&self, _constraints: &MediaConfig) -> MeshResult<LocalStream> {
            if self.deny {
                return Err(MeshError::MediaUnavailable {
                    reason: "permission denied".into(),
                });
            }
            Ok(LocalStream::new(vec![
                MediaTrack::new(TrackKind::Audio),
                MediaTrack::new(TrackKind::Video),
            ]))
        }

        fn released(&self, _stream: &LocalStream) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn acquire_then_release_stops_tracks_once() {
        let camera = Camera::new(false);
        let mut media = LocalMediaSource::new(camera.clone(), MediaConfig::default());

        let pending = media.begin_acquire().expect("idle source should acquire");
        assert!(media.begin_acquire().is_none(), "only one acquisition at a time");
        let result = pending.capture.await;
        assert!(matches!(
            media.finish_acquire(pending.epoch, result),
            AcquireOutcome::Ready
        ));

        let stream = media.stream().cloned().unwrap();
        assert!(stream.is_active());

        assert!(media.release());
        assert!(!media.release(), "second release is a no-op");
        assert!(!stream.is_active());
        assert_eq!(camera.released.load(Ordering::SeqCst), 1);
        assert_eq!(media.status(), MediaStatus::Released);
    }

    #[tokio::test]
    async fn denied_capture_degrades_instead_of_failing() {
        let mut media = LocalMediaSource::new(Camera::new(true), MediaConfig::default());
        let pending = media.begin_acquire().unwrap();
        let result = pending.capture.await;

        match media.finish_acquire(pending.epoch, result) {
            AcquireOutcome::Unavailable(MeshError::MediaUnavailable { reason }) => {
                assert_eq!(reason, "permission denied");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(media.is_settled());
        assert!(media.stream().is_none());
    }

    #[tokio::test]
    async fn capture_finishing_after_leave_is_discarded() {
        let camera = Camera::new(false);
        let mut media = LocalMediaSource::new(camera.clone(), MediaConfig::default());
        let pending = media.begin_acquire().unwrap();

        media.release();
        let result = pending.capture.await;
        let late = result.as_ref().ok().cloned().unwrap();

        assert!(matches!(
            media.finish_acquire(pending.epoch, result),
            AcquireOutcome::Stale
        ));
        assert!(media.stream().is_none());
        assert!(!late.is_active());
        assert_eq!(camera.released.load(Ordering::SeqCst), 1);
    }
}
