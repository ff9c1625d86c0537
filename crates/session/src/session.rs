//! Render sessions: one engine instance plus its cached movie metadata.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::OnceCell;

use framecast_common::config::ReadinessPolicy;
use framecast_common::error::{FramecastError, FramecastResult};

use crate::engine::{ClipRect, EngineInstance, LaunchOptions, RenderEngine};
use crate::movie::{Frame, MovieInfo};
use crate::page::{
    parse_fallback_probe, parse_ready_probe, seek_expression, Capture, FALLBACK_PROBE,
    READY_PROBE,
};

/// Parameters for opening a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub launch: LaunchOptions,
    pub readiness: ReadinessPolicy,
}

/// A loaded document inside one engine instance.
///
/// At most one frame render may be in flight at a time; a second call while
/// one is pending fails with [`FramecastError::ConcurrentRender`] instead of
/// queueing.
pub struct RenderSession {
    id: u64,
    url: String,
    instance: Box<dyn EngineInstance>,
    readiness: ReadinessPolicy,
    info: OnceCell<MovieInfo>,
    rendering: AtomicBool,
    in_flight: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for RenderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSession")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("info", &self.info.get())
            .field("rendering", &self.rendering.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RenderSession {
    /// Launch an engine instance and navigate it to `url`.
    ///
    /// If navigation fails the instance is closed before the error is
    /// returned.
    pub async fn open(
        engine: &dyn RenderEngine,
        id: u64,
        url: &str,
        options: &SessionOptions,
    ) -> FramecastResult<Self> {
        tracing::info!(session_id = id, engine = engine.name(), url, "Opening render session");

        let instance = engine.launch(&options.launch).await.map_err(|e| match e {
            FramecastError::Launch { .. } => e,
            other => FramecastError::launch(other.to_string()),
        })?;

        if let Err(e) = instance.navigate(url).await {
            if let Err(close_err) = instance.close().await {
                tracing::warn!(session_id = id, error = %close_err, "Failed to close instance after navigation error");
            }
            return Err(match e {
                FramecastError::Navigation { .. } => e,
                other => FramecastError::navigation(url, other.to_string()),
            });
        }

        tracing::debug!(session_id = id, "Navigation complete");

        Ok(Self {
            id,
            url: url.to_string(),
            instance,
            readiness: options.readiness,
            info: OnceCell::new(),
            rendering: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a frame render is currently in flight.
    pub fn is_rendering(&self) -> bool {
        self.rendering.load(Ordering::SeqCst)
    }

    /// Movie metadata, polled from the document on first use and cached for
    /// the life of the session. Concurrent callers share one poll sequence.
    pub async fn info(&self) -> FramecastResult<MovieInfo> {
        self.info
            .get_or_try_init(|| self.poll_info())
            .await
            .copied()
    }

    async fn poll_info(&self) -> FramecastResult<MovieInfo> {
        self.ensure_open()?;
        let polls = self.readiness.max_polls();

        for attempt in 1..=polls {
            let value = self.instance.evaluate(READY_PROBE).await?;
            if let Some(info) = parse_ready_probe(value)? {
                info.validate()?;
                tracing::info!(
                    session_id = self.id,
                    width = info.width,
                    height = info.height,
                    fps = info.fps,
                    frame_count = info.frame_count,
                    attempt,
                    "Movie ready"
                );
                return Ok(info);
            }
            if attempt < polls {
                tokio::time::sleep(self.readiness.poll_interval()).await;
            }
        }

        tracing::warn!(
            session_id = self.id,
            timeout_ms = self.readiness.timeout_ms,
            "Document never reported ready; measuring stage element"
        );
        let value = self.instance.evaluate(FALLBACK_PROBE).await?;
        let info = parse_fallback_probe(value)?;
        tracing::warn!(
            session_id = self.id,
            width = info.width,
            height = info.height,
            fps = info.fps,
            frame_count = info.frame_count,
            "Using measured movie metadata"
        );
        Ok(info)
    }

    /// Seek the document to `index` and capture it.
    pub async fn render_frame(&self, index: u64) -> FramecastResult<Frame> {
        let _guard = RenderGuard::acquire(self, index)?;
        self.ensure_open()?;

        let info = self.info().await?;
        let value = self.instance.evaluate(&seek_expression(index)).await?;
        let bytes = match Capture::from_seek_result(value)? {
            Capture::InlineImage(bytes) => bytes,
            Capture::ScreenshotRequired => {
                self.instance
                    .screenshot(ClipRect::from_size(info.width, info.height))
                    .await?
            }
        };

        tracing::debug!(session_id = self.id, frame = index, bytes = bytes.len(), "Frame captured");
        Ok(Frame { index, bytes })
    }

    /// Release the engine instance. Idempotent; failures are logged.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.instance.close().await {
            Ok(()) => tracing::info!(session_id = self.id, "Render session closed"),
            Err(e) => tracing::warn!(session_id = self.id, error = %e, "Failed to close render session"),
        }
    }

    fn ensure_open(&self) -> FramecastResult<()> {
        if self.is_closed() {
            return Err(FramecastError::engine(format!(
                "session {} is closed",
                self.id
            )));
        }
        Ok(())
    }
}

/// Busy flag held for the duration of one render.
struct RenderGuard<'a> {
    session: &'a RenderSession,
}

impl<'a> RenderGuard<'a> {
    fn acquire(session: &'a RenderSession, index: u64) -> FramecastResult<Self> {
        if session
            .rendering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FramecastError::ConcurrentRender {
                session_id: session.id,
                requested: index,
                in_flight: session.in_flight.load(Ordering::SeqCst),
            });
        }
        session.in_flight.store(index, Ordering::SeqCst);
        Ok(Self { session })
    }
}

impl Drop for RenderGuard<'_> {
    fn drop(&mut self) {
        self.session.rendering.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedEngine};
    use std::sync::Arc;
    use std::time::Duration;

    fn movie() -> MovieInfo {
        MovieInfo {
            width: 320,
            height: 240,
            fps: 30.0,
            frame_count: 5,
        }
    }

    fn fast_options() -> SessionOptions {
        SessionOptions {
            launch: LaunchOptions::default(),
            readiness: ReadinessPolicy {
                poll_interval_ms: 5,
                timeout_ms: 50,
            },
        }
    }

    #[tokio::test]
    async fn info_is_polled_once_and_cached() {
        let engine = ScriptedEngine::new(Script::new(movie()).ready_after(3));
        let session = RenderSession::open(&engine, 1, "http://movie", &fast_options())
            .await
            .unwrap();

        let first = session.info().await.unwrap();
        let second = session.info().await.unwrap();

        assert_eq!(first, movie());
        assert_eq!(first, second);
        // three null answers then the ready one; the second call adds nothing
        assert_eq!(engine.counters().ready_probes(), 4);
        assert_eq!(engine.counters().fallback_probes(), 0);
    }

    #[tokio::test]
    async fn concurrent_info_calls_share_one_poll_sequence() {
        let engine = ScriptedEngine::new(Script::new(movie()).ready_after(2));
        let session = Arc::new(
            RenderSession::open(&engine, 1, "http://movie", &fast_options())
                .await
                .unwrap(),
        );

        let (a, b) = tokio::join!(session.info(), session.info());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(engine.counters().ready_probes(), 3);
    }

    #[tokio::test]
    async fn falls_back_to_measurement_when_never_ready() {
        let script = Script::new(movie()).never_ready(serde_json::json!({
            "width": 640, "height": 480, "fps": 25, "frameCount": 12
        }));
        let engine = ScriptedEngine::new(script);
        let session = RenderSession::open(&engine, 1, "http://movie", &fast_options())
            .await
            .unwrap();

        let info = session.info().await.unwrap();
        assert_eq!((info.width, info.height), (640, 480));
        assert_eq!(info.frame_count, 12);
        assert_eq!(engine.counters().ready_probes(), 10);
        assert_eq!(engine.counters().fallback_probes(), 1);
    }

    #[tokio::test]
    async fn unusable_fallback_is_a_timeout() {
        let script = Script::new(movie()).never_ready(serde_json::json!({
            "width": 0, "height": 0, "fps": null, "frameCount": null
        }));
        let engine = ScriptedEngine::new(script);
        let session = RenderSession::open(&engine, 1, "http://movie", &fast_options())
            .await
            .unwrap();

        let err = session.info().await.unwrap_err();
        assert!(matches!(err, FramecastError::Timeout { .. }));
    }

    #[tokio::test]
    async fn second_render_on_busy_session_is_rejected() {
        let script = Script::new(movie()).with_latencies(vec![Duration::from_millis(80)]);
        let engine = ScriptedEngine::new(script);
        let session = RenderSession::open(&engine, 7, "http://movie", &fast_options())
            .await
            .unwrap();
        session.info().await.unwrap();

        let (first, second) = tokio::join!(session.render_frame(0), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.render_frame(1).await
        });

        assert_eq!(first.unwrap().index, 0);
        match second.unwrap_err() {
            FramecastError::ConcurrentRender {
                session_id,
                requested,
                in_flight,
            } => {
                assert_eq!(session_id, 7);
                assert_eq!(requested, 1);
                assert_eq!(in_flight, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!session.is_rendering());
        assert_eq!(session.render_frame(1).await.unwrap().index, 1);
    }

    #[tokio::test]
    async fn screenshot_and_inline_paths_yield_the_same_bytes() {
        let shot_engine = ScriptedEngine::new(Script::new(movie()));
        let shot = RenderSession::open(&shot_engine, 1, "http://movie", &fast_options())
            .await
            .unwrap();
        let inline_engine = ScriptedEngine::new(Script::new(movie()).inline_frames());
        let inline = RenderSession::open(&inline_engine, 2, "http://movie", &fast_options())
            .await
            .unwrap();

        let a = shot.render_frame(3).await.unwrap();
        let b = inline.render_frame(3).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.bytes, ScriptedEngine::frame_bytes(3));
        assert_eq!(shot_engine.counters().screenshots(), 1);
        assert_eq!(inline_engine.counters().screenshots(), 0);
    }

    #[tokio::test]
    async fn launch_and_navigation_errors_are_classified() {
        let engine = ScriptedEngine::new(Script::new(movie()).failing_launch());
        let err = RenderSession::open(&engine, 1, "http://movie", &fast_options())
            .await
            .unwrap_err();
        assert!(matches!(err, FramecastError::Launch { .. }));

        let engine = ScriptedEngine::new(Script::new(movie()).failing_navigation());
        let err = RenderSession::open(&engine, 1, "http://movie", &fast_options())
            .await
            .unwrap_err();
        assert!(matches!(err, FramecastError::Navigation { .. }));
        assert_eq!(engine.counters().closes(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_rendering() {
        let engine = ScriptedEngine::new(Script::new(movie()));
        let session = RenderSession::open(&engine, 1, "http://movie", &fast_options())
            .await
            .unwrap();

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert_eq!(engine.counters().closes(), 1);
        assert!(session.render_frame(0).await.is_err());
    }
}
