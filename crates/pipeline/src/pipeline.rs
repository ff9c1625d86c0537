//! Render run orchestration.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;

use framecast_common::cancel::CancelSignal;
use framecast_common::config::RenderConfig;
use framecast_common::error::{FramecastError, FramecastResult};
use framecast_pool::{PoolConfig, PoolStats, SessionPool};
use framecast_session::{Frame, LaunchOptions, MovieInfo, RenderEngine, SessionOptions};

use crate::sink::{EncoderSettings, FileSequenceSink, OutputSink, StreamEncoderSink};

/// Progress callback for render runs.
pub type ProgressCallback = Box<dyn Fn(RenderProgress) + Send + Sync>;

/// Render progress report.
#[derive(Debug, Clone)]
pub struct RenderProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Frames delivered to the sinks so far.
    pub frames_rendered: u64,

    /// Frames in the requested range.
    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,

    /// Current stage.
    pub stage: RenderStage,
}

/// Stages of a render run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RenderStage {
    Preparing,
    Rendering,
    Finalizing,
    Complete,
    Failed,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RenderSummary {
    pub info: MovieInfo,
    pub start_frame: u64,
    pub end_frame: u64,
    pub frames_delivered: u64,
    pub elapsed_secs: f64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub pool: PoolStats,
}

/// Resolve the frames to render from the movie length and optional
/// overrides. An end beyond the movie is clamped to its last frame.
pub fn frame_range(
    info: &MovieInfo,
    start: Option<u64>,
    end: Option<u64>,
) -> FramecastResult<Range<u64>> {
    let mut end = end.unwrap_or(info.frame_count);
    if end > info.frame_count {
        tracing::warn!(
            requested = end,
            frame_count = info.frame_count,
            "End frame beyond movie length; clamping"
        );
        end = info.frame_count;
    }
    let start = start.unwrap_or(0);
    if start > end {
        return Err(FramecastError::config(format!(
            "start frame {start} is past the end of the range ({end})"
        )));
    }
    Ok(start..end)
}

/// Drives one render run: metadata, frame dispatch, ordered delivery.
///
/// Frame tasks are spawned up to `queue_depth` ahead of the next frame to
/// deliver; the pool bounds how many of them render at once. Frames reach
/// the sinks strictly in ascending index order.
pub struct RenderPipeline {
    config: RenderConfig,
    engine: Arc<dyn RenderEngine>,
    sinks: Vec<Box<dyn OutputSink>>,
    progress: Option<ProgressCallback>,
}

impl RenderPipeline {
    pub fn new(config: RenderConfig, engine: Arc<dyn RenderEngine>) -> Self {
        Self {
            config,
            engine,
            sinks: Vec::new(),
            progress: None,
        }
    }

    /// Deliver frames to `sink` in addition to the configured outputs.
    pub fn with_sink(mut self, sink: Box<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Execute the run.
    ///
    /// On the first frame failure the run stops dispatching, waits for frames
    /// already rendering, aborts the sinks and returns that failure.
    pub async fn run(mut self) -> FramecastResult<RenderSummary> {
        self.config.validate()?;
        let started = Instant::now();
        let started_at = chrono::Utc::now();

        tracing::info!(
            url = %self.config.url,
            parallelism = self.config.parallelism,
            queue_depth = self.config.queue_depth,
            engine = self.engine.name(),
            "Starting render"
        );
        self.report(0, 0, started, RenderStage::Preparing);

        let pool = SessionPool::new(
            self.engine.clone(),
            PoolConfig {
                url: self.config.url.clone(),
                max: self.config.parallelism,
                session: SessionOptions {
                    launch: LaunchOptions {
                        device_scale_factor: self.config.device_scale_factor,
                        transparent_background: self.config.transparent_background,
                    },
                    readiness: self.config.readiness,
                },
            },
        )?;

        let prepared = self.prepare(&pool).await;
        let (info, range) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                pool.shutdown().await;
                self.report(0, 0, started, RenderStage::Failed);
                return Err(e);
            }
        };
        let total = range.end - range.start;

        tracing::info!(
            start = range.start,
            end = range.end,
            fps = info.fps,
            sinks = self.sinks.len(),
            "Rendering frames"
        );

        let cancel = CancelSignal::new();
        let mut in_flight = VecDeque::new();
        let delivered = self
            .deliver_frames(&pool, &cancel, range.clone(), &mut in_flight, started)
            .await;

        let frames_delivered = match delivered {
            Ok(count) => count,
            Err(e) => {
                cancel.cancel();
                let e = originating_error(e, drain(in_flight).await);
                for sink in &mut self.sinks {
                    sink.abort().await;
                }
                pool.shutdown().await;
                tracing::error!(error = %e, "Render failed");
                self.report(0, total, started, RenderStage::Failed);
                return Err(e);
            }
        };

        self.report(frames_delivered, total, started, RenderStage::Finalizing);
        let mut end_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.end().await {
                tracing::error!(sink = sink.name(), error = %e, "Failed to finish output");
                end_error.get_or_insert(e);
            }
        }
        pool.shutdown().await;
        if let Some(e) = end_error {
            self.report(frames_delivered, total, started, RenderStage::Failed);
            return Err(e);
        }

        let summary = RenderSummary {
            info,
            start_frame: range.start,
            end_frame: range.end,
            frames_delivered,
            elapsed_secs: started.elapsed().as_secs_f64(),
            started_at,
            pool: pool.stats(),
        };
        tracing::info!(
            frames = summary.frames_delivered,
            elapsed_secs = summary.elapsed_secs,
            sessions = summary.pool.spawned,
            peak_busy = summary.pool.peak_busy,
            "Render finished"
        );
        self.report(frames_delivered, total, started, RenderStage::Complete);
        Ok(summary)
    }

    /// Read movie metadata through one session, resolve the range and open
    /// the configured outputs.
    async fn prepare(&mut self, pool: &SessionPool) -> FramecastResult<(MovieInfo, Range<u64>)> {
        let info = pool
            .submit("movie info", |session| async move { session.info().await })
            .await?;
        let range = frame_range(&info, self.config.start_frame, self.config.end_frame)?;

        if let Some(path) = &self.config.output_video_path {
            let settings = EncoderSettings::new(
                &self.config.encoder,
                path.clone(),
                info.fps,
                self.config.transparent_background,
            );
            self.sinks
                .push(Box::new(StreamEncoderSink::spawn(&settings).await?));
        }
        if let Some(dir) = &self.config.png_output_dir {
            self.sinks
                .push(Box::new(FileSequenceSink::create(dir.clone()).await?));
        }
        if self.sinks.is_empty() {
            return Err(FramecastError::config(
                "no output configured (set a video path or a PNG directory)",
            ));
        }
        Ok((info, range))
    }

    async fn deliver_frames(
        &mut self,
        pool: &SessionPool,
        cancel: &CancelSignal,
        range: Range<u64>,
        in_flight: &mut VecDeque<(u64, JoinHandle<FramecastResult<Frame>>)>,
        started: Instant,
    ) -> FramecastResult<u64> {
        let total = range.end - range.start;
        let mut next = range.start;
        let mut delivered = 0u64;

        loop {
            while in_flight.len() < self.config.queue_depth && next < range.end {
                in_flight.push_back((next, spawn_frame(pool, cancel, next)));
                next += 1;
            }

            let Some((index, handle)) = in_flight.pop_front() else {
                break;
            };
            let frame = handle.await.map_err(|e| {
                FramecastError::engine(format!("render task for frame {index} panicked: {e}"))
            })??;

            for sink in &mut self.sinks {
                sink.write_frame(&frame).await?;
            }
            delivered += 1;
            tracing::debug!(frame = index, delivered, "Frame delivered");
            self.report(delivered, total, started, RenderStage::Rendering);
        }

        Ok(delivered)
    }

    fn report(&self, frames_rendered: u64, total_frames: u64, started: Instant, stage: RenderStage) {
        if let Some(cb) = &self.progress {
            cb(progress_report(
                frames_rendered,
                total_frames,
                started.elapsed().as_secs_f64(),
                stage,
            ));
        }
    }
}

/// Submit one frame to the pool on its own task.
///
/// The pool sets the run's cancel signal when this frame's session fails to
/// open or its render fails, before the slot is freed, so no queued frame
/// is dispatched after it.
fn spawn_frame(
    pool: &SessionPool,
    cancel: &CancelSignal,
    index: u64,
) -> JoinHandle<FramecastResult<Frame>> {
    let pool = pool.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let description = format!("frame {index}");
        let result = pool
            .submit_cancellable(&description, &cancel, move |session| async move {
                session.render_frame(index).await
            })
            .await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                cancel.cancel();
            }
        }
        result
    })
}

/// Wait for frames still in flight after a failure. Returns the first
/// failure other than cancellation, in frame order.
async fn drain(
    in_flight: VecDeque<(u64, JoinHandle<FramecastResult<Frame>>)>,
) -> Option<FramecastError> {
    let mut first = None;
    for (index, handle) in in_flight {
        match handle.await {
            Ok(Ok(_)) => tracing::debug!(frame = index, "Frame finished after run failure"),
            Ok(Err(e)) if e.is_cancelled() => {
                tracing::debug!(frame = index, "Frame not dispatched")
            }
            Ok(Err(e)) => {
                tracing::debug!(frame = index, error = %e, "Frame also failed");
                first.get_or_insert(e);
            }
            Err(e) => tracing::warn!(frame = index, error = %e, "Frame task panicked"),
        }
    }
    first
}

/// A frame refused by the cancel signal is not the cause of a failed run;
/// prefer a real failure found while draining.
fn originating_error(delivered: FramecastError, drained: Option<FramecastError>) -> FramecastError {
    match drained {
        Some(cause) if delivered.is_cancelled() => cause,
        _ => delivered,
    }
}

fn progress_report(
    frames_rendered: u64,
    total_frames: u64,
    elapsed_secs: f64,
    stage: RenderStage,
) -> RenderProgress {
    let progress = if total_frames == 0 {
        if stage == RenderStage::Complete {
            1.0
        } else {
            0.0
        }
    } else {
        (frames_rendered as f64 / total_frames as f64).clamp(0.0, 1.0)
    };

    let eta_secs = if progress > 0.0 {
        (elapsed_secs / progress) - elapsed_secs
    } else {
        0.0
    }
    .max(0.0);

    RenderProgress {
        progress,
        frames_rendered,
        total_frames,
        eta_secs,
        stage,
    }
}
