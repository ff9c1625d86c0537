//! In-memory engine that simulates a cooperative document.
//!
//! Frames render after a scripted latency and produce the bytes
//! `frame-<index>`, either inline or through a screenshot. Counters record
//! every engine call so tests can assert on spawn, poll and close behavior.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;

use framecast_common::error::{FramecastError, FramecastResult};

use crate::engine::{ClipRect, EngineInstance, LaunchOptions, RenderEngine};
use crate::movie::MovieInfo;
use crate::page::{parse_seek_expression, FALLBACK_PROBE, READY_PROBE};

/// Behavior of every instance launched by a [`ScriptedEngine`].
#[derive(Debug, Clone)]
pub struct Script {
    info: MovieInfo,
    ready_after: Option<u64>,
    fallback: Value,
    latencies: Vec<Duration>,
    default_latency: Duration,
    failing_frames: HashSet<u64>,
    inline_frames: bool,
    /// Successful launches allowed before every further launch fails.
    launch_budget: Option<usize>,
    fail_navigation: bool,
}

impl Script {
    /// A document that is ready on the first probe and renders instantly.
    pub fn new(info: MovieInfo) -> Self {
        Self {
            info,
            ready_after: Some(0),
            fallback: Value::Null,
            latencies: Vec::new(),
            default_latency: Duration::ZERO,
            failing_frames: HashSet::new(),
            inline_frames: false,
            launch_budget: None,
            fail_navigation: false,
        }
    }

    /// Answer this many ready probes with null first.
    pub fn ready_after(mut self, probes: u64) -> Self {
        self.ready_after = Some(probes);
        self
    }

    /// Never report ready; answer the fallback probe with `measurement`.
    pub fn never_ready(mut self, measurement: Value) -> Self {
        self.ready_after = None;
        self.fallback = measurement;
        self
    }

    /// Per-frame render latency, indexed by frame number.
    pub fn with_latencies(mut self, latencies: Vec<Duration>) -> Self {
        self.latencies = latencies;
        self
    }

    /// Latency for frames not covered by [`Script::with_latencies`].
    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Fail the seek of `frame` after its latency elapses.
    pub fn failing_on(mut self, frame: u64) -> Self {
        self.failing_frames.insert(frame);
        self
    }

    /// Emit frames as data URLs instead of requiring screenshots.
    pub fn inline_frames(mut self) -> Self {
        self.inline_frames = true;
        self
    }

    pub fn failing_launch(mut self) -> Self {
        self.launch_budget = Some(0);
        self
    }

    /// Let the first `launches` succeed and fail every later one.
    pub fn failing_launch_after(mut self, launches: usize) -> Self {
        self.launch_budget = Some(launches);
        self
    }

    pub fn failing_navigation(mut self) -> Self {
        self.fail_navigation = true;
        self
    }

    fn latency(&self, frame: u64) -> Duration {
        usize::try_from(frame)
            .ok()
            .and_then(|i| self.latencies.get(i).copied())
            .unwrap_or(self.default_latency)
    }
}

/// Call counters shared by an engine and all of its instances.
#[derive(Debug, Default)]
pub struct EngineCounters {
    launch_attempts: AtomicUsize,
    launches: AtomicUsize,
    closes: AtomicUsize,
    ready_probes: AtomicUsize,
    fallback_probes: AtomicUsize,
    screenshots: AtomicUsize,
    active_renders: AtomicUsize,
    peak_renders: AtomicUsize,
    finished: Mutex<Vec<u64>>,
}

impl EngineCounters {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Instances closed (repeat closes of one instance count once).
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn ready_probes(&self) -> usize {
        self.ready_probes.load(Ordering::SeqCst)
    }

    pub fn fallback_probes(&self) -> usize {
        self.fallback_probes.load(Ordering::SeqCst)
    }

    pub fn screenshots(&self) -> usize {
        self.screenshots.load(Ordering::SeqCst)
    }

    /// Highest number of seeks in progress at once across all instances.
    pub fn peak_renders(&self) -> usize {
        self.peak_renders.load(Ordering::SeqCst)
    }

    /// Frames whose seek ran to completion (successfully or not), in
    /// completion order.
    pub fn finished_frames(&self) -> Vec<u64> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Engine whose instances follow a [`Script`].
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    script: Arc<Script>,
    counters: Arc<EngineCounters>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            counters: Arc::new(EngineCounters::default()),
        }
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// Bytes every instance produces for `index`.
    pub fn frame_bytes(index: u64) -> Vec<u8> {
        format!("frame-{index}").into_bytes()
    }
}

#[async_trait::async_trait]
impl RenderEngine for ScriptedEngine {
    async fn launch(&self, _options: &LaunchOptions) -> FramecastResult<Box<dyn EngineInstance>> {
        let attempt = self.counters.launch_attempts.fetch_add(1, Ordering::SeqCst);
        if self.script.launch_budget.is_some_and(|budget| attempt >= budget) {
            return Err(FramecastError::launch("scripted launch failure"));
        }
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedInstance {
            script: self.script.clone(),
            counters: self.counters.clone(),
            state: Mutex::new(InstanceState::default()),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[derive(Debug, Default)]
struct InstanceState {
    ready_probes: u64,
    current_frame: Option<u64>,
    closed: bool,
}

struct ScriptedInstance {
    script: Arc<Script>,
    counters: Arc<EngineCounters>,
    state: Mutex<InstanceState>,
}

impl ScriptedInstance {
    fn state(&self) -> std::sync::MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> FramecastResult<()> {
        if self.state().closed {
            return Err(FramecastError::engine("scripted instance is closed"));
        }
        Ok(())
    }

    fn probe_ready(&self) -> FramecastResult<Value> {
        self.counters.ready_probes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let answered = state.ready_probes;
        state.ready_probes += 1;
        match self.script.ready_after {
            Some(after) if answered >= after => Ok(serde_json::to_value(self.script.info)?),
            _ => Ok(Value::Null),
        }
    }

    async fn seek(&self, frame: u64) -> FramecastResult<Value> {
        let active = self.counters.active_renders.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_renders.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.script.latency(frame)).await;

        self.counters.active_renders.fetch_sub(1, Ordering::SeqCst);
        self.counters
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);

        if self.script.failing_frames.contains(&frame) {
            return Err(FramecastError::engine(format!(
                "scripted failure on frame {frame}"
            )));
        }

        self.state().current_frame = Some(frame);
        if self.script.inline_frames {
            let encoded = BASE64.encode(ScriptedEngine::frame_bytes(frame));
            Ok(Value::String(format!("data:image/png;base64,{encoded}")))
        } else {
            Ok(Value::Null)
        }
    }
}

#[async_trait::async_trait]
impl EngineInstance for ScriptedInstance {
    async fn navigate(&self, url: &str) -> FramecastResult<()> {
        self.ensure_open()?;
        if self.script.fail_navigation {
            return Err(FramecastError::navigation(url, "scripted navigation failure"));
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> FramecastResult<Value> {
        self.ensure_open()?;
        if expression == READY_PROBE {
            return self.probe_ready();
        }
        if expression == FALLBACK_PROBE {
            self.counters.fallback_probes.fetch_add(1, Ordering::SeqCst);
            return Ok(self.script.fallback.clone());
        }
        if let Some(frame) = parse_seek_expression(expression) {
            return self.seek(frame).await;
        }
        Err(FramecastError::engine(format!(
            "scripted page cannot evaluate '{expression}'"
        )))
    }

    async fn screenshot(&self, _clip: ClipRect) -> FramecastResult<Vec<u8>> {
        self.ensure_open()?;
        self.counters.screenshots.fetch_add(1, Ordering::SeqCst);
        let frame = self
            .state()
            .current_frame
            .ok_or_else(|| FramecastError::engine("screenshot before any seek"))?;
        Ok(ScriptedEngine::frame_bytes(frame))
    }

    async fn close(&self) -> FramecastResult<()> {
        let mut state = self.state();
        if !state.closed {
            state.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
