//! Contract of the external rendering engine.
//!
//! The session layer only talks to these traits; which engine sits behind
//! them (a driver process, an in-memory script in tests) is chosen by the
//! caller.

use serde::{Deserialize, Serialize};

use framecast_common::error::FramecastResult;

/// Options applied when an engine instance is launched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOptions {
    /// Device pixel ratio of the page viewport.
    pub device_scale_factor: f64,

    /// Render without the default white page background.
    pub transparent_background: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            device_scale_factor: 1.0,
            transparent_background: false,
        }
    }
}

/// Screen region to capture, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ClipRect {
    /// Rectangle anchored at the page origin.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f64,
            height: height as f64,
        }
    }
}

/// Factory for engine instances.
#[async_trait::async_trait]
pub trait RenderEngine: Send + Sync {
    /// Start a fresh instance.
    async fn launch(&self, options: &LaunchOptions) -> FramecastResult<Box<dyn EngineInstance>>;

    /// Engine name for logging.
    fn name(&self) -> &str;
}

/// One running engine instance with a single page.
///
/// Methods take `&self` so that `close` can be issued while another call is
/// still pending; implementations serialize their own I/O.
#[async_trait::async_trait]
pub trait EngineInstance: Send + Sync {
    /// Load `url` and wait for navigation to complete.
    async fn navigate(&self, url: &str) -> FramecastResult<()>;

    /// Evaluate a script expression in the page and return its JSON value.
    /// Promises are awaited by the engine.
    async fn evaluate(&self, expression: &str) -> FramecastResult<serde_json::Value>;

    /// Capture the given region as an encoded PNG.
    async fn screenshot(&self, clip: ClipRect) -> FramecastResult<Vec<u8>>;

    /// Release the instance. Must be safe to call more than once.
    async fn close(&self) -> FramecastResult<()>;
}
