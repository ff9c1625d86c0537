//! In-page protocol between a session and the rendered document.
//!
//! A document opts in by exposing `window.__framecast` with:
//! - `ready`: becomes true once metadata is final
//! - `info()`: returns `{width, height, fps, frameCount}`
//! - `seek(i)`: draws frame `i`; may return a `data:image/...;base64,` URL
//!   when the document encodes the frame itself

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::Value;

use framecast_common::error::{FramecastError, FramecastResult};

use crate::movie::MovieInfo;

/// Returns the movie metadata once the document reports ready, else null.
pub const READY_PROBE: &str = "(() => { const m = window.__framecast; \
return m && m.ready ? m.info() : null; })()";

/// Measures the stage element when the document never reports ready.
pub const FALLBACK_PROBE: &str = "(() => { const m = window.__framecast || {}; \
const el = document.querySelector('[data-framecast-stage]') || document.body; \
const r = el.getBoundingClientRect(); \
return { width: Math.round(r.width), height: Math.round(r.height), \
fps: m.fps ?? null, frameCount: m.frameCount ?? null }; })()";

const SEEK_PREFIX: &str = "window.__framecast.seek(";

/// Expression that moves the document to frame `index`.
pub fn seek_expression(index: u64) -> String {
    format!("{SEEK_PREFIX}{index})")
}

/// Inverse of [`seek_expression`], for engines that simulate a page.
pub fn parse_seek_expression(expression: &str) -> Option<u64> {
    expression
        .strip_prefix(SEEK_PREFIX)?
        .strip_suffix(')')?
        .parse()
        .ok()
}

/// Result of a ready probe.
pub fn parse_ready_probe(value: Value) -> FramecastResult<Option<MovieInfo>> {
    if value.is_null() {
        return Ok(None);
    }
    let info: MovieInfo = serde_json::from_value(value)?;
    Ok(Some(info))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FallbackMeasurement {
    width: Option<f64>,
    height: Option<f64>,
    fps: Option<f64>,
    frame_count: Option<u64>,
}

/// Result of a fallback probe.
///
/// The fallback is accepted only when it yields non-empty dimensions, a
/// positive fps and a frame count; anything less is a timeout.
pub fn parse_fallback_probe(value: Value) -> FramecastResult<MovieInfo> {
    let measured: FallbackMeasurement = serde_json::from_value(value).map_err(|e| {
        FramecastError::timeout(format!("fallback measurement unreadable: {e}"))
    })?;

    let width = measured.width.unwrap_or(0.0);
    let height = measured.height.unwrap_or(0.0);
    if !(width >= 1.0 && height >= 1.0) {
        return Err(FramecastError::timeout(format!(
            "document never reported ready and the stage measures {width}x{height}"
        )));
    }
    let fps = measured.fps.filter(|f| f.is_finite() && *f > 0.0).ok_or_else(|| {
        FramecastError::timeout("document never reported ready and exposes no fps")
    })?;
    let frame_count = measured.frame_count.ok_or_else(|| {
        FramecastError::timeout("document never reported ready and exposes no frame count")
    })?;

    Ok(MovieInfo {
        width: width.round() as u32,
        height: height.round() as u32,
        fps,
        frame_count,
    })
}

/// What the document produced after a seek.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// The document encoded the frame itself.
    InlineImage(Vec<u8>),
    /// Nothing emitted; the session must take a screenshot.
    ScreenshotRequired,
}

impl Capture {
    /// Interpret the value returned by a seek.
    pub fn from_seek_result(value: Value) -> FramecastResult<Self> {
        match value {
            Value::String(url) => decode_data_url(&url).map(Self::InlineImage),
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(Self::ScreenshotRequired),
            other => Err(FramecastError::engine(format!(
                "unexpected seek result: {other}"
            ))),
        }
    }
}

fn decode_data_url(url: &str) -> FramecastResult<Vec<u8>> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| FramecastError::engine("inline frame is not a data URL"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| FramecastError::engine("inline frame data URL has no payload"))?;
    if !meta.ends_with(";base64") {
        return Err(FramecastError::engine(format!(
            "inline frame must be base64 encoded, got '{meta}'"
        )));
    }
    BASE64
        .decode(payload.trim())
        .map_err(|e| FramecastError::engine(format!("inline frame is not valid base64: {e}")))
}
