//! Movie metadata and rendered frames.

use serde::{Deserialize, Serialize};

use framecast_common::error::{FramecastError, FramecastResult};

/// Dimensions, framerate, and length of the document being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
}

impl MovieInfo {
    /// Reject metadata that cannot drive a render.
    pub fn validate(&self) -> FramecastResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FramecastError::engine(format!(
                "movie reports empty dimensions {}x{}",
                self.width, self.height
            )));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(FramecastError::engine(format!(
                "movie reports invalid fps {}",
                self.fps
            )));
        }
        Ok(())
    }

    /// Playback length in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.frame_count as f64 / self.fps
    }
}

/// One rendered frame. `bytes` is an encoded image (PNG unless the
/// document emits another format inline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: u64,
    pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_page_metadata() {
        let info: MovieInfo =
            serde_json::from_str(r#"{"width":1280,"height":720,"fps":30,"frameCount":90}"#)
                .unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.frame_count, 90);
        assert!((info.duration_secs() - 3.0).abs() < 1e-9);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn rejects_zero_size_and_bad_fps() {
        let mut info = MovieInfo {
            width: 0,
            height: 720,
            fps: 30.0,
            frame_count: 1,
        };
        assert!(info.validate().is_err());
        info.width = 10;
        info.fps = 0.0;
        assert!(info.validate().is_err());
        info.fps = f64::NAN;
        assert!(info.validate().is_err());
    }
}
