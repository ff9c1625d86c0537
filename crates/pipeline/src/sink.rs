//! Consumers of ordered frame bytes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use framecast_common::config::EncoderConfig;
use framecast_common::error::{FramecastError, FramecastResult};
use framecast_session::Frame;

/// Lines of encoder stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Receives frames in ascending index order.
#[async_trait::async_trait]
pub trait OutputSink: Send {
    /// Consume one frame.
    async fn write_frame(&mut self, frame: &Frame) -> FramecastResult<()>;

    /// Finish output after the last frame.
    async fn end(&mut self) -> FramecastResult<()>;

    /// Stop after a failed run. Output written so far is left in place.
    async fn abort(&mut self) {}

    /// Sink name for logging.
    fn name(&self) -> &str;
}

/// Parameters for a streaming encoder run.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub program: String,
    pub output_path: PathBuf,
    pub fps: f64,
    /// Keep the alpha channel (ProRes 4444 instead of H.264).
    pub alpha: bool,
    pub crf: u32,
    pub preset: String,
}

impl EncoderSettings {
    pub fn new(config: &EncoderConfig, output_path: impl Into<PathBuf>, fps: f64, alpha: bool) -> Self {
        Self {
            program: config.program.clone(),
            output_path: output_path.into(),
            fps,
            alpha,
            crf: config.crf,
            preset: config.preset.clone(),
        }
    }
}

/// Command-line arguments for the encoder: image stream on stdin, one of
/// two codec presets, output path last.
pub fn encoder_args(settings: &EncoderSettings) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-f".to_string(),
        "image2pipe".to_string(),
        "-framerate".to_string(),
        format_fps(settings.fps),
        "-i".to_string(),
        "-".to_string(),
    ];

    if settings.alpha {
        args.extend([
            "-c:v".to_string(),
            "prores_ks".to_string(),
            "-profile:v".to_string(),
            "4444".to_string(),
            "-pix_fmt".to_string(),
            "yuva444p10le".to_string(),
        ]);
    } else {
        args.extend([
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            settings.preset.clone(),
            "-crf".to_string(),
            settings.crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ]);
    }

    args.push(settings.output_path.to_string_lossy().into_owned());
    args
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{fps}")
    }
}

/// Streams frames into an external encoder process through its stdin.
pub struct StreamEncoderSink {
    label: String,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_task: Option<JoinHandle<VecDeque<String>>>,
    frames_written: u64,
    bytes_written: u64,
}

impl StreamEncoderSink {
    /// Start the encoder for `settings`, creating the output directory.
    pub async fn spawn(settings: &EncoderSettings) -> FramecastResult<Self> {
        if let Some(parent) = settings.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| FramecastError::filesystem(parent, e))?;
            }
        }
        let args = encoder_args(settings);
        tracing::debug!(?args, "Encoder arguments");
        Self::spawn_command(&settings.program, &args)
    }

    /// Start an arbitrary encoder command that reads frames on stdin.
    pub fn spawn_command<S: AsRef<str>>(program: &str, args: &[S]) -> FramecastResult<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| FramecastError::encoder(format!("Failed to start {program}: {e}")))?;
        let pid = child.id().unwrap_or_default();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FramecastError::encoder("Failed to capture encoder stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FramecastError::encoder("Failed to capture encoder stderr"))?;

        // Drain stderr concurrently so the encoder never blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(pid, "encoder: {line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        tracing::info!(pid, program, "Encoder process started");

        Ok(Self {
            label: format!("encoder:{program}"),
            pid,
            child,
            stdin: Some(stdin),
            stderr_task: Some(stderr_task),
            frames_written: 0,
            bytes_written: 0,
        })
    }

    async fn stderr_tail(&mut self) -> String {
        match self.stderr_task.take() {
            Some(task) => task
                .await
                .map(|lines| Vec::from(lines).join("\n"))
                .unwrap_or_else(|_| "<failed to join encoder stderr reader>".to_string()),
            None => String::new(),
        }
    }
}

#[async_trait::async_trait]
impl OutputSink for StreamEncoderSink {
    async fn write_frame(&mut self, frame: &Frame) -> FramecastResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| FramecastError::encoder("encoder input already closed"))?;
        stdin.write_all(&frame.bytes).await.map_err(|e| {
            FramecastError::encoder(format!(
                "Failed writing frame {} to encoder: {e}",
                frame.index
            ))
        })?;
        self.frames_written += 1;
        self.bytes_written += frame.bytes.len() as u64;
        Ok(())
    }

    async fn end(&mut self) -> FramecastResult<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .shutdown()
                .await
                .map_err(|e| FramecastError::encoder(format!("Failed to close encoder input: {e}")))?;
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| FramecastError::encoder(format!("Failed to wait on encoder: {e}")))?;
        let stderr_tail = self.stderr_tail().await;

        if !status.success() {
            return Err(FramecastError::encoder(format!(
                "encoder exited with {status}: {}",
                stderr_tail.trim()
            )));
        }

        tracing::info!(
            pid = self.pid,
            frames = self.frames_written,
            bytes = self.bytes_written,
            "Encoder finished"
        );
        Ok(())
    }

    async fn abort(&mut self) {
        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(pid = self.pid, error = %e, "Encoder already exited");
        }
        if let Err(e) = self.child.wait().await {
            tracing::warn!(pid = self.pid, error = %e, "Failed to wait on aborted encoder");
        }
        let tail = self.stderr_tail().await;
        tracing::warn!(
            pid = self.pid,
            frames = self.frames_written,
            stderr = %tail.trim(),
            "Encoder aborted; partial output left in place"
        );
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Writes every frame to its own numbered file.
///
/// File names carry the frame index, so delivery order does not matter
/// for this sink.
#[derive(Debug)]
pub struct FileSequenceSink {
    dir: PathBuf,
    frames_written: u64,
}

/// File name for frame `index`.
pub fn frame_file_name(index: u64) -> String {
    format!("frame-{index:06}.png")
}

impl FileSequenceSink {
    /// Create `dir` (and parents) if needed.
    pub async fn create(dir: impl Into<PathBuf>) -> FramecastResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FramecastError::filesystem(&dir, e))?;
        tracing::info!(dir = %dir.display(), "Writing frame sequence");
        Ok(Self {
            dir,
            frames_written: 0,
        })
    }

    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(frame_file_name(index))
    }
}

#[async_trait::async_trait]
impl OutputSink for FileSequenceSink {
    async fn write_frame(&mut self, frame: &Frame) -> FramecastResult<()> {
        let path = self.frame_path(frame.index);
        tokio::fs::write(&path, &frame.bytes)
            .await
            .map_err(|e| FramecastError::filesystem(&path, e))?;
        self.frames_written += 1;
        Ok(())
    }

    async fn end(&mut self) -> FramecastResult<()> {
        tracing::info!(
            dir = %self.dir.display(),
            frames = self.frames_written,
            "Frame sequence complete"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "png-sequence"
    }
}
