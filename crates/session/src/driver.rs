//! Engine backed by an external driver process.
//!
//! The driver (typically a small headless-browser bridge) reads one JSON
//! request per line on stdin and answers with one JSON response per line on
//! stdout:
//!
//! ```text
//! → {"id":3,"method":"evaluate","params":{"expression":"..."}}
//! ← {"id":3,"result":{...}}
//! ← {"id":4,"error":"message"}
//! ```
//!
//! Lines on stdout that are not responses are ignored; stderr is forwarded
//! to the log.

use std::process::Stdio;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use framecast_common::config::DriverConfig;
use framecast_common::error::{FramecastError, FramecastResult};

use crate::engine::{ClipRect, EngineInstance, LaunchOptions, RenderEngine};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Launches one driver process per engine instance.
#[derive(Debug, Clone)]
pub struct DriverEngine {
    config: DriverConfig,
}

impl DriverEngine {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn program(&self) -> &str {
        &self.config.program
    }
}

#[async_trait::async_trait]
impl RenderEngine for DriverEngine {
    async fn launch(&self, options: &LaunchOptions) -> FramecastResult<Box<dyn EngineInstance>> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            FramecastError::launch(format!(
                "Failed to start driver '{}': {e}",
                self.config.program
            ))
        })?;
        let pid = child.id().unwrap_or_default();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FramecastError::launch("Failed to capture driver stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FramecastError::launch("Failed to capture driver stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            // Drain stderr so the driver never blocks on a full pipe.
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, "driver: {line}");
                }
            });
        }

        tracing::info!(pid, program = %self.config.program, "Driver process started");

        let instance = DriverInstance {
            pid,
            transparent_background: options.transparent_background,
            io: Mutex::new(DriverIo {
                stdin,
                stdout: BufReader::new(stdout),
                next_id: 1,
            }),
            child: Mutex::new(Some(child)),
        };

        if let Err(e) = instance.call(DriverRequest::Launch(*options)).await {
            instance.kill().await;
            return Err(FramecastError::launch(e.to_string()));
        }

        Ok(Box::new(instance))
    }

    fn name(&self) -> &str {
        "driver"
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
enum DriverRequest<'a> {
    Launch(LaunchOptions),
    Navigate {
        url: &'a str,
    },
    Evaluate {
        expression: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    Screenshot {
        clip: ClipRect,
        omit_background: bool,
    },
    Close,
}

#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: DriverRequest<'a>,
}

#[derive(Debug, Deserialize)]
struct DriverResponse {
    id: u64,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

fn encode_request(id: u64, request: DriverRequest<'_>) -> FramecastResult<String> {
    let mut line = serde_json::to_string(&RequestEnvelope { id, request })?;
    line.push('\n');
    Ok(line)
}

/// Parse a stdout line, returning `None` for anything that is not a response.
fn parse_response(line: &str) -> Option<DriverResponse> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

struct DriverIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

struct DriverInstance {
    pid: u32,
    transparent_background: bool,
    io: Mutex<DriverIo>,
    child: Mutex<Option<Child>>,
}

impl DriverInstance {
    async fn call(&self, request: DriverRequest<'_>) -> FramecastResult<Value> {
        let mut io = self.io.lock().await;
        let id = io.next_id;
        io.next_id += 1;

        let line = encode_request(id, request)?;
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| FramecastError::engine(format!("Failed writing to driver: {e}")))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| FramecastError::engine(format!("Failed writing to driver: {e}")))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let bytes = io
                .stdout
                .read_line(&mut buf)
                .await
                .map_err(|e| FramecastError::engine(format!("Failed reading from driver: {e}")))?;
            if bytes == 0 {
                return Err(FramecastError::engine(format!(
                    "driver process {} exited while handling request {id}",
                    self.pid
                )));
            }

            match parse_response(&buf) {
                Some(response) if response.id == id => {
                    return match response.error {
                        Some(message) => Err(FramecastError::engine(message)),
                        None => Ok(response.result),
                    };
                }
                Some(response) => {
                    tracing::debug!(pid = self.pid, expected = id, got = response.id, "Skipping stale driver response");
                }
                None => {
                    tracing::debug!(pid = self.pid, "driver stdout: {}", buf.trim_end());
                }
            }
        }
    }

    async fn kill(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            tracing::debug!(pid = self.pid, error = %e, "Driver already exited");
        }
        match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(pid = self.pid, %status, "Driver process exited"),
            Ok(Err(e)) => tracing::warn!(pid = self.pid, error = %e, "Failed to wait on driver"),
            Err(_) => tracing::warn!(pid = self.pid, "Driver did not exit after kill"),
        }
    }
}

#[async_trait::async_trait]
impl EngineInstance for DriverInstance {
    async fn navigate(&self, url: &str) -> FramecastResult<()> {
        self.call(DriverRequest::Navigate { url })
            .await
            .map(|_| ())
            .map_err(|e| FramecastError::navigation(url, e.to_string()))
    }

    async fn evaluate(&self, expression: &str) -> FramecastResult<Value> {
        self.call(DriverRequest::Evaluate { expression }).await
    }

    async fn screenshot(&self, clip: ClipRect) -> FramecastResult<Vec<u8>> {
        let result = self
            .call(DriverRequest::Screenshot {
                clip,
                omit_background: self.transparent_background,
            })
            .await?;
        let encoded = result
            .as_str()
            .ok_or_else(|| FramecastError::engine("driver screenshot result is not a string"))?;
        BASE64
            .decode(encoded)
            .map_err(|e| FramecastError::engine(format!("driver screenshot is not base64: {e}")))
    }

    async fn close(&self) -> FramecastResult<()> {
        if self.child.lock().await.is_none() {
            return Ok(());
        }
        // A request still in flight holds the I/O lock; skip the polite
        // close in that case and go straight to kill.
        if self.io.try_lock().is_ok() {
            let polite = tokio::time::timeout(CLOSE_GRACE, self.call(DriverRequest::Close)).await;
            if !matches!(polite, Ok(Ok(_))) {
                tracing::debug!(pid = self.pid, "Driver did not acknowledge close");
            }
        }
        self.kill().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_are_tagged_json_lines() {
        let line = encode_request(
            4,
            DriverRequest::Screenshot {
                clip: ClipRect::from_size(100, 50),
                omit_background: true,
            },
        )
        .unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 4);
        assert_eq!(value["method"], "screenshot");
        assert_eq!(value["params"]["omitBackground"], true);
        assert_eq!(value["params"]["clip"]["width"], 100.0);

        let launch: Value = serde_json::from_str(
            &encode_request(
                1,
                DriverRequest::Launch(LaunchOptions {
                    device_scale_factor: 2.0,
                    transparent_background: false,
                }),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(launch["method"], "launch");
        assert_eq!(launch["params"]["deviceScaleFactor"], 2.0);

        let close: Value =
            serde_json::from_str(&encode_request(9, DriverRequest::Close).unwrap()).unwrap();
        assert_eq!(close, json!({"id": 9, "method": "close"}));
    }

    #[test]
    fn response_parsing_ignores_noise() {
        assert!(parse_response("DevTools listening on ws://...").is_none());
        assert!(parse_response("{not json").is_none());

        let ok = parse_response("{\"id\":2,\"result\":[1,2]}\n").unwrap();
        assert_eq!(ok.id, 2);
        assert_eq!(ok.result, json!([1, 2]));
        assert!(ok.error.is_none());

        let err = parse_response("{\"id\":3,\"error\":\"boom\"}").unwrap();
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.result.is_null());
    }
}
