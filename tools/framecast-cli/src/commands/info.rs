//! Print a document's movie metadata.

use framecast_common::config::AppConfig;
use framecast_session::{DriverEngine, LaunchOptions, RenderSession, SessionOptions};

pub async fn run(config: AppConfig, url: String) -> anyhow::Result<()> {
    let engine = DriverEngine::new(config.driver.clone());
    let options = SessionOptions {
        launch: LaunchOptions {
            device_scale_factor: config.render.device_scale_factor,
            transparent_background: config.render.transparent_background,
        },
        readiness: config.render.readiness,
    };

    let session = RenderSession::open(&engine, 0, &url, &options)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open {url}: {e}"))?;
    let info = session.info().await;
    session.close().await;
    let info = info?;

    println!("{}", serde_json::to_string_pretty(&info)?);
    println!(
        "  {} frames at {} fps ({:.2}s)",
        info.frame_count,
        info.fps,
        info.duration_secs()
    );
    Ok(())
}
