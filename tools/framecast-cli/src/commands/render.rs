//! Render a document to video and/or a PNG sequence.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use framecast_common::config::{AppConfig, RenderConfig};
use framecast_pipeline::{RenderPipeline, RenderProgress, RenderStage};
use framecast_session::DriverEngine;

/// Command-line overrides for one run.
pub struct RenderArgs {
    pub url: String,
    pub output: Option<PathBuf>,
    pub png_dir: Option<PathBuf>,
    pub parallelism: Option<usize>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub transparent: bool,
    pub scale: Option<f64>,
}

fn render_config(app: &AppConfig, args: RenderArgs) -> RenderConfig {
    let mut config = RenderConfig::new(args.url, app);
    config.output_video_path = args.output;
    config.png_output_dir = args.png_dir;
    if let Some(parallelism) = args.parallelism {
        config.parallelism = parallelism;
        config.queue_depth = parallelism.saturating_mul(2);
    }
    config.start_frame = args.start;
    config.end_frame = args.end;
    config.transparent_background |= args.transparent;
    if let Some(scale) = args.scale {
        config.device_scale_factor = scale;
    }
    config
}

pub async fn run(app: AppConfig, args: RenderArgs) -> anyhow::Result<()> {
    let config = render_config(&app, args);
    if config.output_video_path.is_none() && config.png_output_dir.is_none() {
        anyhow::bail!("Nothing to do: pass --output and/or --png-dir");
    }

    println!("Rendering: {}", config.url);
    if let Some(path) = &config.output_video_path {
        println!("  Video: {}", path.display());
    }
    if let Some(dir) = &config.png_output_dir {
        println!("  Frames: {}", dir.display());
    }
    println!("  Sessions: {}", config.parallelism);

    let engine = Arc::new(DriverEngine::new(app.driver.clone()));
    let progress_cb = Box::new(|p: RenderProgress| {
        if p.stage == RenderStage::Rendering {
            print!(
                "\r  Progress: {:.1}% ({}/{} frames, ETA: {:.0}s)  ",
                p.progress * 100.0,
                p.frames_rendered,
                p.total_frames,
                p.eta_secs,
            );
            std::io::stdout().flush().ok();
        }
    });

    let summary = RenderPipeline::new(config, engine)
        .on_progress(progress_cb)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("\nRender failed: {e}"))?;

    println!(
        "\nRender complete: {} frames ({}..{}) in {:.1}s using {} sessions",
        summary.frames_delivered,
        summary.start_frame,
        summary.end_frame,
        summary.elapsed_secs,
        summary.pool.spawned,
    );
    tracing::debug!(summary = %serde_json::to_string(&summary)?, "Render summary");
    Ok(())
}
