//! Framecast CLI: render animated web documents frame by frame.
//!
//! Usage:
//!   framecast render <URL> [OPTIONS]   Render a document to video and/or PNGs
//!   framecast info <URL>               Print the document's movie metadata
//!   framecast check                    Check for the encoder and driver programs

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use framecast_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "framecast",
    about = "Render animated web documents to video, frame by frame",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Driver overrides shared by every command that opens a session.
#[derive(clap::Args)]
struct DriverArgs {
    /// Rendering-engine driver program
    #[arg(long)]
    driver: Option<String>,

    /// Argument passed to the driver (repeatable)
    #[arg(long = "driver-arg", allow_hyphen_values = true)]
    driver_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a document
    Render {
        /// Document URL
        url: String,

        /// Encode frames into this video file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write numbered PNG frames into this directory
        #[arg(long)]
        png_dir: Option<PathBuf>,

        /// Maximum number of parallel rendering sessions
        #[arg(short = 'j', long)]
        parallelism: Option<usize>,

        /// First frame to render
        #[arg(long)]
        start: Option<u64>,

        /// Frame to stop at (exclusive)
        #[arg(long)]
        end: Option<u64>,

        /// Render with a transparent background (ProRes 4444 output)
        #[arg(long)]
        transparent: bool,

        /// Device scale factor
        #[arg(long)]
        scale: Option<f64>,

        #[command(flatten)]
        driver: DriverArgs,
    },

    /// Show movie information for a document
    Info {
        /// Document URL
        url: String,

        #[command(flatten)]
        driver: DriverArgs,
    },

    /// Check for required external programs
    Check,
}

impl DriverArgs {
    fn apply(self, config: &mut AppConfig) {
        if let Some(program) = self.driver {
            config.driver.program = program;
        }
        if !self.driver_args.is_empty() {
            config.driver.args = self.driver_args;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load();

    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    framecast_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Render {
            url,
            output,
            png_dir,
            parallelism,
            start,
            end,
            transparent,
            scale,
            driver,
        } => {
            driver.apply(&mut config);
            commands::render::run(
                config,
                commands::render::RenderArgs {
                    url,
                    output,
                    png_dir,
                    parallelism,
                    start,
                    end,
                    transparent,
                    scale,
                },
            )
            .await?;
        }
        Commands::Info { url, driver } => {
            driver.apply(&mut config);
            commands::info::run(config, url).await?;
        }
        Commands::Check => {
            commands::check::run(&config)?;
        }
    }

    Ok(())
}
