//! Check for the external programs a render needs.

use framecast_common::config::{config_file_path, AppConfig};

use super::command_exists;

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("Framecast System Check");
    println!("{}", "=".repeat(50));

    let path = config_file_path();
    if path.exists() {
        println!("[OK] Config: {}", path.display());
    } else {
        println!("[--] Config: none (defaults in use, expected at {})", path.display());
    }

    let driver_ok = command_exists(&config.driver.program);
    if driver_ok {
        println!("[OK] Driver: {}", config.driver.program);
    } else {
        println!("[MISSING] Driver: {} not found on PATH", config.driver.program);
    }

    let encoder_ok = command_exists(&config.encoder.program);
    if encoder_ok {
        println!("[OK] Encoder: {}", config.encoder.program);
    } else {
        println!(
            "[WARN] Encoder: {} not found on PATH (only --png-dir output will work)",
            config.encoder.program
        );
    }

    println!();
    if driver_ok && encoder_ok {
        println!("All programs are available. Framecast is ready.");
    } else if driver_ok {
        println!("Rendering to PNG frames is available; install the encoder for video output.");
    } else {
        println!("The rendering driver is missing. Set `driver.program` in the config or pass --driver.");
    }

    Ok(())
}
