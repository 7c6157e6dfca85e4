use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use pillbox_lib::config::Settings;
use pillbox_lib::serial::SerialInterface;

/// Serial synchronization engine for the pill dispenser
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Settings file (JSON); defaults apply when absent
    #[arg(short, long, env = "PILLBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port, overriding the settings file
    #[arg(short, long)]
    port: Option<String>,

    /// Start in real mode instead of simulation
    #[arg(long)]
    real: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => None,
    };
    let missing_file = loaded.is_none().then_some(cli.config.as_deref()).flatten();
    let mut settings = loaded.unwrap_or_default();
    if let Some(port) = cli.port {
        settings.port_name = port;
    }
    if cli.real {
        settings.start_in_simulation = false;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.as_str()),
    )
    .init();

    // Settings are read before the logger exists, so report the fallback here.
    if let Some(path) = missing_file {
        log::info!("No settings file at {}, using defaults", path.display());
    }

    if cli.list_ports {
        for port in SerialInterface::list_ports()? {
            match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => println!(
                    "{}  {:04x}:{:04x}  {}",
                    port.port_name,
                    vid,
                    pid,
                    port.product.unwrap_or_default()
                ),
                _ => println!("{}", port.port_name),
            }
        }
        return Ok(());
    }

    pillbox_lib::run(settings).await
}
