//! Hookrelay controller — entry point.
//!
//! ```text
//! hookrelay-controller                   Run in the foreground
//! hookrelay-controller --config <path>   Load a custom config TOML
//! hookrelay-controller --listen <addr>   Override the listen address
//! hookrelay-controller --json            Journal events as JSON lines
//! hookrelay-controller --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hookrelay_controller::config::{ControllerConfig, EventFormat};
use hookrelay_controller::service::ControllerService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "hookrelay-controller", about = "Hookrelay helper controller")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "hookrelay-controller.toml")]
    config: PathBuf,

    /// Listen address, overriding the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Write events to stdout as JSON lines.
    #[arg(long)]
    json: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ControllerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ControllerConfig::load(&cli.config);
    if let Some(listen) = cli.listen {
        config.network.listen = listen;
    }
    if cli.json {
        config.logging.events = EventFormat::Json;
    }

    // JSON lines own stdout; logs go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("hookrelay-controller v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}", config.network.listen);
    info!("events: {:?}", config.logging.events);

    let service = ControllerService::new(config);
    let stop = service.stop_handle();

    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
