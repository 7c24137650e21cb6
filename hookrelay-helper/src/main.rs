//! Hookrelay helper — entry point.
//!
//! ```text
//! hookrelay-helper                     Run in the foreground
//! hookrelay-helper --config <path>     Load a custom config TOML
//! hookrelay-helper --controller <addr> Override the controller address
//! hookrelay-helper --gen-config        Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hookrelay_helper::config::HelperConfig;
use hookrelay_helper::service::HelperService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "hookrelay-helper", about = "Hookrelay in-process helper")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "hookrelay-helper.toml")]
    config: PathBuf,

    /// Controller address, overriding the config file.
    #[arg(long)]
    controller: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HelperConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = HelperConfig::load(&cli.config);
    if let Some(controller) = cli.controller {
        config.network.controller = controller;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("hookrelay-helper v{}", env!("CARGO_PKG_VERSION"));
    info!("controller: {}", config.network.controller);
    info!("hooks: {}", config.hooks.len());
    info!(
        "host: {} threads at {} calls/s",
        config.host.threads, config.host.calls_per_second
    );

    let service = HelperService::new(config);
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
