//! Configuration for the controller.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hookrelay_core::{ChannelOptions, DispatcherOptions};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Listener and link settings.
    pub network: NetworkConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address helpers connect to.
    pub listen: String,
    /// How long a new connection has to introduce itself.
    pub hello_timeout_ms: u64,
    /// Deadline for calls into a helper.
    pub call_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub linger_ms: u64,
    /// Heartbeat interval; 0 disables heartbeats.
    pub heartbeat_ms: u64,
    /// Inbound silence before a helper is declared lost; 0 disables.
    pub idle_timeout_ms: u64,
}

/// How each delivery is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFormat {
    /// One tracing line per delivery.
    Text,
    /// One JSON object per line on stdout.
    Json,
    /// Only counted.
    Off,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    pub events: EventFormat,
    /// Seconds between session summaries; 0 disables them.
    pub stats_interval_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7411".into(),
            hello_timeout_ms: 5_000,
            call_timeout_ms: 5_000,
            send_timeout_ms: 250,
            linger_ms: 500,
            heartbeat_ms: 5_000,
            idle_timeout_ms: 15_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            events: EventFormat::Text,
            stats_interval_secs: 30,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

fn millis_or_off(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ControllerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn to_dispatcher_options(&self) -> DispatcherOptions {
        let net = &self.network;
        DispatcherOptions {
            hello_timeout: Duration::from_millis(net.hello_timeout_ms.max(1)),
            call_timeout: Duration::from_millis(net.call_timeout_ms.max(1)),
            channel: ChannelOptions {
                send_timeout: Duration::from_millis(net.send_timeout_ms),
                linger: Duration::from_millis(net.linger_ms),
                heartbeat: millis_or_off(net.heartbeat_ms),
                idle_timeout: millis_or_off(net.idle_timeout_ms),
                ..ChannelOptions::default()
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ControllerConfig::default()).unwrap();
        assert!(text.contains("listen"));
        assert!(text.contains("events = \"text\""));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = ControllerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ControllerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn dispatcher_options_follow_config() {
        let mut cfg = ControllerConfig::default();
        cfg.network.hello_timeout_ms = 0;
        cfg.network.idle_timeout_ms = 0;
        cfg.network.call_timeout_ms = 750;
        let opts = cfg.to_dispatcher_options();
        assert_eq!(opts.hello_timeout, Duration::from_millis(1));
        assert_eq!(opts.call_timeout, Duration::from_millis(750));
        assert_eq!(opts.channel.idle_timeout, None);
        assert_eq!(opts.channel.heartbeat, Some(Duration::from_secs(5)));
    }
}
