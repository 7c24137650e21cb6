//! Configuration for the helper.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hookrelay_core::{
    ChannelOptions, ClassPolicy, Endpoint, HelperOptions, HookSpec, LimiterConfig,
    OverflowPolicy, PriorityClass, ProcessIdentity, RelayError, Symbol,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Controller link settings.
    pub network: NetworkConfig,
    /// Event rate limiting.
    pub limiter: LimiterSection,
    /// Simulated host workload.
    pub host: HostConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// APIs to hook.
    pub hooks: Vec<HookConfig>,
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Controller address as `host:port`.
    pub controller: String,
    pub connect_timeout_ms: u64,
    /// Backpressure wait before a send counts as a transient failure.
    pub send_timeout_ms: u64,
    /// How long closing waits for queued frames.
    pub linger_ms: u64,
    /// Heartbeat interval; 0 disables heartbeats.
    pub heartbeat_ms: u64,
    /// Inbound silence before the link is declared broken; 0 disables.
    pub idle_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Upper bound on detaching from the host.
    pub detach_timeout_ms: u64,
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSection {
    pub window_ms: u64,
    /// Capacity of the host-thread submission queue.
    pub submit_capacity: usize,
    /// Attempts per event under transport backpressure.
    pub send_retries: u32,
    pub critical: ClassSection,
    pub focus: ClassSection,
    pub normal: ClassSection,
    pub background: ClassSection,
}

/// Budget and overflow policy of one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSection {
    /// Events admitted per window.
    pub budget: u32,
    /// "drop", "coalesce" or "queue".
    pub overflow: OverflowPolicy,
    pub max_queued: usize,
}

/// Simulated host workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Threads calling host APIs.
    pub threads: usize,
    /// Calls per second, per thread.
    pub calls_per_second: u32,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Seconds between limiter statistics lines; 0 disables them.
    pub stats_interval_secs: u64,
}

/// One hooked API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    pub symbol: String,
    pub priority: PriorityClass,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            limiter: LimiterSection::default(),
            host: HostConfig::default(),
            logging: LoggingConfig::default(),
            hooks: vec![
                HookConfig::new("user32!GetForegroundWindow", PriorityClass::Critical),
                HookConfig::new("user32!SetFocus", PriorityClass::Focus),
                HookConfig::new("user32!SetWindowTextW", PriorityClass::Normal),
                HookConfig::new("comctl32!SendProgressStep", PriorityClass::Background),
            ],
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            controller: "127.0.0.1:7411".into(),
            connect_timeout_ms: 5_000,
            send_timeout_ms: 250,
            linger_ms: 500,
            heartbeat_ms: 5_000,
            idle_timeout_ms: 15_000,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 5_000,
            detach_timeout_ms: 2_000,
        }
    }
}

impl Default for LimiterSection {
    fn default() -> Self {
        let defaults = LimiterConfig::default();
        Self {
            window_ms: defaults.window.as_millis() as u64,
            submit_capacity: defaults.submit_capacity,
            send_retries: defaults.send_retries,
            critical: defaults.policy(PriorityClass::Critical).into(),
            focus: defaults.policy(PriorityClass::Focus).into(),
            normal: defaults.policy(PriorityClass::Normal).into(),
            background: defaults.policy(PriorityClass::Background).into(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            calls_per_second: 200,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            stats_interval_secs: 10,
        }
    }
}

impl HookConfig {
    pub fn new(symbol: impl Into<String>, priority: PriorityClass) -> Self {
        Self {
            symbol: symbol.into(),
            priority,
        }
    }
}

impl From<&ClassPolicy> for ClassSection {
    fn from(policy: &ClassPolicy) -> Self {
        Self {
            budget: policy.budget,
            overflow: policy.overflow,
            max_queued: policy.max_queued,
        }
    }
}

impl From<ClassSection> for ClassPolicy {
    fn from(section: ClassSection) -> Self {
        ClassPolicy {
            budget: section.budget,
            overflow: section.overflow,
            max_queued: section.max_queued,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

fn millis_or_off(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl HelperConfig {
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

    pub fn to_limiter_config(&self) -> LimiterConfig {
        let section = &self.limiter;
        LimiterConfig {
            window: Duration::from_millis(section.window_ms.max(1)),
            classes: [
                section.critical.into(),
                section.focus.into(),
                section.normal.into(),
                section.background.into(),
            ],
            submit_capacity: section.submit_capacity.max(1),
            send_retries: section.send_retries,
        }
    }

    pub fn to_channel_options(&self) -> ChannelOptions {
        let net = &self.network;
        ChannelOptions {
            connect_timeout: Duration::from_millis(net.connect_timeout_ms),
            send_timeout: Duration::from_millis(net.send_timeout_ms),
            linger: Duration::from_millis(net.linger_ms),
            heartbeat: millis_or_off(net.heartbeat_ms),
            idle_timeout: millis_or_off(net.idle_timeout_ms),
            ..ChannelOptions::default()
        }
    }

    /// Build runtime options. Fails only on a malformed controller
    /// address.
    pub fn to_helper_options(&self) -> Result<HelperOptions, RelayError> {
        let controller: Endpoint = self.network.controller.parse()?;
        let net = &self.network;
        Ok(HelperOptions {
            controller,
            process: ProcessIdentity::current(),
            channel: self.to_channel_options(),
            limiter: self.to_limiter_config(),
            reconnect_initial: Duration::from_millis(net.reconnect_initial_ms.max(1)),
            reconnect_max: Duration::from_millis(net.reconnect_max_ms.max(net.reconnect_initial_ms)),
            detach_timeout: Duration::from_millis(net.detach_timeout_ms),
        })
    }

    pub fn hook_specs(&self) -> Vec<HookSpec> {
        self.hooks
            .iter()
            .map(|h| HookSpec::new(Symbol::new(&h.symbol), h.priority))
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&HelperConfig::default()).unwrap();
        assert!(text.contains("controller"));
        assert!(text.contains("[limiter.critical]"));
        assert!(text.contains("[[hooks]]"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = HelperConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: HelperConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: HelperConfig = toml::from_str(
            r#"
            [network]
            controller = "10.0.0.5:9000"

            [limiter.normal]
            budget = 3
            overflow = "drop"
            max_queued = 8
            "#,
        )
        .unwrap();
        assert_eq!(parsed.network.controller, "10.0.0.5:9000");
        assert_eq!(parsed.network.linger_ms, 500);

        let limiter = parsed.to_limiter_config();
        let normal = limiter.policy(PriorityClass::Normal);
        assert_eq!(normal.budget, 3);
        assert_eq!(normal.overflow, OverflowPolicy::Drop);
        assert_eq!(
            limiter.policy(PriorityClass::Critical).overflow,
            OverflowPolicy::Queue
        );
    }

    #[test]
    fn zero_disables_heartbeat_and_idle_timeout() {
        let mut cfg = HelperConfig::default();
        cfg.network.heartbeat_ms = 0;
        cfg.network.idle_timeout_ms = 0;
        let opts = cfg.to_channel_options();
        assert_eq!(opts.heartbeat, None);
        assert_eq!(opts.idle_timeout, None);
    }

    #[test]
    fn bad_controller_address_is_rejected() {
        let mut cfg = HelperConfig::default();
        cfg.network.controller = "nowhere".into();
        assert!(cfg.to_helper_options().is_err());
    }

    #[test]
    fn hook_specs_follow_config() {
        let specs = HelperConfig::default().hook_specs();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0].priority, PriorityClass::Critical);
        assert_eq!(specs[0].symbol.as_str(), "user32!GetForegroundWindow");
    }
}
