// SPDX-License-Identifier: MIT
//! Layered configuration: built-in defaults → optional TOML file → CLI flags/env.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Proxy-wide tunables. Cloned into every component that needs one of these
/// values rather than passed as a shared reference — they're small and
/// effectively immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_host: String,
    pub port: u16,

    pub max_console_messages: usize,
    pub max_network_requests: usize,

    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
    pub domain_enable_timeout_ms: u64,

    pub health_check_interval_ms: u64,
    pub health_check_failure_threshold: u32,

    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,

    pub auto_shutdown_timeout_ms: u64,
    pub maintenance_sweep_interval_ms: u64,

    pub max_body_bytes: usize,
    pub rate_limit_per_minute: u32,
    pub sensitive_rate_limit_per_minute: u32,

    /// Additional hosts allowed through the `/api/connect` host allowlist,
    /// beyond localhost/127.0.0.1 and the private ranges baked into §4.7.
    pub allowed_hosts: Vec<String>,

    pub log_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: "localhost".to_string(),
            port: 9223,
            max_console_messages: 1000,
            max_network_requests: 500,
            connect_timeout_ms: 10_000,
            command_timeout_ms: 30_000,
            health_check_timeout_ms: 5_000,
            domain_enable_timeout_ms: 5_000,
            health_check_interval_ms: 30_000,
            health_check_failure_threshold: 3,
            reconnect_base_delay_ms: 500,
            reconnect_max_attempts: 8,
            auto_shutdown_timeout_ms: 300_000,
            maintenance_sweep_interval_ms: 60_000,
            max_body_bytes: 10 * 1024 * 1024,
            rate_limit_per_minute: 100,
            sensitive_rate_limit_per_minute: 25,
            allowed_hosts: Vec::new(),
            log_dir: None,
        }
    }
}

/// On-disk TOML shape. Every field optional — only present fields override
/// the built-in default, and the CLI layer overrides these in turn.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    bind_host: Option<String>,
    port: Option<u16>,
    max_console_messages: Option<usize>,
    max_network_requests: Option<usize>,
    auto_shutdown_timeout_ms: Option<u64>,
    health_check_interval_ms: Option<u64>,
    allowed_hosts: Option<Vec<String>>,
    log_dir: Option<PathBuf>,
}

impl ProxyConfig {
    /// Merge an optional TOML file on top of the defaults. Schema validation
    /// of arbitrary user files is out of scope — unknown keys are ignored by
    /// `toml`'s default deserialization behavior; we only validate the fields
    /// we actually consume, in [`ProxyConfig::validate`].
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(path) = config_path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let toml_cfg: TomlConfig = toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            cfg.apply_toml(toml_cfg);
        }
        Ok(cfg)
    }

    fn apply_toml(&mut self, t: TomlConfig) {
        if let Some(v) = t.bind_host {
            self.bind_host = v;
        }
        if let Some(v) = t.port {
            self.port = v;
        }
        if let Some(v) = t.max_console_messages {
            self.max_console_messages = v;
        }
        if let Some(v) = t.max_network_requests {
            self.max_network_requests = v;
        }
        if let Some(v) = t.auto_shutdown_timeout_ms {
            self.auto_shutdown_timeout_ms = v;
        }
        if let Some(v) = t.health_check_interval_ms {
            self.health_check_interval_ms = v;
        }
        if let Some(v) = t.allowed_hosts {
            self.allowed_hosts = v;
        }
        if let Some(v) = t.log_dir {
            self.log_dir = Some(v);
        }
    }

    /// Reject the handful of values that would make the proxy meaningless.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_console_messages > 0, "max_console_messages must be > 0");
        anyhow::ensure!(self.max_network_requests > 0, "max_network_requests must be > 0");
        anyhow::ensure!(self.port > 0, "port must be nonzero");
        anyhow::ensure!(
            self.reconnect_max_attempts > 0,
            "reconnect_max_attempts must be > 0"
        );
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
    pub fn domain_enable_timeout(&self) -> Duration {
        Duration::from_millis(self.domain_enable_timeout_ms)
    }
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
    pub fn auto_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_shutdown_timeout_ms)
    }
    pub fn maintenance_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_sweep_interval_ms)
    }
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Default log directory per §6: `~/.chrome-cdp-cli/logs/`.
    pub fn default_log_dir() -> PathBuf {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".chrome-cdp-cli").join("logs")
    }

    /// Host allowlist check for `/api/connect` (§4.7 step 6).
    pub fn host_allowed(&self, host: &str) -> bool {
        if host == "localhost" || host == "127.0.0.1" {
            return true;
        }
        if self.allowed_hosts.iter().any(|h| h == host) {
            return true;
        }
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                let o = ip.octets();
                o[0] == 192 && o[1] == 168
                    || o[0] == 10
                    || (o[0] == 172 && (16..=31).contains(&o[1]))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_cap_fails_validation() {
        let mut cfg = ProxyConfig::default();
        cfg.max_console_messages = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn host_allowlist_covers_private_ranges() {
        let cfg = ProxyConfig::default();
        assert!(cfg.host_allowed("localhost"));
        assert!(cfg.host_allowed("127.0.0.1"));
        assert!(cfg.host_allowed("192.168.1.5"));
        assert!(cfg.host_allowed("10.0.0.1"));
        assert!(cfg.host_allowed("172.16.0.1"));
        assert!(cfg.host_allowed("172.31.255.255"));
        assert!(!cfg.host_allowed("172.32.0.1"));
        assert!(!cfg.host_allowed("example.com"));
    }

    #[test]
    fn toml_overrides_only_present_fields() {
        let mut cfg = ProxyConfig::default();
        cfg.apply_toml(TomlConfig {
            port: Some(9999),
            ..Default::default()
        });
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.max_console_messages, 1000);
    }
}
