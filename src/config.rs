//! Configuration loading and validation.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// Main configuration for the DNS interception engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Whether IPv6 DNS servers should be mapped into the tunnel.
    #[serde(default)]
    pub ipv6_enabled: bool,

    /// Probe the default DNS server to detect a dead tunnel.
    #[serde(default)]
    pub watchdog_enabled: bool,

    /// User applications that bypass the tunnel.
    #[serde(default)]
    pub excluded_apps: Vec<String>,

    /// Which system applications bypass the tunnel.
    #[serde(default)]
    pub excluded_system_apps: SystemAppExclusion,

    /// Size of the packet buffer pool.
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    /// Capacity of the queue carrying answers resolved off the event loop.
    #[serde(default = "default_completion_channel_capacity")]
    pub completion_channel_capacity: usize,

    /// Maximum number of cached host classifications.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// How allowed queries reach the real DNS servers.
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Inline host rules.
    #[serde(default)]
    pub rules: RuleSettings,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// System application exclusion policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAppExclusion {
    /// Every system application goes through the tunnel.
    #[default]
    None,
    /// Every system application bypasses the tunnel.
    All,
    /// System applications bypass the tunnel, except web browsers.
    AllExceptBrowsers,
}

/// Transport used for allowed queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamMode {
    /// Forward the raw query to the network DNS server over UDP.
    #[default]
    Udp,
    /// Resolve the query over DNS-over-HTTPS.
    Doh,
}

/// Upstream transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    #[serde(default)]
    pub mode: UpstreamMode,

    /// DNS-over-HTTPS endpoint.
    #[serde(default = "default_doh_url")]
    pub url: String,

    /// Addresses used to reach the DNS-over-HTTPS endpoint without DNS.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: Vec<IpAddr>,

    /// Request timeout in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            mode: UpstreamMode::default(),
            url: default_doh_url(),
            bootstrap: default_bootstrap(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

/// Inline host rules.
///
/// Patterns are exact names ("example.com") or wildcards ("*.example.com").
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSettings {
    #[serde(default)]
    pub blocked: Vec<String>,

    #[serde(default)]
    pub allowed: Vec<String>,

    /// Host pattern to redirect target.
    #[serde(default)]
    pub redirected: BTreeMap<String, String>,
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ipv6_enabled: false,
            watchdog_enabled: false,
            excluded_apps: Vec::new(),
            excluded_system_apps: SystemAppExclusion::default(),
            buffer_pool_size: default_buffer_pool_size(),
            completion_channel_capacity: default_completion_channel_capacity(),
            cache_capacity: default_cache_capacity(),
            upstream: UpstreamSettings::default(),
            rules: RuleSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

const fn default_buffer_pool_size() -> usize {
    64
}

const fn default_completion_channel_capacity() -> usize {
    256
}

const fn default_cache_capacity() -> u64 {
    4 * 1024
}

const fn default_upstream_timeout() -> u64 {
    10
}

fn default_doh_url() -> String {
    "https://cloudflare-dns.com/dns-query".to_string()
}

fn default_bootstrap() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
        IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
    ]
}

const fn default_metrics_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090)
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_pool_size == 0 {
            return Err(ConfigError::from(ValidationError::ZeroBufferPoolSize).into());
        }
        if self.completion_channel_capacity == 0 {
            return Err(ConfigError::from(ValidationError::ZeroCompletionCapacity).into());
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::from(ValidationError::ZeroCacheCapacity).into());
        }
        if self.upstream.timeout_secs == 0 {
            return Err(ConfigError::from(ValidationError::ZeroUpstreamTimeout).into());
        }
        if self.upstream.mode == UpstreamMode::Doh {
            if !self.upstream.url.starts_with("https://") {
                return Err(ConfigError::from(ValidationError::InvalidDohUrl {
                    url: self.upstream.url.clone(),
                })
                .into());
            }
            if self.upstream.bootstrap.is_empty() {
                return Err(ConfigError::from(ValidationError::EmptyBootstrap).into());
            }
        }

        let patterns = self
            .rules
            .blocked
            .iter()
            .chain(&self.rules.allowed)
            .chain(self.rules.redirected.keys());
        for pattern in patterns {
            validate_pattern(pattern)?;
        }
        for (host, target) in &self.rules.redirected {
            if target.trim().is_empty() {
                return Err(ConfigError::from(ValidationError::EmptyRedirectTarget {
                    host: host.clone(),
                })
                .into());
            }
        }

        Ok(())
    }
}

fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(ConfigError::from(ValidationError::EmptyHostPattern).into());
    }
    if pattern.starts_with("*.") && pattern.len() <= 2 {
        return Err(ConfigError::from(ValidationError::InvalidWildcardPattern {
            pattern: pattern.to_string(),
        })
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let config = EngineConfig::parse("").unwrap();
        assert!(!config.ipv6_enabled);
        assert!(!config.watchdog_enabled);
        assert!(config.excluded_apps.is_empty());
        assert_eq!(config.excluded_system_apps, SystemAppExclusion::None);
        assert_eq!(config.buffer_pool_size, 64);
        assert_eq!(config.completion_channel_capacity, 256);
        assert_eq!(config.cache_capacity, 4096);
        assert_eq!(config.upstream.mode, UpstreamMode::Udp);
        assert_eq!(config.upstream.bootstrap.len(), 2);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            ipv6_enabled = true
            watchdog_enabled = true
            excluded_apps = ["com.example.bank"]
            excluded_system_apps = "all_except_browsers"

            [upstream]
            mode = "doh"
            url = "https://dns.example/dns-query"
            bootstrap = ["9.9.9.9"]
            timeout_secs = 5

            [rules]
            blocked = ["ads.example.com", "*.tracker.net"]
            allowed = ["good.tracker.net"]

            [rules.redirected]
            "safe.example.com" = "0.0.0.0"
        "#;

        let config = EngineConfig::parse(toml).unwrap();
        assert!(config.ipv6_enabled);
        assert!(config.watchdog_enabled);
        assert_eq!(config.excluded_apps, vec!["com.example.bank"]);
        assert_eq!(
            config.excluded_system_apps,
            SystemAppExclusion::AllExceptBrowsers
        );
        assert_eq!(config.upstream.mode, UpstreamMode::Doh);
        assert_eq!(config.upstream.timeout_secs, 5);
        assert_eq!(config.rules.blocked.len(), 2);
        assert_eq!(
            config.rules.redirected.get("safe.example.com").map(String::as_str),
            Some("0.0.0.0")
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "watchdog_enabled = true").unwrap();
        file.flush().unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert!(config.watchdog_enabled);
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(EngineConfig::load("/nonexistent/nullroute.toml").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(EngineConfig::parse("unknown_field = 1").is_err());
    }

    #[test]
    fn test_zero_buffer_pool_rejected() {
        assert!(EngineConfig::parse("buffer_pool_size = 0").is_err());
    }

    #[test]
    fn test_zero_completion_capacity_rejected() {
        assert!(EngineConfig::parse("completion_channel_capacity = 0").is_err());
    }

    #[test]
    fn test_plain_http_doh_rejected() {
        let toml = r#"
            [upstream]
            mode = "doh"
            url = "http://dns.example/dns-query"
        "#;
        assert!(EngineConfig::parse(toml).is_err());
    }

    #[test]
    fn test_plain_http_url_allowed_for_udp_mode() {
        let toml = r#"
            [upstream]
            url = "http://dns.example/dns-query"
        "#;
        assert!(EngineConfig::parse(toml).is_ok());
    }

    #[test]
    fn test_empty_pattern_rejected() {
        let toml = r#"
            [rules]
            blocked = ["example.com", ""]
        "#;
        assert!(EngineConfig::parse(toml).is_err());
    }

    #[test]
    fn test_bare_wildcard_rejected() {
        let toml = r#"
            [rules]
            allowed = ["*."]
        "#;
        assert!(EngineConfig::parse(toml).is_err());
    }

    #[test]
    fn test_empty_redirect_target_rejected() {
        let toml = r#"
            [rules.redirected]
            "example.com" = " "
        "#;
        assert!(EngineConfig::parse(toml).is_err());
    }
}
