use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub rewrite: RewriteConfig,
    pub visitors: VisitorsConfig,
    pub activity_log: ActivityLogConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL used when building proxied links. Derived from the inbound
    /// `Host` header when unset.
    pub public_base_url: Option<String>,
    /// Honor `X-Forwarded-For`, `X-Forwarded-Host` and `X-Forwarded-Proto`.
    pub trust_forwarded_headers: bool,
    pub fingerprint_header: String,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_base_url: None,
            trust_forwarded_headers: false,
            fingerprint_header: "x-visitor-fingerprint".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub user_agent: Option<String>,
    pub accept_invalid_certs: bool,
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            follow_redirects: true,
            max_redirects: 10,
            user_agent: None,
            accept_invalid_certs: true,
            pool_max_idle_per_host: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeignRedirectPolicy {
    /// Rewrite the foreign `Location` into proxied form.
    Proxy,
    /// Leave the foreign `Location` untouched.
    Passthrough,
    /// Refuse the response with a 403.
    Block,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RewriteConfig {
    pub proxy_path: String,
    pub foreign_redirects: ForeignRedirectPolicy,
    /// Text bodies above this size are streamed through untouched.
    pub max_body_bytes: usize,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            proxy_path: "/api/proxy".to_string(),
            foreign_redirects: ForeignRedirectPolicy::Proxy,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VisitorsConfig {
    /// Single addresses (`203.0.113.7`) or networks (`10.0.0.0/8`).
    pub blocked_ips: Vec<String>,
    /// Unblocked visitors not seen for this long are forgotten.
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub cleanup_interval: Duration,
}

impl Default for VisitorsConfig {
    fn default() -> Self {
        Self {
            blocked_ips: Vec::new(),
            idle_timeout: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActivityLogConfig {
    pub enabled: bool,
    pub output: String,
    pub file_path: Option<String>,
}

impl Default for ActivityLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output: "stdout".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/metrics".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.server.fingerprint_header.trim().is_empty() {
            anyhow::bail!("Fingerprint header name cannot be empty");
        }

        if let Some(base) = &self.server.public_base_url {
            let parsed = Url::parse(base)
                .with_context(|| format!("Invalid public_base_url: {}", base))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("public_base_url must use http or https: {}", base);
            }
        }

        if self.upstream.timeout.is_zero() || self.upstream.connect_timeout.is_zero() {
            anyhow::bail!("Upstream timeouts must be greater than zero");
        }

        if self.upstream.follow_redirects && self.upstream.max_redirects == 0 {
            anyhow::bail!("max_redirects must be positive when follow_redirects is enabled");
        }

        if !self.rewrite.proxy_path.starts_with('/') {
            anyhow::bail!("Proxy path must start with '/': {}", self.rewrite.proxy_path);
        }

        for entry in &self.visitors.blocked_ips {
            parse_network(entry)?;
        }

        if self.visitors.cleanup_interval.is_zero() {
            anyhow::bail!("visitors.cleanup_interval must be greater than zero");
        }

        match self.activity_log.output.as_str() {
            "stdout" => {}
            "file" => {
                if self.activity_log.file_path.as_deref().map_or(true, str::is_empty) {
                    anyhow::bail!("activity_log.file_path is required when output is 'file'");
                }
            }
            other => anyhow::bail!("Unknown activity log output: {}", other),
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown logging format: {}", self.logging.format);
        }

        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            anyhow::bail!("Metrics path must start with '/': {}", self.metrics.path);
        }

        Ok(())
    }
}

/// Parse a blocklist entry, accepting bare addresses as host-length networks.
pub fn parse_network(entry: &str) -> Result<ipnet::IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<ipnet::IpNet>() {
        return Ok(net);
    }
    let addr = entry
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("Invalid blocked IP or network: {}", entry))?;
    Ok(ipnet::IpNet::from(addr))
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(num.trim().parse::<u64>()? * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(num.trim().parse::<u64>()? * 3600))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}
