use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub origin: OriginConfig,
    pub cache: CacheConfig,
    pub redis: RedisConfig,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Scheme clients use to reach this edge; forwarded as `X-Forwarded-Proto`.
    pub scheme: Scheme,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            scheme: Scheme::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OriginConfig {
    pub base_url: String,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
    pub max_entries: usize,
    pub cacheable_prefixes: Vec<String>,
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
            cacheable_prefixes: vec![
                "/api/news".to_string(),
                "/api/statistics".to_string(),
                "/api/health".to_string(),
            ],
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    /// Upper bound on a single command round trip.
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "edge:".to_string(),
            response_timeout: Duration::from_millis(500),
            connection_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Value of the `X-Powered-By` header on forwarded responses.
    pub powered_by: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            powered_by: "edge-cache-proxy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub access_log: AccessLogConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            access_log: AccessLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessLogConfig {
    pub enabled: bool,
    /// `stdout` or a file path opened in append mode
    pub output: String,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output: "stdout".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
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
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        let base_url = self.origin.base_url.trim();
        if base_url.is_empty() {
            anyhow::bail!("Origin base_url cannot be empty");
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            anyhow::bail!("Origin base_url must be an http(s) URL: {}", base_url);
        }

        if self.origin.timeout.is_zero() {
            anyhow::bail!("Origin timeout cannot be zero");
        }

        if self.cache.ttl.is_zero() {
            anyhow::bail!("Cache TTL cannot be zero");
        }

        if self.cache.max_entries == 0 {
            anyhow::bail!("Cache max_entries cannot be zero");
        }

        for prefix in &self.cache.cacheable_prefixes {
            if !prefix.starts_with('/') {
                anyhow::bail!("Cacheable prefix must start with '/': {}", prefix);
            }
        }

        if self.cache.backend == CacheBackend::Redis && self.redis.url.is_empty() {
            anyhow::bail!("Redis url cannot be empty when the redis cache backend is selected");
        }

        if self.redis.response_timeout.is_zero() || self.redis.connection_timeout.is_zero() {
            anyhow::bail!("Redis timeouts must be greater than zero");
        }

        if self.proxy.powered_by.trim().is_empty() {
            anyhow::bail!("proxy.powered_by cannot be empty");
        }

        if self.metrics.enabled && self.metrics.port == self.server.port {
            anyhow::bail!("Metrics port {} collides with the server port", self.metrics.port);
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(scaled(num, 60)?))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(scaled(num, 3600)?))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }

    fn scaled(
        num: &str,
        factor: u64,
    ) -> std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let value: u64 = num.trim().parse()?;
        value
            .checked_mul(factor)
            .ok_or_else(|| format!("duration '{}' is too large", num.trim()).into())
    }
}
