//! Runtime configuration for the three entry points.
//!
//! Values come from the command line / environment once at startup; the
//! `Default` impls carry the same defaults as the CLI so tests can build
//! configs directly.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_UPSTREAM_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    /// Missing key is not fatal at startup; requests fail with a config error.
    pub api_key: Option<String>,
    pub model: String,
    pub referer: String,
    pub title: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            referer: "http://localhost:3000".to_string(),
            title: "chat-relay".to_string(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: u32,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 15 * 60,
            max_requests: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub max_payload_size: usize,
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            max_payload_size: 1024 * 1024,
            upstream: UpstreamConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub host: String,
    pub port: u16,
    pub state_file: PathBuf,
    pub persist_interval_secs: u64,
    pub health_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3100,
            state_file: PathBuf::from("service-registry.json"),
            persist_interval_secs: 60,
            health_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub manifest: PathBuf,
    pub grace_period: Duration,
    pub autostart: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("dev-services.json"),
            grace_period: Duration::from_secs(5),
            autostart: true,
        }
    }
}
