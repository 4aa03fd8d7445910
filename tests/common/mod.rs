pub mod mock_upstream;

use actix_web::web;
use chat_relay::config::{ProxyConfig, RateLimitConfig, UpstreamConfig};
use chat_relay::rate_limit::FixedWindowLimiter;
use chat_relay::server::ProxyState;
use std::sync::Arc;

pub const TEST_API_KEY: &str = "sk-test-key";

pub fn proxy_config(upstream_url: &str, api_key: Option<&str>) -> ProxyConfig {
    ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_payload_size: 64 * 1024,
        upstream: UpstreamConfig {
            url: upstream_url.to_string(),
            api_key: api_key.map(str::to_string),
            model: "mock/default-model".to_string(),
            referer: "http://localhost:3000".to_string(),
            title: "chat-relay-tests".to_string(),
            timeout_secs: 10,
        },
        rate_limit: RateLimitConfig::default(),
    }
}

pub fn proxy_parts(config: &ProxyConfig) -> (web::Data<ProxyState>, Arc<FixedWindowLimiter>) {
    let state = web::Data::new(ProxyState::new(config).unwrap());
    let limiter = Arc::new(FixedWindowLimiter::new(&config.rate_limit));
    (state, limiter)
}
