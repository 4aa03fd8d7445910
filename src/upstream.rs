use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::io_struct::ChatRequest;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::pin::Pin;
use std::time::Duration;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

pub enum UpstreamBody {
    Full(Bytes),
    Stream(ByteStream),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: UpstreamBody,
}

/// Client for the third-party chat completion endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn headers(&self) -> Result<HeaderMap, ProxyError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProxyError::Config("upstream API key is not configured".to_string()))?;

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| ProxyError::Config("upstream API key is not a valid header".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(referer) = HeaderValue::from_str(&self.config.referer) {
            headers.insert("HTTP-Referer", referer);
        }
        if let Ok(title) = HeaderValue::from_str(&self.config.title) {
            headers.insert("X-Title", title);
        }
        Ok(headers)
    }

    /// Send a chat request upstream.
    ///
    /// Non-2xx replies are returned as [`ProxyError::Upstream`] with the full
    /// upstream body, for streaming requests too.
    pub async fn send(&self, request: &ChatRequest) -> Result<UpstreamResponse, ProxyError> {
        let headers = self.headers()?;
        let resp = self
            .client
            .post(&self.config.url)
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            log::warn!(
                "Upstream {} returned {}: {}",
                self.config.url,
                status,
                String::from_utf8_lossy(&body)
            );
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let body = if request.is_stream() {
            UpstreamBody::Stream(resp.bytes_stream().boxed())
        } else {
            UpstreamBody::Full(resp.bytes().await?)
        };
        Ok(UpstreamResponse {
            status: status.as_u16(),
            body,
        })
    }
}
