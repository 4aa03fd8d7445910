//! Fixed-window per-client request limiting.

use crate::config::RateLimitConfig;
use crate::error::ProxyError;
use actix_web::body::EitherBody;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{Error, ResponseError};
use dashmap::DashMap;
use futures_util::future::LocalBoxFuture;
use std::future::{Ready, ready};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    max_requests: u32,
    clients: DashMap<String, Window>,
}

impl FixedWindowLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window(),
            max_requests: config.max_requests,
            clients: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, client: &str) -> Result<Admission, ProxyError> {
        self.check_at(client, Instant::now())
    }

    /// Count one request from `client` at `now`.
    pub fn check_at(&self, client: &str, now: Instant) -> Result<Admission, ProxyError> {
        let mut entry = self.clients.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.started));
            return Err(ProxyError::RateLimited { retry_after });
        }

        entry.count += 1;
        Ok(Admission {
            limit: self.max_requests,
            remaining: self.max_requests - entry.count,
        })
    }

    /// Drop windows that have already expired.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        before - self.clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

/// Periodically prune expired client windows. Does nothing for a zero window.
pub async fn sweep_expired(limiter: Arc<FixedWindowLimiter>) {
    if limiter.window().is_zero() {
        log::warn!("Rate limit window is zero, expired-window sweep disabled");
        return;
    }
    let mut interval = tokio::time::interval(limiter.window());
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = limiter.sweep_at(Instant::now());
        if removed > 0 {
            log::debug!("Rate limiter dropped {} expired client windows", removed);
        }
    }
}

/// Middleware applying a [`FixedWindowLimiter`] keyed by peer address.
pub struct RateLimit {
    limiter: Arc<FixedWindowLimiter>,
}

impl RateLimit {
    pub fn new(limiter: Arc<FixedWindowLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitService {
            service,
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct RateLimitService<S> {
    service: S,
    limiter: Arc<FixedWindowLimiter>,
}

fn client_key(req: &ServiceRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let client = client_key(&req);
        match self.limiter.check(&client) {
            Ok(admission) => {
                let fut = self.service.call(req);
                Box::pin(async move {
                    let mut res = fut.await?;
                    let headers = res.headers_mut();
                    headers.insert(
                        HeaderName::from_static("ratelimit-limit"),
                        HeaderValue::from(admission.limit),
                    );
                    headers.insert(
                        HeaderName::from_static("ratelimit-remaining"),
                        HeaderValue::from(admission.remaining),
                    );
                    Ok(res.map_into_left_body())
                })
            }
            Err(err) => {
                log::warn!("Rate limit exceeded for client {} on {}", client, req.path());
                let response = err.error_response();
                Box::pin(async move { Ok(req.into_response(response).map_into_right_body()) })
            }
        }
    }
}
