use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::io_struct::ChatRequest;
use crate::middleware::{RequestIdMiddleware, get_request_id};
use crate::rate_limit::{FixedWindowLimiter, RateLimit, sweep_expired};
use crate::relay::relay;
use crate::upstream::{UpstreamBody, UpstreamClient};
use actix_web::http::StatusCode;
use actix_web::http::header::{CACHE_CONTROL, CONTENT_TYPE, ContentType};
use actix_web::{HttpRequest, HttpResponse, HttpServer, web};
use serde_json::{Value, json};
use std::sync::Arc;

/// Paths the chat endpoint answers on; each also gets a `/ping` sibling.
pub const CHAT_PATHS: [&str; 4] = [
    "/ai-chat",
    "/api/ai-chat",
    "/api/chat/ai-chat",
    "/api/proxy/ai-chat",
];

#[derive(Debug, Clone)]
pub struct ProxyState {
    pub upstream: UpstreamClient,
}

impl ProxyState {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        Ok(Self {
            upstream: UpstreamClient::new(config.upstream.clone())?,
        })
    }
}

pub async fn ai_chat(
    req: HttpRequest,
    body: web::Json<Value>,
    state: web::Data<ProxyState>,
) -> Result<HttpResponse, ProxyError> {
    let request_id = get_request_id(&req);
    let mut chat = ChatRequest::from_body(body.into_inner()).inspect_err(|e| {
        log::info!("[{}] Rejected chat request: {}", request_id, e);
    })?;
    chat.apply_default_model(&state.upstream.config().model);

    log::info!(
        "[{}] Chat request: model={} messages={} stream={}",
        request_id,
        chat.model.as_deref().unwrap_or_default(),
        chat.messages.len(),
        chat.stream
    );

    let resp = state.upstream.send(&chat).await.inspect_err(|e| match e {
        ProxyError::Config(msg) => log::error!("[{}] {}", request_id, msg),
        other => log::warn!("[{}] Upstream call failed: {}", request_id, other),
    })?;

    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK);
    match resp.body {
        UpstreamBody::Full(body) => Ok(HttpResponse::build(status)
            .insert_header(ContentType::json())
            .body(body)),
        UpstreamBody::Stream(upstream) => Ok(HttpResponse::build(status)
            .insert_header((CONTENT_TYPE, "text/event-stream"))
            .insert_header((CACHE_CONTROL, "no-cache"))
            .insert_header(("X-Accel-Buffering", "no"))
            .streaming(relay(upstream, request_id))),
    }
}

pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "ai-chat",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "chat-relay",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

fn json_config(max_payload_size: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(max_payload_size)
        .error_handler(|err, _req| {
            ProxyError::InvalidRequest(format!("Invalid JSON payload: {}", err)).into()
        })
}

/// Register the chat routes. Only the chat POST routes are rate limited.
/// The limiter wraps the resource, so it runs before validation and
/// rejected bodies still use up quota.
pub fn configure(
    cfg: &mut web::ServiceConfig,
    state: web::Data<ProxyState>,
    limiter: Arc<FixedWindowLimiter>,
    max_payload_size: usize,
) {
    cfg.app_data(state)
        .app_data(json_config(max_payload_size))
        .route("/health", web::get().to(health));

    for path in CHAT_PATHS {
        cfg.route(&format!("{}/ping", path), web::get().to(ping))
            .service(
                web::resource(path)
                    .wrap(RateLimit::new(limiter.clone()))
                    .route(web::post().to(ai_chat)),
            );
    }
}

pub async fn startup(config: ProxyConfig) -> anyhow::Result<()> {
    let state = web::Data::new(ProxyState::new(&config)?);
    let limiter = Arc::new(FixedWindowLimiter::new(&config.rate_limit));

    if config.upstream.api_key.is_none() {
        log::warn!("No upstream API key configured; chat requests will fail until one is set");
    }

    actix_web::rt::spawn(sweep_expired(limiter.clone()));

    log::info!(
        "Starting chat proxy at {}:{} (upstream {}, default model {})",
        config.host,
        config.port,
        config.upstream.url,
        config.upstream.model
    );

    let max_payload_size = config.max_payload_size;
    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(RequestIdMiddleware)
            .wrap(actix_web::middleware::Logger::default())
            .configure(|cfg| configure(cfg, state.clone(), limiter.clone(), max_payload_size))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    log::info!("Chat proxy stopped");
    Ok(())
}
